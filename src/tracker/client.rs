//! HTTP tracker client
//!
//! Announces over HTTP(S) and walks a torrent's tracker list until one
//! answers. UDP and WebSocket trackers are skipped.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Result, TorrentError};
use crate::protocol::Handshake;
use crate::tracker::response::TrackerResponse;
use crate::tracker::{AnnounceRequest, Announcer};

/// Tracker client holding one peer id for its whole lifetime
pub struct TrackerClient {
    http_client: reqwest::Client,
    peer_id: [u8; 20],
    port: u16,
    numwant: u32,
    /// `tracker id` values handed out by each tracker, echoed back on later announces
    tracker_ids: Mutex<HashMap<String, String>>,
}

impl TrackerClient {
    /// Create a client with a freshly generated peer id
    pub fn new(port: u16, numwant: u32, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("torrent-stream/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TorrentError::tracker_error(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            peer_id: Handshake::generate_peer_id(),
            port,
            numwant,
            tracker_ids: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.listen_port, config.numwant, config.tracker_timeout)
    }

    /// Fetch an arbitrary URL with the shared HTTP client (used for remote `.torrent` files)
    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        debug!("Fetching {}", url);
        let response = self.http_client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(TorrentError::tracker_error_with_url(
                format!("HTTP status {}", response.status()),
                url,
            ));
        }
        Ok(response.bytes().await?.to_vec())
    }

    /// Build the full announce URL for one tracker
    fn announce_url(&self, tracker_url: &str, request: &AnnounceRequest, tracker_id: Option<&str>) -> String {
        let mut url = tracker_url.to_string();
        url.push(if url.contains('?') { '&' } else { '?' });

        url.push_str("info_hash=");
        url.push_str(&urlencoding::encode_binary(&request.info_hash));
        url.push_str("&peer_id=");
        url.push_str(&urlencoding::encode_binary(&self.peer_id));
        url.push_str(&format!(
            "&port={}&uploaded={}&downloaded={}&left={}&compact=1&numwant={}",
            self.port, request.uploaded, request.downloaded, request.left, self.numwant
        ));

        url.push_str("&event=");
        url.push_str(request.event.as_str());
        if let Some(id) = tracker_id {
            url.push_str("&trackerid=");
            url.push_str(&urlencoding::encode(id));
        }
        url
    }

    /// Announce to a single HTTP(S) tracker
    pub async fn announce_to(&self, tracker_url: &str, request: &AnnounceRequest) -> Result<TrackerResponse> {
        let tracker_id = self.tracker_ids.lock().await.get(tracker_url).cloned();
        let url = self.announce_url(tracker_url, request, tracker_id.as_deref());
        debug!("Announcing {:?} to {}", request.event, tracker_url);

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| TorrentError::tracker_error_full("Tracker request failed", tracker_url, e.to_string()))?;

        if !response.status().is_success() {
            return Err(TorrentError::tracker_error_with_url(
                format!("Tracker returned status {}", response.status()),
                tracker_url,
            ));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| TorrentError::tracker_error_full("Failed to read tracker response", tracker_url, e.to_string()))?;

        let parsed = TrackerResponse::parse(&body).map_err(|e| e.with_context(tracker_url.to_string()))?;

        if let Some(id) = &parsed.tracker_id {
            self.tracker_ids.lock().await.insert(tracker_url.to_string(), id.clone());
        }
        Ok(parsed)
    }

    /// Try each tracker in order and return the first successful response
    pub async fn announce_any(&self, trackers: &[String], request: &AnnounceRequest) -> Result<TrackerResponse> {
        let mut last_error = None;

        for tracker in trackers {
            if !is_http_tracker(tracker) {
                debug!("Skipping non-HTTP tracker {}", tracker);
                continue;
            }
            match self.announce_to(tracker, request).await {
                Ok(response) => {
                    info!(
                        "Tracker {} returned {} peers (seeders={}, leechers={})",
                        tracker,
                        response.peers.len(),
                        response.seeders,
                        response.leechers
                    );
                    return Ok(response);
                }
                Err(e) => {
                    warn!("Announce to {} failed: {}", tracker, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| TorrentError::tracker_error("No HTTP tracker available")))
    }
}

#[async_trait]
impl Announcer for TrackerClient {
    fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    async fn announce(&self, trackers: &[String], request: &AnnounceRequest) -> Result<TrackerResponse> {
        self.announce_any(trackers, request).await
    }
}

fn is_http_tracker(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}
