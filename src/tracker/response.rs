//! Tracker response decoding
//!
//! Bencoded announce responses, with peers in either the compact 6-byte
//! form or the original list-of-dictionaries form.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tracing::{debug, warn};

use crate::bencode::{self, BencodeValue};
use crate::error::{Result, TorrentError};

/// Lower bound applied to tracker intervals before scheduling
pub const MIN_ANNOUNCE_INTERVAL: u64 = 60;
/// Upper bound applied to tracker intervals before scheduling
pub const MAX_ANNOUNCE_INTERVAL: u64 = 3600;

const COMPACT_PEER_LEN: usize = 6;

/// A peer address handed out by a tracker
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerDescriptor {
    pub ip: String,
    pub port: u16,
    pub peer_id: Option<[u8; 20]>,
}

impl PeerDescriptor {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            peer_id: None,
        }
    }

    /// The socket address when `ip` is an address literal
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.ip.parse::<IpAddr>().ok().map(|ip| SocketAddr::new(ip, self.port))
    }

    /// Resolve to a socket address; hostnames are looked up without blocking the runtime
    pub async fn resolve(&self) -> Option<SocketAddr> {
        if let Some(addr) = self.socket_addr() {
            return Some(addr);
        }
        match tokio::net::lookup_host((self.ip.as_str(), self.port)).await {
            Ok(mut addrs) => addrs.next(),
            Err(e) => {
                debug!("Cannot resolve peer host {}: {}", self.ip, e);
                None
            }
        }
    }
}

/// Decoded announce response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerResponse {
    /// Seconds the tracker asks us to wait between announces, as sent
    pub interval: u64,
    pub min_interval: Option<u64>,
    pub tracker_id: Option<String>,
    pub seeders: u64,
    pub leechers: u64,
    pub peers: Vec<PeerDescriptor>,
    pub warning: Option<String>,
}

impl TrackerResponse {
    /// Interval to actually wait, clamped to a sane window
    pub fn announce_interval(&self) -> Duration {
        Duration::from_secs(self.interval.clamp(MIN_ANNOUNCE_INTERVAL, MAX_ANNOUNCE_INTERVAL))
    }

    /// Decode a bencoded response body
    pub fn parse(data: &[u8]) -> Result<Self> {
        let value = bencode::decode(data)
            .map_err(|e| TorrentError::tracker_error(format!("Invalid tracker response encoding: {}", e)))?;

        if value.as_dict().is_none() {
            return Err(TorrentError::tracker_error("Tracker response must be a dictionary"));
        }

        if let Some(reason) = value.get_bytes(b"failure reason") {
            let reason = String::from_utf8_lossy(reason).into_owned();
            warn!("Tracker reported failure: {}", reason);
            return Err(TorrentError::tracker_error(format!("Tracker failure: {}", reason)));
        }

        let warning = value
            .get_bytes(b"warning message")
            .map(|w| String::from_utf8_lossy(w).into_owned());
        if let Some(w) = &warning {
            warn!("Tracker warning: {}", w);
        }

        let interval = value
            .get_int(b"interval")
            .filter(|i| *i >= 0)
            .ok_or_else(|| TorrentError::tracker_error("Missing 'interval' in tracker response"))?
            as u64;

        let min_interval = value.get_int(b"min interval").filter(|i| *i >= 0).map(|i| i as u64);
        let tracker_id = value
            .get_bytes(b"tracker id")
            .map(|t| String::from_utf8_lossy(t).into_owned());
        let seeders = value.get_int(b"complete").filter(|i| *i >= 0).unwrap_or(0) as u64;
        let leechers = value.get_int(b"incomplete").filter(|i| *i >= 0).unwrap_or(0) as u64;

        let peers = parse_peers(value.get(b"peers"))?;
        debug!(
            "Tracker response: interval={}s, seeders={}, leechers={}, peers={}",
            interval,
            seeders,
            leechers,
            peers.len()
        );

        Ok(Self {
            interval,
            min_interval,
            tracker_id,
            seeders,
            leechers,
            peers,
            warning,
        })
    }
}

fn parse_peers(value: Option<&BencodeValue>) -> Result<Vec<PeerDescriptor>> {
    match value {
        None => Ok(Vec::new()),
        Some(BencodeValue::Bytes(data)) => parse_compact_peers(data),
        Some(BencodeValue::List(entries)) => Ok(entries.iter().filter_map(parse_peer_dict).collect()),
        Some(_) => Err(TorrentError::tracker_error("Invalid peers format")),
    }
}

/// Decode the compact peer list: 4 bytes IPv4 then 2 bytes big-endian port
pub fn parse_compact_peers(data: &[u8]) -> Result<Vec<PeerDescriptor>> {
    if data.len() % COMPACT_PEER_LEN != 0 {
        return Err(TorrentError::tracker_error(format!(
            "Invalid compact peers length: {}",
            data.len()
        )));
    }

    Ok(data
        .chunks_exact(COMPACT_PEER_LEN)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            PeerDescriptor::new(ip.to_string(), port)
        })
        .collect())
}

/// Entries missing an ip or a valid port are skipped rather than failing the whole list
fn parse_peer_dict(entry: &BencodeValue) -> Option<PeerDescriptor> {
    let ip = entry.get_str(b"ip")?.to_string();
    let port = u16::try_from(entry.get_int(b"port")?).ok()?;
    let peer_id = entry
        .get_bytes(b"peer id")
        .and_then(|b| <[u8; 20]>::try_from(b).ok());

    if ip.is_empty() {
        return None;
    }
    Some(PeerDescriptor { ip, port, peer_id })
}
