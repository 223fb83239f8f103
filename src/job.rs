//! Download jobs
//!
//! The boundary a worker drives: a job request goes in, progress and a
//! single completion or failure come out through a [`JobObserver`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::download::{wait_for_flag, DownloadManager, DownloadOutcome, ProgressReport};
use crate::error::{Result, TorrentError};
use crate::torrent::{sanitize_file_name, MagnetInfo, MagnetParser, TorrentSource};
use crate::tracker::{AnnounceEvent, AnnounceRequest, Announcer, TrackerClient};

/// One download job as handed over by the job queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_id: String,
    pub video_id: String,
    /// Magnet link, `http(s)` URL of a `.torrent` file, or a local path
    pub source: String,
    pub output_directory: PathBuf,
}

impl JobRequest {
    /// Where the payload lands: `<output_directory>/<video_id>/<name>`
    pub fn output_path(&self, name: &str) -> PathBuf {
        self.output_directory
            .join(sanitize_file_name(&self.video_id))
            .join(sanitize_file_name(name))
    }
}

/// Why a job failed, as a short machine-readable code plus detail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The source could not be read, fetched or parsed
    InvalidSource(String),
    /// Only a magnet link was given and the metadata cannot be fetched
    MetadataUnavailable,
    /// The output file could not be created or written
    Storage(String),
    /// The download was driven out of order
    Lifecycle(String),
    /// The job was cancelled before completing
    Cancelled,
}

impl FailureReason {
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::InvalidSource(_) => "invalid_source",
            FailureReason::MetadataUnavailable => "metadata_unavailable",
            FailureReason::Storage(_) => "storage",
            FailureReason::Lifecycle(_) => "lifecycle",
            FailureReason::Cancelled => "cancelled",
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            FailureReason::InvalidSource(d) | FailureReason::Storage(d) | FailureReason::Lifecycle(d) => Some(d),
            FailureReason::MetadataUnavailable | FailureReason::Cancelled => None,
        }
    }

    /// Classify an error raised while running the download
    fn from_download_error(err: &TorrentError) -> Self {
        match err {
            TorrentError::LifecycleError { .. } => FailureReason::Lifecycle(err.to_string()),
            _ => FailureReason::Storage(err.to_string()),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.detail() {
            Some(detail) => write!(f, "{}: {}", self.code(), detail),
            None => write!(f, "{}", self.code()),
        }
    }
}

/// Receives a job's progress and its single terminal event
pub trait JobObserver: Send + Sync {
    fn on_progress(&self, job_id: &str, percent: f64, speed_bytes_per_sec: f64, eta_secs: Option<u64>);

    /// Called with the absolute path of the finished file
    fn on_complete(&self, job_id: &str, output_path: &Path);

    fn on_failure(&self, job_id: &str, reason: &FailureReason);
}

/// Final state of a job, in the shape the CLI prints
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobOutcome {
    pub job_id: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl JobOutcome {
    pub fn from_result(job_id: &str, result: &std::result::Result<PathBuf, FailureReason>) -> Self {
        match result {
            Ok(path) => Self {
                job_id: job_id.to_string(),
                status: "completed",
                output_path: Some(path.clone()),
                reason: None,
                detail: None,
            },
            Err(reason) => Self {
                job_id: job_id.to_string(),
                status: "failed",
                output_path: None,
                reason: Some(reason.code()),
                detail: reason.detail().map(str::to_string),
            },
        }
    }
}

/// Run one job to the end.
///
/// Resolves the source, downloads into the output path and reports through
/// `observer`. Flipping `cancel` to true stops the download and fails the
/// job with [`FailureReason::Cancelled`]. The configuration is expected to
/// be validated already.
pub async fn run_job(
    request: &JobRequest,
    config: &Config,
    observer: Arc<dyn JobObserver>,
    cancel: watch::Receiver<bool>,
) -> std::result::Result<PathBuf, FailureReason> {
    let result = execute(request, config, observer.clone(), cancel).await;
    match &result {
        Ok(path) => {
            info!("Job {} complete: {}", request.job_id, path.display());
            observer.on_complete(&request.job_id, path);
        }
        Err(reason) => {
            warn!("Job {} failed: {}", request.job_id, reason);
            observer.on_failure(&request.job_id, reason);
        }
    }
    result
}

async fn execute(
    request: &JobRequest,
    config: &Config,
    observer: Arc<dyn JobObserver>,
    mut cancel: watch::Receiver<bool>,
) -> std::result::Result<PathBuf, FailureReason> {
    info!("Job {} starting for video {}", request.job_id, request.video_id);

    let tracker = Arc::new(
        TrackerClient::from_config(config).map_err(|e| FailureReason::Lifecycle(e.to_string()))?,
    );
    let source = resolve_source(&request.source, &tracker)
        .await
        .map_err(|e| FailureReason::InvalidSource(e.to_string()))?;

    let torrent = match source {
        TorrentSource::Metainfo(info) => info,
        TorrentSource::Magnet(magnet) => {
            survey_swarm(&magnet, &*tracker).await;
            return Err(FailureReason::MetadataUnavailable);
        }
    };

    let output_path = request.output_path(&torrent.name);
    let mut manager = DownloadManager::new(torrent, output_path.clone(), config.clone(), tracker);
    {
        let job_id = request.job_id.clone();
        let observer = observer.clone();
        manager.set_progress_callback(Arc::new(move |report: &ProgressReport| {
            observer.on_progress(&job_id, report.percent, report.speed_bytes_per_sec, report.eta_secs);
        }));
    }

    manager
        .start()
        .await
        .map_err(|e| FailureReason::from_download_error(&e))?;

    let outcome = tokio::select! {
        outcome = manager.wait_for_completion() => outcome,
        _ = wait_for_flag(&mut cancel) => Ok(DownloadOutcome::Stopped),
    };

    if let Err(e) = manager.stop().await {
        error!("Failed to stop download cleanly: {}", e);
        if outcome.is_ok() {
            return Err(FailureReason::from_download_error(&e));
        }
    }

    match outcome {
        Ok(DownloadOutcome::Completed) => Ok(tokio::fs::canonicalize(&output_path).await.unwrap_or(output_path)),
        Ok(DownloadOutcome::Stopped) => Err(FailureReason::Cancelled),
        Err(e) => Err(FailureReason::from_download_error(&e)),
    }
}

/// Turn a job source string into torrent metadata or a magnet descriptor
pub async fn resolve_source(source: &str, tracker: &TrackerClient) -> Result<TorrentSource> {
    let source = source.trim();
    if MagnetParser::is_magnet_link(source) {
        return TorrentSource::from_magnet_link(source);
    }

    let bytes = if source.starts_with("http://") || source.starts_with("https://") {
        info!("Fetching torrent file from {}", source);
        tracker.fetch_bytes(source).await?
    } else {
        tokio::fs::read(source).await.map_err(|e| {
            TorrentError::decode_error_with_source(format!("Cannot read torrent file {}", source), e.to_string())
        })?
    };
    TorrentSource::from_torrent_file(&bytes)
}

/// Announce a magnet's hash so the swarm is at least discovered and logged
async fn survey_swarm(magnet: &MagnetInfo, announcer: &dyn Announcer) {
    let mut request = AnnounceRequest {
        info_hash: magnet.info_hash,
        event: AnnounceEvent::Started,
        downloaded: 0,
        uploaded: 0,
        left: magnet.exact_length.unwrap_or(0),
    };

    match announcer.announce(&magnet.trackers, &request).await {
        Ok(response) => info!(
            "Swarm for {} has {} peers ({} seeders); metadata exchange is unavailable",
            magnet.info_hash_hex(),
            response.peers.len(),
            response.seeders
        ),
        Err(e) => warn!("Announce for magnet {} failed: {}", magnet.info_hash_hex(), e),
    }

    request.event = AnnounceEvent::Stopped;
    if let Err(e) = announcer.announce(&magnet.trackers, &request).await {
        warn!("Stopped announce for magnet {} failed: {}", magnet.info_hash_hex(), e);
    }
}
