//! Download manager
//!
//! Owns the lifecycle of a download: pre-sizing the output file, the
//! tracker announces, the peer sessions and the progress task.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::download::progress::{ProgressCallback, ProgressReport, ProgressTracker};
use crate::download::swarm::{wait_for_flag, RunStatus, Swarm};
use crate::error::{Result, TorrentError};
use crate::peer::{ConnectionTimeouts, PeerManager};
use crate::storage::OutputFile;
use crate::torrent::TorrentInfo;
use crate::tracker::response::MIN_ANNOUNCE_INTERVAL;
use crate::tracker::{AnnounceEvent, AnnounceRequest, Announcer};

/// How a download run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Every piece verified and written
    Completed,
    /// `stop()` was called first
    Stopped,
}

/// Download manager
pub struct DownloadManager {
    torrent: TorrentInfo,
    output_path: PathBuf,
    config: Config,
    announcer: Arc<dyn Announcer>,
    progress_callback: Option<ProgressCallback>,
    running: AtomicBool,
    status: Arc<watch::Sender<RunStatus>>,
    run: Mutex<Option<Arc<Swarm>>>,
}

impl DownloadManager {
    /// Create a manager that will write `torrent` to `output_path`
    pub fn new(torrent: TorrentInfo, output_path: PathBuf, config: Config, announcer: Arc<dyn Announcer>) -> Self {
        let (status, _) = watch::channel(RunStatus::Idle);
        Self {
            torrent,
            output_path,
            config,
            announcer,
            progress_callback: None,
            running: AtomicBool::new(false),
            status: Arc::new(status),
            run: Mutex::new(None),
        }
    }

    /// Register the callback that receives periodic progress reports
    pub fn set_progress_callback(&mut self, callback: ProgressCallback) {
        self.progress_callback = Some(callback);
    }

    pub fn torrent(&self) -> &TorrentInfo {
        &self.torrent
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start downloading.
    ///
    /// The output file exists at full size and the STARTED announce has
    /// been attempted by the time this returns. A tracker failure is logged
    /// and does not fail the start.
    pub async fn start(&self) -> Result<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(TorrentError::lifecycle_error("Download is already running"));
        }

        match self.launch().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn launch(&self) -> Result<()> {
        let mut run = self.run.lock().await;
        info!(
            "Starting download: {} ({} bytes, {} pieces)",
            self.torrent.name,
            self.torrent.total_size,
            self.torrent.piece_count()
        );

        let file = Arc::new(OutputFile::create(&self.output_path, self.torrent.total_size).await?);
        self.status.send_replace(RunStatus::Running);

        let swarm = Arc::new(Swarm::new(
            self.torrent.clone(),
            self.announcer.peer_id(),
            ConnectionTimeouts::from_config(&self.config),
            self.config.max_pipeline,
            self.config.strategy,
            file,
            PeerManager::new(self.config.max_connections, self.config.redial_cooldown),
            self.status.clone(),
        ));

        let interval = announce(&swarm, &*self.announcer, AnnounceEvent::Started)
            .await
            .unwrap_or(Duration::from_secs(MIN_ANNOUNCE_INTERVAL));

        {
            let mut tasks = swarm.tasks.lock().await;
            tasks.spawn(announce_loop(swarm.clone(), self.announcer.clone(), interval));
            tasks.spawn(progress_loop(
                swarm.clone(),
                self.config.progress_interval,
                self.progress_callback.clone(),
            ));
            tasks.spawn(completion_watch(
                swarm.clone(),
                self.announcer.clone(),
                self.progress_callback.clone(),
            ));
        }

        if swarm.is_complete().await {
            swarm.completed.notify_one();
        } else {
            swarm.dial().await;
        }

        *run = Some(swarm);
        Ok(())
    }

    /// Stop downloading: end every task, close the file, announce STOPPED.
    ///
    /// Stopping a manager that is not running does nothing.
    pub async fn stop(&self) -> Result<()> {
        let mut run = self.run.lock().await;
        let Some(swarm) = run.take() else {
            return Ok(());
        };
        info!("Stopping download: {}", self.torrent.name);

        swarm.shutdown.send_replace(true);
        swarm.tasks.lock().await.shutdown().await;
        swarm.peers.release_all().await;

        let closed = swarm.file.close().await;
        announce(&swarm, &*self.announcer, AnnounceEvent::Stopped).await;

        self.status.send_if_modified(|status| {
            if *status == RunStatus::Running {
                *status = RunStatus::Stopped;
                true
            } else {
                false
            }
        });
        self.running.store(false, Ordering::SeqCst);
        closed
    }

    /// Resolve once every piece is on disk or the download is stopped.
    ///
    /// A storage failure during the run is returned as the error.
    pub async fn wait_for_completion(&self) -> Result<DownloadOutcome> {
        let mut status = self.status.subscribe();
        let settled = status
            .wait_for(|s| *s != RunStatus::Running)
            .await
            .map_err(|_| TorrentError::lifecycle_error("Download manager went away"))?
            .clone();

        match settled {
            RunStatus::Completed => Ok(DownloadOutcome::Completed),
            RunStatus::Stopped => Ok(DownloadOutcome::Stopped),
            RunStatus::Failed(e) => Err(e),
            RunStatus::Idle | RunStatus::Running => Err(TorrentError::lifecycle_error("Download was never started")),
        }
    }

    /// Current progress, or `None` when not running
    pub async fn progress(&self) -> Option<ProgressReport> {
        let swarm = self.run.lock().await.clone()?;
        let mut tracker = ProgressTracker::new(swarm.downloaded());
        Some(snapshot(&swarm, &mut tracker).await)
    }
}

/// Announce the run's current state; returns the tracker's next interval
async fn announce(swarm: &Swarm, announcer: &dyn Announcer, event: AnnounceEvent) -> Option<Duration> {
    let left = swarm.torrent.total_size - swarm.verified_bytes().await;
    let request = AnnounceRequest {
        info_hash: swarm.torrent.info_hash,
        event,
        downloaded: swarm.downloaded(),
        uploaded: 0,
        left,
    };

    match announcer.announce(&swarm.torrent.trackers, &request).await {
        Ok(response) => {
            let mut addrs = Vec::with_capacity(response.peers.len());
            for peer in &response.peers {
                if let Some(addr) = peer.resolve().await {
                    addrs.push(addr);
                }
            }
            let added = swarm.peers.add_peers(addrs).await;
            info!(
                "Announce {:?}: {} peers ({} new), {} seeders, {} leechers",
                event,
                response.peers.len(),
                added,
                response.seeders,
                response.leechers
            );
            Some(response.announce_interval())
        }
        Err(e) => {
            warn!("Announce {:?} failed, continuing: {}", event, e);
            None
        }
    }
}

async fn announce_loop(swarm: Arc<Swarm>, announcer: Arc<dyn Announcer>, mut interval: Duration) {
    let mut shutdown = swarm.shutdown_signal();
    let mut next_announce = Instant::now() + interval;
    loop {
        let redial_at = swarm.peers.next_redial_at().await;
        tokio::select! {
            _ = wait_for_flag(&mut shutdown) => return,
            _ = sleep_until(next_announce) => {
                if let Some(next) = announce(&swarm, &*announcer, AnnounceEvent::None).await {
                    interval = next;
                }
                next_announce = Instant::now() + interval;
                debug!("Next announce in {}s", interval.as_secs());
            }
            _ = swarm.slot_freed.notified() => {}
            _ = sleep_until(redial_at.unwrap_or(next_announce)), if redial_at.is_some() => {
                trace!("Redial cooldown elapsed");
            }
        }
        swarm.dial().await;
    }
}

async fn progress_loop(swarm: Arc<Swarm>, every: Duration, callback: Option<ProgressCallback>) {
    let mut shutdown = swarm.shutdown_signal();
    let mut tracker = ProgressTracker::new(swarm.downloaded());
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    loop {
        tokio::select! {
            _ = wait_for_flag(&mut shutdown) => return,
            _ = ticker.tick() => {}
        }
        let report = snapshot(&swarm, &mut tracker).await;
        debug!(
            "Progress: {:.1}% ({}/{} pieces, {:.0} B/s, {} peers)",
            report.percent, report.pieces_done, report.piece_count, report.speed_bytes_per_sec, report.peers
        );
        if let Some(callback) = &callback {
            callback(&report);
        }
    }
}

async fn completion_watch(swarm: Arc<Swarm>, announcer: Arc<dyn Announcer>, callback: Option<ProgressCallback>) {
    swarm.completed.notified().await;
    info!("Download complete: {}", swarm.torrent.name);

    if let Some(callback) = &callback {
        let mut tracker = ProgressTracker::new(swarm.downloaded());
        callback(&snapshot(&swarm, &mut tracker).await);
    }
    announce(&swarm, &*announcer, AnnounceEvent::Completed).await;
    swarm.mark_completed();
}

async fn snapshot(swarm: &Swarm, tracker: &mut ProgressTracker) -> ProgressReport {
    let verified = swarm.verified_bytes().await;
    let pieces_done = swarm.pieces_done().await;
    let peers = swarm.peers.connection_count().await;
    tracker.sample(
        swarm.downloaded(),
        verified,
        swarm.torrent.total_size,
        pieces_done,
        swarm.torrent.piece_count(),
        peers,
    )
}
