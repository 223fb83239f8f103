//! Download progress reporting

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Snapshot handed to the progress callback
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressReport {
    /// Verified pieces as a percentage of all pieces
    pub percent: f64,
    /// Payload bytes received in the last window, per second
    pub speed_bytes_per_sec: f64,
    /// Seconds until done at the current speed; unknown while stalled
    pub eta_secs: Option<u64>,
    /// Bytes verified and written
    pub verified_bytes: u64,
    pub total_bytes: u64,
    pub pieces_done: usize,
    pub piece_count: usize,
    /// Connection slots in use
    pub peers: usize,
}

/// Progress callback registered on a download
pub type ProgressCallback = Arc<dyn Fn(&ProgressReport) + Send + Sync>;

/// Turns counter samples into reports
#[derive(Debug)]
pub struct ProgressTracker {
    last_downloaded: u64,
    last_sample: Instant,
}

impl ProgressTracker {
    pub fn new(downloaded: u64) -> Self {
        Self {
            last_downloaded: downloaded,
            last_sample: Instant::now(),
        }
    }

    /// Build a report from the current counters and start a new window
    pub fn sample(
        &mut self,
        downloaded: u64,
        verified_bytes: u64,
        total_bytes: u64,
        pieces_done: usize,
        piece_count: usize,
        peers: usize,
    ) -> ProgressReport {
        let now = Instant::now();
        let window = now.duration_since(self.last_sample);
        let speed = speed(downloaded.saturating_sub(self.last_downloaded), window);
        self.last_downloaded = downloaded;
        self.last_sample = now;

        let percent = if piece_count == 0 || pieces_done >= piece_count {
            100.0
        } else {
            pieces_done as f64 / piece_count as f64 * 100.0
        };

        ProgressReport {
            percent,
            speed_bytes_per_sec: speed,
            eta_secs: eta(total_bytes.saturating_sub(verified_bytes), speed),
            verified_bytes,
            total_bytes,
            pieces_done,
            piece_count,
            peers,
        }
    }
}

fn speed(bytes: u64, window: Duration) -> f64 {
    let secs = window.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    bytes as f64 / secs
}

/// Seconds to move `remaining` bytes at `speed`; `None` when stalled
pub fn eta(remaining: u64, speed: f64) -> Option<u64> {
    if remaining == 0 {
        return Some(0);
    }
    if speed <= 0.0 {
        return None;
    }
    Some((remaining as f64 / speed).ceil() as u64)
}
