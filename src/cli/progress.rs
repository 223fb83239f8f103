//! Progress display module
//!
//! Renders job progress on stderr so stdout carries only the final outcome.

use std::io::{self, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use crate::job::{FailureReason, JobObserver};

/// Format bytes to human readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed to human readable string
pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec as u64))
}

/// Format duration to human readable string
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// One progress line: bar, percentage, speed and ETA
pub fn render_progress_line(percent: f64, speed_bytes_per_sec: f64, eta_secs: Option<u64>) -> String {
    let bar_width: usize = 40;
    let filled = ((percent.clamp(0.0, 100.0) / 100.0) * bar_width as f64) as usize;
    let bar = "=".repeat(filled) + &" ".repeat(bar_width - filled);
    let eta = eta_secs
        .map(|secs| format_duration(Duration::from_secs(secs)))
        .unwrap_or_else(|| "∞".to_string());

    format!(
        "[{}] {:.1}% | ↓ {} | ETA: {}",
        bar,
        percent,
        format_speed(speed_bytes_per_sec),
        eta
    )
}

/// Terminal observer for a CLI job
pub struct ProgressDisplay {
    start_time: Instant,
    quiet: bool,
}

impl ProgressDisplay {
    /// Create a new progress display
    pub fn new(quiet: bool) -> Self {
        Self {
            start_time: Instant::now(),
            quiet,
        }
    }

    /// Check if quiet mode is enabled
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Get the elapsed time since start
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

impl JobObserver for ProgressDisplay {
    fn on_progress(&self, _job_id: &str, percent: f64, speed_bytes_per_sec: f64, eta_secs: Option<u64>) {
        if self.quiet {
            return;
        }
        let mut stderr = io::stderr().lock();
        let _ = write!(
            stderr,
            "\r\x1b[2K{}",
            render_progress_line(percent, speed_bytes_per_sec, eta_secs)
        );
        let _ = stderr.flush();
    }

    fn on_complete(&self, _job_id: &str, output_path: &Path) {
        if self.quiet {
            return;
        }
        eprintln!(
            "\r\x1b[2KDownload complete: {} (in {})",
            output_path.display(),
            format_duration(self.elapsed())
        );
    }

    fn on_failure(&self, _job_id: &str, reason: &FailureReason) {
        eprintln!("\r\x1b[2KError: {}", reason);
    }
}
