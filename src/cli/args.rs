//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use clap::Parser;
use std::path::PathBuf;

use crate::download::PieceSelectionStrategy;
use crate::job::JobRequest;

/// CLI arguments for a single download job
#[derive(Debug, Parser)]
#[command(name = "torrent-stream")]
#[command(about = "Download a torrent for progressive playback", long_about = None)]
pub struct CliArgs {
    /// Magnet link, .torrent URL or path to a .torrent file
    #[arg(value_name = "SOURCE")]
    pub source: String,

    /// Directory the video directory is created in
    #[arg(short, long, value_name = "DIR", default_value = "./downloads")]
    pub output_dir: PathBuf,

    /// Video identifier; names the directory holding the payload
    #[arg(long, default_value = "default")]
    pub video_id: String,

    /// Job identifier used in progress reports
    #[arg(long, default_value = "cli")]
    pub job_id: String,

    /// JSON configuration file; flags below override its values
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Port reported to trackers
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Maximum number of peer connections
    #[arg(short, long)]
    pub max_connections: Option<usize>,

    /// Piece selection strategy
    #[arg(short, long, value_enum)]
    pub strategy: Option<PieceSelectionStrategy>,

    /// Seconds between progress reports
    #[arg(long, value_name = "SECS")]
    pub progress_interval: Option<u64>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long)]
    pub quiet: bool,
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Check if quiet mode is enabled
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }

    /// The job these arguments describe
    pub fn job_request(&self) -> JobRequest {
        JobRequest {
            job_id: self.job_id.clone(),
            video_id: self.video_id.clone(),
            source: self.source.clone(),
            output_directory: self.output_dir.clone(),
        }
    }
}
