//! Configuration module
//!
//! Tunables for a download run. Every field has a default, so a worker can
//! load a partial JSON document and the CLI only overrides what it is given.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cli::CliArgs;
use crate::download::PieceSelectionStrategy;
use crate::error::{Result, TorrentError};

/// Configuration for the download core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Port reported to trackers
    pub listen_port: u16,
    /// Maximum number of peer connections
    pub max_connections: usize,
    /// Piece selection policy
    pub strategy: PieceSelectionStrategy,
    /// How often progress is reported
    pub progress_interval: Duration,
    pub connect_timeout: Duration,
    /// Handshake read timeout
    pub read_timeout: Duration,
    /// Close a connection after this long without any inbound frame
    pub idle_timeout: Duration,
    pub keepalive_interval: Duration,
    /// Outstanding block requests per peer
    pub max_pipeline: usize,
    /// Drop a peer that leaves a block request unanswered this long
    pub request_timeout: Duration,
    /// Peers asked for per announce
    pub numwant: u32,
    pub tracker_timeout: Duration,
    /// Wait before redialing a peer whose connection ended
    pub redial_cooldown: Duration,
    /// Completion percentage at which playback may start. Not used by the
    /// download core.
    pub buffer_threshold_percent: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: 6881,
            max_connections: 30,
            strategy: PieceSelectionStrategy::Sequential,
            progress_interval: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(120),
            keepalive_interval: Duration::from_secs(90),
            max_pipeline: 5,
            request_timeout: Duration::from_secs(60),
            numwant: 50,
            tracker_timeout: Duration::from_secs(15),
            redial_cooldown: Duration::from_secs(30),
            buffer_threshold_percent: 10.0,
        }
    }
}

impl Config {
    /// Create configuration from CLI arguments, starting from `--config` if given
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::from_json_file(path)?,
            None => Self::default(),
        };

        if let Some(port) = args.port {
            config.listen_port = port;
        }
        if let Some(max_connections) = args.max_connections {
            config.max_connections = max_connections;
        }
        if let Some(strategy) = args.strategy {
            config.strategy = strategy;
        }
        if let Some(secs) = args.progress_interval {
            config.progress_interval = Duration::from_secs(secs);
        }

        debug!("Effective configuration: {:?}", config);
        Ok(config)
    }

    /// Load configuration from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            TorrentError::config_error_with_field(format!("Failed to read {}: {}", path.display(), e), "config")
        })?;
        serde_json::from_str(&text).map_err(|e| {
            TorrentError::config_error_with_field(format!("Invalid JSON in {}: {}", path.display(), e), "config")
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.listen_port == 0 {
            return Err(TorrentError::config_error_with_field("Port cannot be 0", "listen_port"));
        }
        if self.max_connections == 0 {
            return Err(TorrentError::config_error_with_field(
                "max_connections must be at least 1",
                "max_connections",
            ));
        }
        if self.max_pipeline == 0 {
            return Err(TorrentError::config_error_with_field("max_pipeline must be at least 1", "max_pipeline"));
        }

        for (field, value) in [
            ("progress_interval", self.progress_interval),
            ("connect_timeout", self.connect_timeout),
            ("read_timeout", self.read_timeout),
            ("idle_timeout", self.idle_timeout),
            ("keepalive_interval", self.keepalive_interval),
            ("tracker_timeout", self.tracker_timeout),
            ("request_timeout", self.request_timeout),
        ] {
            if value.is_zero() {
                return Err(TorrentError::config_error_with_field(format!("{} cannot be zero", field), field));
            }
        }

        if self.keepalive_interval >= self.idle_timeout {
            return Err(TorrentError::config_error_with_field(
                "keepalive_interval must be shorter than idle_timeout",
                "keepalive_interval",
            ));
        }
        if !(0.0..=100.0).contains(&self.buffer_threshold_percent) {
            return Err(TorrentError::config_error_with_field(
                "buffer_threshold_percent must be within 0..=100",
                "buffer_threshold_percent",
            ));
        }
        Ok(())
    }
}
