//! Error types for the download core
//!
//! One enum covers every failure the core can surface. Verification
//! failures are deliberately absent: a piece whose hash does not match is
//! reset and re-requested, never reported as an error.

use std::fmt;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, TorrentError>;

/// Error type for all torrent operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TorrentError {
    /// Malformed bencode or torrent metadata
    DecodeError {
        message: String,
        source: Option<String>,
    },

    /// Network, HTTP or decode failure talking to a tracker
    TrackerError {
        message: String,
        tracker: Option<String>,
        source: Option<String>,
    },

    /// Handshake mismatch, protocol violation or dropped connection
    PeerError {
        message: String,
        peer: Option<String>,
        source: Option<String>,
    },

    /// Output file I/O errors
    StorageError {
        message: String,
        path: Option<String>,
        source: Option<String>,
    },

    /// Operation not valid in the current lifecycle state
    LifecycleError {
        message: String,
    },

    /// Piece or block index outside the valid range
    IndexOutOfRange {
        index: u64,
        limit: u64,
    },

    /// Invalid configuration
    ConfigError {
        message: String,
        field: Option<String>,
    },

    /// Socket-level errors before a peer or tracker is involved
    NetworkError {
        message: String,
        address: Option<String>,
        source: Option<String>,
    },
}

impl TorrentError {
    /// Create a new DecodeError
    pub fn decode_error(message: impl Into<String>) -> Self {
        TorrentError::DecodeError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new DecodeError with source
    pub fn decode_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::DecodeError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new TrackerError
    pub fn tracker_error(message: impl Into<String>) -> Self {
        TorrentError::TrackerError {
            message: message.into(),
            tracker: None,
            source: None,
        }
    }

    /// Create a new TrackerError with tracker URL
    pub fn tracker_error_with_url(message: impl Into<String>, tracker: impl Into<String>) -> Self {
        TorrentError::TrackerError {
            message: message.into(),
            tracker: Some(tracker.into()),
            source: None,
        }
    }

    /// Create a new TrackerError with tracker URL and source
    pub fn tracker_error_full(message: impl Into<String>, tracker: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::TrackerError {
            message: message.into(),
            tracker: Some(tracker.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new PeerError
    pub fn peer_error(message: impl Into<String>) -> Self {
        TorrentError::PeerError {
            message: message.into(),
            peer: None,
            source: None,
        }
    }

    /// Create a new PeerError with peer address
    pub fn peer_error_with_peer(message: impl Into<String>, peer: impl Into<String>) -> Self {
        TorrentError::PeerError {
            message: message.into(),
            peer: Some(peer.into()),
            source: None,
        }
    }

    /// Create a new PeerError with peer and source
    pub fn peer_error_full(message: impl Into<String>, peer: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::PeerError {
            message: message.into(),
            peer: Some(peer.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new StorageError
    pub fn storage_error(message: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            path: None,
            source: None,
        }
    }

    /// Create a new StorageError with path and source
    pub fn storage_error_full(message: impl Into<String>, path: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            path: Some(path.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new LifecycleError
    pub fn lifecycle_error(message: impl Into<String>) -> Self {
        TorrentError::LifecycleError {
            message: message.into(),
        }
    }

    /// Create a new IndexOutOfRange error
    pub fn index_out_of_range(index: u64, limit: u64) -> Self {
        TorrentError::IndexOutOfRange { index, limit }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new NetworkError with address and source
    pub fn network_error_full(message: impl Into<String>, address: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: Some(source.into()),
        }
    }

    /// Whether the failure is scoped to a single tracker or peer and the
    /// download as a whole can carry on
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TorrentError::TrackerError { .. } | TorrentError::PeerError { .. } | TorrentError::NetworkError { .. }
        )
    }

    /// Add context to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let ctx = context.into();
        let append = |source: &mut Option<String>| {
            *source = Some(source.as_ref().map_or_else(|| ctx.clone(), |s| format!("{}: {}", s, ctx)));
        };
        match &mut self {
            TorrentError::DecodeError { source, .. }
            | TorrentError::TrackerError { source, .. }
            | TorrentError::PeerError { source, .. }
            | TorrentError::StorageError { source, .. }
            | TorrentError::NetworkError { source, .. } => append(source),
            _ => {}
        }
        self
    }
}

fn write_with_details(
    f: &mut fmt::Formatter<'_>,
    kind: &str,
    message: &str,
    label: &str,
    subject: &Option<String>,
    source: &Option<String>,
) -> fmt::Result {
    match (subject, source) {
        (Some(s), Some(src)) => write!(f, "{}: {} ({}: {}, source: {})", kind, message, label, s, src),
        (Some(s), None) => write!(f, "{}: {} ({}: {})", kind, message, label, s),
        (None, Some(src)) => write!(f, "{}: {} (source: {})", kind, message, src),
        (None, None) => write!(f, "{}: {}", kind, message),
    }
}

impl fmt::Display for TorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TorrentError::DecodeError { message, source } => {
                write_with_details(f, "Decode error", message, "", &None, source)
            }
            TorrentError::TrackerError { message, tracker, source } => {
                write_with_details(f, "Tracker error", message, "tracker", tracker, source)
            }
            TorrentError::PeerError { message, peer, source } => {
                write_with_details(f, "Peer error", message, "peer", peer, source)
            }
            TorrentError::StorageError { message, path, source } => {
                write_with_details(f, "Storage error", message, "path", path, source)
            }
            TorrentError::LifecycleError { message } => write!(f, "Lifecycle error: {}", message),
            TorrentError::IndexOutOfRange { index, limit } => {
                write!(f, "Index out of range: {} (valid range: 0..{})", index, limit)
            }
            TorrentError::ConfigError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Config error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Config error: {}", message)
                }
            }
            TorrentError::NetworkError { message, address, source } => {
                write_with_details(f, "Network error", message, "address", address, source)
            }
        }
    }
}

impl std::error::Error for TorrentError {}

impl From<std::io::Error> for TorrentError {
    fn from(err: std::io::Error) -> Self {
        TorrentError::storage_error_full(err.to_string(), "unknown", err.kind().to_string())
    }
}

impl From<reqwest::Error> for TorrentError {
    fn from(err: reqwest::Error) -> Self {
        let url = err.url().map(|u| u.to_string()).unwrap_or_else(|| "unknown".to_string());
        TorrentError::tracker_error_full("HTTP request failed", url, err.to_string())
    }
}

impl From<url::ParseError> for TorrentError {
    fn from(err: url::ParseError) -> Self {
        TorrentError::decode_error_with_source("Failed to parse URL", err.to_string())
    }
}

impl From<std::net::AddrParseError> for TorrentError {
    fn from(err: std::net::AddrParseError) -> Self {
        TorrentError::network_error_full("Failed to parse address", "unknown", err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for TorrentError {
    fn from(_err: tokio::time::error::Elapsed) -> Self {
        TorrentError::NetworkError {
            message: "Operation timed out".to_string(),
            address: None,
            source: None,
        }
    }
}
