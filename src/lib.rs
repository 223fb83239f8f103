//! torrent-stream
//!
//! A BitTorrent download core with sequential piece selection, so a video
//! can start playing before the download completes.

pub mod bencode;
pub mod cli;
pub mod config;
pub mod download;
pub mod error;
pub mod job;
pub mod peer;
pub mod protocol;
pub mod storage;
pub mod torrent;
pub mod tracker;

pub use error::{Result, TorrentError};

pub use bencode::BencodeValue;
pub use config::Config;
pub use download::{DownloadManager, DownloadOutcome, PieceSelectionStrategy, ProgressReport};
pub use job::{run_job, FailureReason, JobObserver, JobOutcome, JobRequest};
pub use peer::{PeerConnection, PeerManager};
pub use protocol::{Handshake, Message, MessageId};
pub use storage::{Bitfield, PieceBuffer};
pub use torrent::{MagnetInfo, TorrentInfo, TorrentParser, TorrentSource};
pub use tracker::{AnnounceEvent, Announcer, TrackerClient, TrackerResponse};
