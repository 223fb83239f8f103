//! Tracker module
//!
//! Announce requests, response decoding and the [`Announcer`] seam the
//! download manager talks to.

pub mod client;
pub mod response;

pub use client::TrackerClient;
pub use response::{parse_compact_peers, PeerDescriptor, TrackerResponse};

use async_trait::async_trait;

use crate::error::Result;

/// Announce event type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    /// Regular re-announce
    None,
    Started,
    Stopped,
    Completed,
}

impl AnnounceEvent {
    /// Value of the `event` query parameter; empty for a regular announce
    pub fn as_str(self) -> &'static str {
        match self {
            AnnounceEvent::None => "",
            AnnounceEvent::Started => "started",
            AnnounceEvent::Stopped => "stopped",
            AnnounceEvent::Completed => "completed",
        }
    }
}

/// Per-announce transfer state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub event: AnnounceEvent,
    pub downloaded: u64,
    pub uploaded: u64,
    pub left: u64,
}

/// Anything that can announce to a torrent's trackers on our behalf
#[async_trait]
pub trait Announcer: Send + Sync {
    /// Peer id sent to trackers, reused in every peer handshake
    fn peer_id(&self) -> [u8; 20];

    /// Announce to `trackers`, returning the first usable response
    async fn announce(&self, trackers: &[String], request: &AnnounceRequest) -> Result<TrackerResponse>;
}
