//! Peer manager module
//!
//! Bookkeeping for every peer address the swarm has handed us: which ones
//! hold a connection slot, which are cooling down after a failure, and what
//! each connected peer has advertised.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::storage::Bitfield;

#[derive(Debug, Default)]
struct KnownPeer {
    /// Holds a connection slot (dialing or connected)
    active: bool,
    /// When the last connection attempt ended
    released_at: Option<Instant>,
    /// Pieces advertised over the current connection
    bitfield: Option<Bitfield>,
}

/// Manages the peer set for a torrent
pub struct PeerManager {
    peers: RwLock<HashMap<SocketAddr, KnownPeer>>,
    max_connections: usize,
    redial_cooldown: Duration,
}

impl PeerManager {
    /// Create a new peer manager
    pub fn new(max_connections: usize, redial_cooldown: Duration) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            max_connections,
            redial_cooldown,
        }
    }

    /// Remember peer addresses; returns how many were new
    pub async fn add_peers(&self, addrs: impl IntoIterator<Item = SocketAddr>) -> usize {
        let mut peers = self.peers.write().await;
        let mut added = 0;
        for addr in addrs {
            if let std::collections::hash_map::Entry::Vacant(slot) = peers.entry(addr) {
                slot.insert(KnownPeer::default());
                added += 1;
            }
        }
        if added > 0 {
            info!("Added {} peers (total: {})", added, peers.len());
        }
        added
    }

    /// Reserve connection slots for idle peers not in cool-down, up to the cap
    pub async fn take_dial_candidates(&self) -> Vec<SocketAddr> {
        let mut peers = self.peers.write().await;
        let active = peers.values().filter(|p| p.active).count();
        let slots = self.max_connections.saturating_sub(active);
        if slots == 0 {
            trace!("No connection slots available (max: {})", self.max_connections);
            return Vec::new();
        }

        let now = Instant::now();
        let mut candidates: Vec<SocketAddr> = peers
            .iter()
            .filter(|(_, p)| !p.active)
            .filter(|(_, p)| p.released_at.is_none_or(|at| now.duration_since(at) >= self.redial_cooldown))
            .map(|(addr, _)| *addr)
            .collect();
        candidates.sort();
        candidates.truncate(slots);

        for addr in &candidates {
            if let Some(peer) = peers.get_mut(addr) {
                peer.active = true;
            }
        }
        debug!("Reserved {} connection slots ({} active before)", candidates.len(), active);
        candidates
    }

    /// Give back a connection slot once a connection attempt or session ends
    pub async fn release(&self, addr: SocketAddr) {
        if let Some(peer) = self.peers.write().await.get_mut(&addr) {
            peer.active = false;
            peer.bitfield = None;
            peer.released_at = Some(Instant::now());
            trace!("Released slot for {}", addr);
        }
    }

    /// When the next peer still cooling down becomes dialable again
    pub async fn next_redial_at(&self) -> Option<Instant> {
        let now = Instant::now();
        self.peers
            .read()
            .await
            .values()
            .filter(|p| !p.active)
            .filter_map(|p| p.released_at.map(|at| at + self.redial_cooldown))
            .filter(|ready| *ready > now)
            .min()
    }

    /// Record a connected peer's advertised pieces
    pub async fn update_bitfield(&self, addr: SocketAddr, bitfield: Bitfield) {
        if let Some(peer) = self.peers.write().await.get_mut(&addr) {
            peer.bitfield = Some(bitfield);
        }
    }

    /// Per-piece count of connected peers advertising it
    pub async fn availability(&self, piece_count: usize) -> Vec<u32> {
        let mut counts = vec![0u32; piece_count];
        for bitfield in self.peers.read().await.values().filter(|p| p.active).filter_map(|p| p.bitfield.as_ref()) {
            for (index, count) in counts.iter_mut().enumerate() {
                if bitfield.has(index) {
                    *count += 1;
                }
            }
        }
        counts
    }

    /// Get the number of active connection slots
    pub async fn connection_count(&self) -> usize {
        self.peers.read().await.values().filter(|p| p.active).count()
    }

    /// Get the total number of known peers
    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Check if we can add more connections
    pub async fn can_add_connection(&self) -> bool {
        self.connection_count().await < self.max_connections
    }

    /// Forget every connection slot (used on shutdown)
    pub async fn release_all(&self) {
        let now = Instant::now();
        for peer in self.peers.write().await.values_mut().filter(|p| p.active) {
            peer.active = false;
            peer.bitfield = None;
            peer.released_at = Some(now);
        }
    }
}
