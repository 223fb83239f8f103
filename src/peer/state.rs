//! Peer state module
//!
//! Per-connection protocol state: choke/interest flags and the pieces the
//! remote has advertised.

use std::net::SocketAddr;

use tracing::{debug, trace};

use crate::error::{Result, TorrentError};
use crate::protocol::Message;
use crate::storage::Bitfield;

/// Lifecycle of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Initial and terminal state
    #[default]
    Disconnected,
    /// TCP connect in progress
    Connecting,
    /// Socket open, handshake not yet verified
    HandshakePending,
    /// Handshake verified, framed messages flowing
    Connected,
}

impl ConnectionState {
    /// Check if the peer is connected
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Represents a peer with its state
#[derive(Debug, Clone)]
pub struct Peer {
    /// Peer address
    pub addr: SocketAddr,
    /// Peer identifier from its handshake
    pub peer_id: Option<[u8; 20]>,
    pub state: ConnectionState,
    /// We're choking them
    pub am_choking: bool,
    /// We're interested
    pub am_interested: bool,
    /// They're choking us
    pub peer_choking: bool,
    /// They're interested
    pub peer_interested: bool,
    /// Pieces they have advertised
    pub bitfield: Option<Bitfield>,
    /// Payload bytes received from this peer
    pub bytes_downloaded: u64,
    piece_count: usize,
    messages_received: u64,
}

impl Peer {
    /// Create a new peer for a torrent with `piece_count` pieces
    pub fn new(addr: SocketAddr, piece_count: usize) -> Self {
        Self {
            addr,
            peer_id: None,
            state: ConnectionState::Disconnected,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            bitfield: None,
            bytes_downloaded: 0,
            piece_count,
            messages_received: 0,
        }
    }

    /// Set peer state
    pub fn set_state(&mut self, state: ConnectionState) {
        trace!("Peer {} state {:?} -> {:?}", self.addr, self.state, state);
        self.state = state;
    }

    /// Whether the peer can be asked for `piece_index`.
    ///
    /// Until it sends a bitfield or a `have`, a peer is taken to offer every
    /// piece; requests it never answers are expired by the session. After
    /// that only advertised pieces count.
    pub fn has_piece(&self, piece_index: usize) -> bool {
        self.bitfield.as_ref().is_none_or(|bf| bf.has(piece_index))
    }

    /// Check if we can request from peer
    pub fn can_request(&self) -> bool {
        !self.peer_choking && self.am_interested && self.state.is_connected()
    }

    /// Get the number of pieces the peer has
    pub fn piece_count(&self) -> usize {
        self.bitfield.as_ref().map_or(0, Bitfield::count)
    }

    /// Fold an inbound message into the connection state.
    ///
    /// Protocol violations (a late bitfield, a malformed bitfield, a `have`
    /// for a piece that does not exist) are returned as errors and should
    /// close the connection.
    pub fn apply_message(&mut self, message: &Message) -> Result<()> {
        let first = self.messages_received == 0;
        if !matches!(message, Message::KeepAlive) {
            self.messages_received += 1;
        }

        match message {
            Message::KeepAlive => {}
            Message::Choke => self.peer_choking = true,
            Message::Unchoke => self.peer_choking = false,
            Message::Interested => self.peer_interested = true,
            Message::NotInterested => self.peer_interested = false,
            Message::Have { piece_index } => {
                let index = *piece_index as usize;
                let piece_count = self.piece_count;
                let bitfield = self.bitfield.get_or_insert_with(|| Bitfield::new(piece_count));
                bitfield.set(index).map_err(|_| {
                    TorrentError::peer_error_with_peer(
                        format!("have for piece {} of {}", index, piece_count),
                        self.addr.to_string(),
                    )
                })?;
            }
            Message::Bitfield { bitfield } => {
                if !first {
                    return Err(TorrentError::peer_error_with_peer(
                        "bitfield sent after other messages",
                        self.addr.to_string(),
                    ));
                }
                let parsed = Bitfield::from_bytes(bitfield, self.piece_count)
                    .map_err(|e| e.with_context(self.addr.to_string()))?;
                debug!("Peer {} has {}/{} pieces", self.addr, parsed.count(), self.piece_count);
                self.bitfield = Some(parsed);
            }
            Message::Piece { block, .. } => self.bytes_downloaded += block.len() as u64,
            Message::Request { .. } | Message::Cancel { .. } => {
                trace!("Ignoring upload request from {}", self.addr);
            }
        }
        Ok(())
    }
}
