//! BitTorrent protocol module
//!
//! Implements the BitTorrent peer wire protocol.

pub mod handshake;
pub mod message;
pub mod wire;

pub use handshake::{Handshake, HANDSHAKE_LEN, PROTOCOL_LENGTH, PROTOCOL_STRING};
pub use message::{Message, MessageId, MAX_FRAME_LEN};
pub use wire::{BitTorrentWire, WireProtocol};
