//! BitTorrent handshake protocol
//!
//! The fixed 68-byte greeting exchanged before any framed message.

use bytes::{BufMut, BytesMut};
use tracing::{debug, error, trace, warn};

use crate::error::{Result, TorrentError};

/// BitTorrent protocol identifier string
pub const PROTOCOL_STRING: &[u8; 19] = b"BitTorrent protocol";

/// Length of the protocol string
pub const PROTOCOL_LENGTH: u8 = 19;

/// Total handshake size on the wire
pub const HANDSHAKE_LEN: usize = 68;

/// Client prefix for generated peer ids (Azureus style)
pub const PEER_ID_PREFIX: &[u8; 8] = b"-ST0100-";

/// BitTorrent handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Reserved bytes; we send zeros and ignore what peers send
    pub reserved: [u8; 8],
    /// Torrent info hash
    pub info_hash: [u8; 20],
    /// Sender's peer ID
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Create a new handshake with info_hash and peer_id
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Generate a random peer ID with the client prefix
    pub fn generate_peer_id() -> [u8; 20] {
        let mut peer_id = [0u8; 20];
        peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
        peer_id[8..].copy_from_slice(&rand::random::<[u8; 12]>());
        debug!("Generated new peer ID: {}", String::from_utf8_lossy(&peer_id[..8]));
        peer_id
    }

    /// Serialize the handshake to bytes
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_LENGTH);
        buf.put_slice(PROTOCOL_STRING);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        trace!("Handshake serialized: {} bytes", buf.len());
        buf.to_vec()
    }

    /// Deserialize a handshake from bytes
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < HANDSHAKE_LEN {
            error!("Handshake data too short: expected {} bytes, got {}", HANDSHAKE_LEN, data.len());
            return Err(TorrentError::peer_error(format!(
                "Handshake too short: expected {} bytes, got {}",
                HANDSHAKE_LEN,
                data.len()
            )));
        }

        if data[0] != PROTOCOL_LENGTH || &data[1..20] != PROTOCOL_STRING {
            warn!("Handshake carries an unknown protocol identifier");
            return Err(TorrentError::peer_error("Invalid protocol string in handshake"));
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        debug!("Handshake info_hash: {}", hex::encode(info_hash));
        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }

    /// Check the remote's info hash against ours
    pub fn validate(&self, expected_info_hash: &[u8; 20]) -> Result<()> {
        if self.info_hash != *expected_info_hash {
            warn!(
                "Handshake info hash mismatch: expected {}, got {}",
                hex::encode(expected_info_hash),
                hex::encode(self.info_hash)
            );
            return Err(TorrentError::peer_error_full(
                "Info hash mismatch",
                hex::encode(self.peer_id),
                hex::encode(self.info_hash),
            ));
        }
        Ok(())
    }
}
