//! BitTorrent protocol messages
//!
//! Framed peer-wire messages: `<u32 BE length><u8 id><payload>`, with a
//! zero-length frame meaning keep-alive.

use bytes::{Buf, BufMut, BytesMut};
use tracing::trace;

use crate::error::{Result, TorrentError};

/// Largest frame body we accept from a peer
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// BitTorrent message IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = TorrentError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            _ => Err(TorrentError::peer_error(format!("Unknown message id {}", value))),
        }
    }
}

/// BitTorrent protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bitfield: Vec<u8> },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
}

impl Message {
    /// Get the message ID (returns None for KeepAlive)
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield { .. } => Some(MessageId::Bitfield),
            Message::Request { .. } => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel { .. } => Some(MessageId::Cancel),
            Message::KeepAlive => None,
        }
    }

    /// Get the message length (excluding the length prefix)
    pub fn length(&self) -> u32 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 1,
            Message::Have { .. } => 5,
            Message::Bitfield { bitfield } => 1 + bitfield.len() as u32,
            Message::Request { .. } | Message::Cancel { .. } => 13,
            Message::Piece { block, .. } => 9 + block.len() as u32,
        }
    }

    /// Serialize the message to bytes (including length prefix)
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(4 + self.length() as usize);
        buf.put_u32(self.length());

        if let Some(id) = self.message_id() {
            buf.put_u8(id as u8);
        }

        match self {
            Message::KeepAlive | Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {}
            Message::Have { piece_index } => buf.put_u32(*piece_index),
            Message::Bitfield { bitfield } => buf.put_slice(bitfield),
            Message::Request { index, begin, length } | Message::Cancel { index, begin, length } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, block } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
        }

        trace!("Message serialized: {:?}, {} bytes", self.message_id(), buf.len());
        buf.to_vec()
    }

    /// Deserialize a message from bytes (including length prefix)
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut buf = data;

        if buf.remaining() < 4 {
            return Err(TorrentError::peer_error("Frame shorter than its length prefix"));
        }

        let length = buf.get_u32() as usize;
        if buf.remaining() != length {
            return Err(TorrentError::peer_error(format!(
                "Frame length {} does not match {} payload bytes",
                length,
                buf.remaining()
            )));
        }

        Self::from_body(buf)
    }

    /// Decode a frame body (id + payload) whose length prefix was already consumed
    pub fn from_body(body: &[u8]) -> Result<Self> {
        let mut buf = body;
        if buf.is_empty() {
            return Ok(Message::KeepAlive);
        }

        let message_id = MessageId::try_from(buf.get_u8())?;
        let payload_len = buf.remaining();

        let expect = |expected: usize| -> Result<()> {
            if payload_len != expected {
                return Err(TorrentError::peer_error(format!(
                    "{:?} payload must be {} bytes, got {}",
                    message_id, expected, payload_len
                )));
            }
            Ok(())
        };

        let message = match message_id {
            MessageId::Choke => {
                expect(0)?;
                Message::Choke
            }
            MessageId::Unchoke => {
                expect(0)?;
                Message::Unchoke
            }
            MessageId::Interested => {
                expect(0)?;
                Message::Interested
            }
            MessageId::NotInterested => {
                expect(0)?;
                Message::NotInterested
            }
            MessageId::Have => {
                expect(4)?;
                Message::Have { piece_index: buf.get_u32() }
            }
            MessageId::Bitfield => Message::Bitfield { bitfield: buf.to_vec() },
            MessageId::Request | MessageId::Cancel => {
                expect(12)?;
                let index = buf.get_u32();
                let begin = buf.get_u32();
                let length = buf.get_u32();
                if message_id == MessageId::Request {
                    Message::Request { index, begin, length }
                } else {
                    Message::Cancel { index, begin, length }
                }
            }
            MessageId::Piece => {
                if payload_len < 8 {
                    return Err(TorrentError::peer_error(format!(
                        "Piece payload must be at least 8 bytes, got {}",
                        payload_len
                    )));
                }
                let index = buf.get_u32();
                let begin = buf.get_u32();
                Message::Piece { index, begin, block: buf.to_vec() }
            }
        };

        trace!("Decoded {:?}", message_id);
        Ok(message)
    }
}
