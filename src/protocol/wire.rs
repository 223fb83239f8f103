//! Wire protocol utilities
//!
//! Async helpers that move handshakes and framed messages over a stream.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::trace;

use super::handshake::HANDSHAKE_LEN;
use super::message::MAX_FRAME_LEN;
use super::{Handshake, Message, MessageId};
use crate::error::{Result, TorrentError};

/// WireProtocol trait for protocol utilities
#[allow(async_fn_in_trait)]
pub trait WireProtocol {
    /// Read a complete message from the stream
    async fn read_message<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<Message>;

    /// Write a message to the stream
    async fn write_message<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, message: &Message) -> Result<()>;

    /// Read a handshake from the stream
    async fn read_handshake<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<Handshake>;

    /// Write a handshake to the stream
    async fn write_handshake<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, handshake: &Handshake) -> Result<()>;
}

/// Default implementation of WireProtocol
#[derive(Debug, Default, Clone, Copy)]
pub struct BitTorrentWire;

fn io_error(context: &str, err: std::io::Error) -> TorrentError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        TorrentError::peer_error(format!("Connection closed while {}", context))
    } else {
        TorrentError::peer_error(format!("I/O error while {}: {}", context, err))
    }
}

impl WireProtocol for BitTorrentWire {
    async fn read_message<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<Message> {
        loop {
            let mut length_buf = [0u8; 4];
            reader
                .read_exact(&mut length_buf)
                .await
                .map_err(|e| io_error("reading frame length", e))?;
            let length = u32::from_be_bytes(length_buf) as usize;

            if length == 0 {
                return Ok(Message::KeepAlive);
            }
            if length > MAX_FRAME_LEN {
                return Err(TorrentError::peer_error(format!(
                    "Frame of {} bytes exceeds limit of {}",
                    length, MAX_FRAME_LEN
                )));
            }

            let mut body = vec![0u8; length];
            reader
                .read_exact(&mut body)
                .await
                .map_err(|e| io_error("reading frame body", e))?;

            // Extensions we never negotiated (DHT port, extended messaging)
            if MessageId::try_from(body[0]).is_err() {
                trace!("Skipping frame with unknown message id {} ({} bytes)", body[0], length);
                continue;
            }
            trace!("Read frame of {} bytes", length);

            return Message::from_body(&body);
        }
    }

    async fn write_message<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, message: &Message) -> Result<()> {
        writer
            .write_all(&message.serialize())
            .await
            .map_err(|e| io_error("writing message", e))?;
        writer.flush().await.map_err(|e| io_error("flushing message", e))
    }

    async fn read_handshake<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<Handshake> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        reader
            .read_exact(&mut buf)
            .await
            .map_err(|e| io_error("reading handshake", e))?;
        Handshake::deserialize(&buf)
    }

    async fn write_handshake<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, handshake: &Handshake) -> Result<()> {
        writer
            .write_all(&handshake.serialize())
            .await
            .map_err(|e| io_error("writing handshake", e))?;
        writer.flush().await.map_err(|e| io_error("flushing handshake", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_message_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let mut wire = BitTorrentWire;

        wire.write_message(&mut a, &Message::Have { piece_index: 7 }).await.unwrap();
        wire.write_message(&mut a, &Message::KeepAlive).await.unwrap();

        assert_eq!(wire.read_message(&mut b).await.unwrap(), Message::Have { piece_index: 7 });
        assert_eq!(wire.read_message(&mut b).await.unwrap(), Message::KeepAlive);
    }

    #[tokio::test]
    async fn test_handshake_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let mut wire = BitTorrentWire;
        let handshake = Handshake::new([9u8; 20], [8u8; 20]);

        wire.write_handshake(&mut a, &handshake).await.unwrap();
        assert_eq!(wire.read_handshake(&mut b).await.unwrap(), handshake);
    }

    #[tokio::test]
    async fn test_unknown_message_ids_skipped() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        // port (id 9) and an extended message (id 20) ahead of a have
        a.write_all(&[0, 0, 0, 3, 9, 0x1A, 0xE1]).await.unwrap();
        a.write_all(&[0, 0, 0, 4, 20, 0, b'd', b'e']).await.unwrap();
        let mut wire = BitTorrentWire;
        wire.write_message(&mut a, &Message::Have { piece_index: 2 }).await.unwrap();

        assert_eq!(wire.read_message(&mut b).await.unwrap(), Message::Have { piece_index: 2 });
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_FRAME_LEN as u32 + 1).to_be_bytes()).await.unwrap();

        let err = BitTorrentWire.read_message(&mut b).await.unwrap_err();
        assert!(matches!(err, TorrentError::PeerError { .. }));
    }

    #[tokio::test]
    async fn test_closed_stream_is_peer_error() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        let err = BitTorrentWire.read_message(&mut b).await.unwrap_err();
        assert!(err.to_string().contains("Connection closed"));
    }
}
