//! Peer connection module
//!
//! Drives one TCP connection through connect, handshake and the framed
//! message exchange. Reads happen on a dedicated task so that waiting for a
//! message can be raced against timers and shutdown without tearing a frame.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::error::{Result, TorrentError};
use crate::peer::{ConnectionState, Peer};
use crate::protocol::{BitTorrentWire, Handshake, Message, WireProtocol};

/// Inbound messages buffered between the reader task and the session
const INBOUND_QUEUE: usize = 64;

/// What ended a wait in [`PeerConnection::next_inbound`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Message(Message),
    /// The caller's interrupt completed first
    Interrupted,
    Shutdown,
}

/// Timing knobs for a single connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionTimeouts {
    /// TCP connect
    pub connect: Duration,
    /// Handshake exchange
    pub read: Duration,
    /// Longest silence tolerated from the remote
    pub idle: Duration,
    /// Send a keep-alive after this long without sending anything
    pub keepalive: Duration,
    /// Longest wait for the answer to a block request
    pub request: Duration,
}

impl ConnectionTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect: config.connect_timeout,
            read: config.read_timeout,
            idle: config.idle_timeout,
            keepalive: config.keepalive_interval,
            request: config.request_timeout,
        }
    }
}

impl Default for ConnectionTimeouts {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Represents a connected peer
pub struct PeerConnection {
    /// Peer information
    pub peer: Peer,
    writer: OwnedWriteHalf,
    inbound: mpsc::Receiver<Result<Message>>,
    reader_task: JoinHandle<()>,
    wire: BitTorrentWire,
    timeouts: ConnectionTimeouts,
    last_sent: Instant,
}

impl PeerConnection {
    /// Connect to a peer at the given address and perform handshake
    pub async fn connect(
        addr: SocketAddr,
        info_hash: [u8; 20],
        our_peer_id: [u8; 20],
        piece_count: usize,
        timeouts: ConnectionTimeouts,
    ) -> Result<Self> {
        let mut peer = Peer::new(addr, piece_count);
        peer.set_state(ConnectionState::Connecting);
        debug!("Connecting to peer: {}", addr);

        let stream = timeout(timeouts.connect, TcpStream::connect(addr))
            .await
            .map_err(|e| TorrentError::network_error_full("Connection timeout", addr.to_string(), e.to_string()))?
            .map_err(|e| TorrentError::network_error_full("Failed to connect", addr.to_string(), e.to_string()))?;

        Self::handshake(stream, peer, info_hash, our_peer_id, timeouts).await
    }

    /// Perform the BitTorrent handshake on an established stream
    pub async fn handshake(
        mut stream: TcpStream,
        mut peer: Peer,
        info_hash: [u8; 20],
        our_peer_id: [u8; 20],
        timeouts: ConnectionTimeouts,
    ) -> Result<Self> {
        peer.set_state(ConnectionState::HandshakePending);
        let addr = peer.addr.to_string();
        let mut wire = BitTorrentWire;

        let ours = Handshake::new(info_hash, our_peer_id);
        let theirs = timeout(timeouts.read, async {
            wire.write_handshake(&mut stream, &ours).await?;
            wire.read_handshake(&mut stream).await
        })
        .await
        .map_err(|_| TorrentError::peer_error_with_peer("Handshake timed out", addr.clone()))?
        .map_err(|e| e.with_context(addr.clone()))?;

        if let Err(e) = theirs.validate(&info_hash) {
            peer.set_state(ConnectionState::Disconnected);
            return Err(e.with_context(addr));
        }

        peer.peer_id = Some(theirs.peer_id);
        peer.set_state(ConnectionState::Connected);
        info!("Handshake completed with peer: {}", peer.addr);

        let (reader, writer) = stream.into_split();
        let (tx, inbound) = mpsc::channel(INBOUND_QUEUE);
        let reader_task = tokio::spawn(read_loop(reader, tx, timeouts.idle));

        Ok(Self {
            peer,
            writer,
            inbound,
            reader_task,
            wire,
            timeouts,
            last_sent: Instant::now(),
        })
    }

    /// Send a message to the peer
    pub async fn send_message(&mut self, message: &Message) -> Result<()> {
        if !self.peer.state.is_connected() {
            return Err(TorrentError::peer_error_with_peer(
                "Cannot send message: connection not established",
                self.peer.addr.to_string(),
            ));
        }

        trace!("Sending {:?} to peer: {}", message.message_id(), self.peer.addr);
        self.wire
            .write_message(&mut self.writer, message)
            .await
            .map_err(|e| e.with_context(self.peer.addr.to_string()))?;
        self.last_sent = Instant::now();
        Ok(())
    }

    /// Send interested message to the peer
    pub async fn send_interested(&mut self) -> Result<()> {
        self.send_message(&Message::Interested).await?;
        self.peer.am_interested = true;
        Ok(())
    }

    /// Request a block from the peer
    pub async fn request_block(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
        if !self.peer.can_request() {
            return Err(TorrentError::peer_error_with_peer(
                "Cannot request block: peer is choking us",
                self.peer.addr.to_string(),
            ));
        }
        self.send_message(&Message::Request { index, begin, length }).await
    }

    /// Wait for the next inbound message.
    ///
    /// Keep-alives are sent while waiting. Returns `Ok(None)` once `shutdown`
    /// flips to true; every message returned has already been applied to
    /// [`PeerConnection::peer`].
    pub async fn next_message(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<Option<Message>> {
        match self.next_inbound(shutdown, std::future::pending::<()>()).await? {
            Inbound::Message(message) => Ok(Some(message)),
            Inbound::Interrupted | Inbound::Shutdown => Ok(None),
        }
    }

    /// Like [`PeerConnection::next_message`], but also returns when `interrupt` completes.
    ///
    /// An interrupted wait leaves the connection usable; no frame is lost.
    pub async fn next_inbound<F>(&mut self, shutdown: &mut watch::Receiver<bool>, interrupt: F) -> Result<Inbound>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(interrupt);
        loop {
            if *shutdown.borrow() {
                return Ok(Inbound::Shutdown);
            }

            let keepalive_at = self.last_sent + self.timeouts.keepalive;
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(Inbound::Shutdown);
                    }
                }
                inbound = self.inbound.recv() => {
                    let message = match inbound {
                        Some(result) => result?,
                        None => {
                            return Err(TorrentError::peer_error_with_peer(
                                "Connection closed",
                                self.peer.addr.to_string(),
                            ))
                        }
                    };
                    self.peer.apply_message(&message)?;
                    return Ok(Inbound::Message(message));
                }
                _ = &mut interrupt => return Ok(Inbound::Interrupted),
                _ = sleep_until(keepalive_at) => {
                    trace!("Sending keep-alive to {}", self.peer.addr);
                    self.send_message(&Message::KeepAlive).await?;
                }
            }
        }
    }

    /// Close the connection
    pub fn close(&mut self) {
        if self.peer.state != ConnectionState::Disconnected {
            debug!("Closing connection to peer: {}", self.peer.addr);
        }
        self.reader_task.abort();
        self.peer.set_state(ConnectionState::Disconnected);
    }

    /// Get the peer's address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer.addr
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn read_loop(mut reader: OwnedReadHalf, tx: mpsc::Sender<Result<Message>>, idle: Duration) {
    let mut wire = BitTorrentWire;
    loop {
        let result = match timeout(idle, wire.read_message(&mut reader)).await {
            Ok(result) => result,
            Err(_) => Err(TorrentError::peer_error(format!(
                "No message for {}s, idle timeout",
                idle.as_secs()
            ))),
        };
        let failed = result.is_err();
        if let Err(e) = &result {
            warn!("Peer read ended: {}", e);
        }
        if tx.send(result).await.is_err() || failed {
            return;
        }
    }
}
