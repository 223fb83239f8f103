//! Per-peer download session
//!
//! One task per peer: connect, declare interest, keep up to
//! `max_pipeline` block requests in flight while unchoked and feed the
//! blocks that arrive into the swarm. A peer that leaves a request
//! unanswered past the request timeout is dropped so its blocks go to
//! other peers.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace};

use crate::download::swarm::{wait_for_flag, Swarm};
use crate::error::{Result, TorrentError};
use crate::peer::{Inbound, PeerConnection};
use crate::protocol::Message;
use crate::storage::BlockRequest;

/// Connect to `addr` and download from it until the run ends or the connection fails.
///
/// Always gives the connection slot back to the registry.
pub(crate) async fn run_peer(swarm: Arc<Swarm>, addr: SocketAddr) {
    let mut shutdown = swarm.shutdown_signal();
    let connect = PeerConnection::connect(
        addr,
        swarm.torrent.info_hash,
        swarm.peer_id,
        swarm.torrent.piece_count(),
        swarm.timeouts,
    );

    let connected = tokio::select! {
        result = connect => Some(result),
        _ = wait_for_flag(&mut shutdown) => None,
    };

    match connected {
        Some(Ok(connection)) => {
            let session = PeerSession::new(swarm.clone(), connection);
            match session.run(&mut shutdown).await {
                Ok(()) => debug!("Session with {} finished", addr),
                Err(e) => info!("Session with {} ended: {}", addr, e),
            }
        }
        Some(Err(e)) => debug!("Failed to connect to {}: {}", addr, e),
        None => trace!("Shutdown before connecting to {}", addr),
    }

    swarm.peers.release(addr).await;
    swarm.slot_freed.notify_one();
}

/// A request sent to the peer and not yet answered
#[derive(Debug, Clone, Copy)]
struct PendingRequest {
    request: BlockRequest,
    sent_at: Instant,
}

struct PeerSession {
    swarm: Arc<Swarm>,
    connection: PeerConnection,
    pending: Vec<PendingRequest>,
}

impl PeerSession {
    fn new(swarm: Arc<Swarm>, connection: PeerConnection) -> Self {
        Self {
            swarm,
            connection,
            pending: Vec::new(),
        }
    }

    async fn run(mut self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        let result = self.drive(shutdown).await;
        self.release_pending().await;
        self.connection.close();
        result
    }

    async fn drive(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        self.connection.send_interested().await?;
        let swarm = self.swarm.clone();

        loop {
            if swarm.is_complete().await {
                return Ok(());
            }

            // Armed before claiming blocks so a release in between still wakes us
            let work = swarm.work_available.notified();
            tokio::pin!(work);
            work.as_mut().enable();
            self.fill_pipeline().await?;

            let deadline = self.oldest_request().map(|sent_at| sent_at + swarm.timeouts.request);
            let interrupt = async {
                match deadline {
                    Some(at) => tokio::select! {
                        _ = work.as_mut() => {}
                        _ = sleep_until(at) => {}
                    },
                    None => work.as_mut().await,
                }
            };

            match self.connection.next_inbound(shutdown, interrupt).await? {
                Inbound::Message(message) => self.handle(message).await?,
                Inbound::Interrupted => self.check_overdue()?,
                Inbound::Shutdown => return Ok(()),
            }
        }
    }

    fn oldest_request(&self) -> Option<Instant> {
        self.pending.iter().map(|p| p.sent_at).min()
    }

    /// Fail the session if any request has waited past the request timeout
    fn check_overdue(&self) -> Result<()> {
        let limit = self.swarm.timeouts.request;
        let now = Instant::now();
        let overdue = self
            .pending
            .iter()
            .filter(|p| now.duration_since(p.sent_at) >= limit)
            .count();
        if overdue > 0 {
            return Err(TorrentError::peer_error_with_peer(
                format!("{} block requests unanswered for {}s", overdue, limit.as_secs()),
                self.connection.peer_addr().to_string(),
            ));
        }
        trace!("Woken by released blocks");
        Ok(())
    }

    async fn release_pending(&mut self) {
        let dropped: Vec<BlockRequest> = self.pending.drain(..).map(|p| p.request).collect();
        self.swarm.release_requests(&dropped).await;
    }

    async fn fill_pipeline(&mut self) -> Result<()> {
        while self.connection.peer.can_request() && self.pending.len() < self.swarm.max_pipeline {
            let Some(request) = self.swarm.next_request(&self.connection.peer).await? else {
                break;
            };
            if let Err(e) = self
                .connection
                .request_block(request.index, request.begin, request.length)
                .await
            {
                self.swarm.release_requests(&[request]).await;
                return Err(e);
            }
            trace!(
                "Requested {}:{}+{} from {}",
                request.index,
                request.begin,
                request.length,
                self.connection.peer_addr()
            );
            self.pending.push(PendingRequest {
                request,
                sent_at: Instant::now(),
            });
        }
        Ok(())
    }

    async fn handle(&mut self, message: Message) -> Result<()> {
        let addr = self.connection.peer_addr();
        match message {
            Message::Choke => {
                // A choking peer discards our queue; hand the blocks to other peers
                debug!("Choked by {}, releasing {} requests", addr, self.pending.len());
                self.release_pending().await;
            }
            Message::Unchoke => debug!("Unchoked by {}", addr),
            Message::Bitfield { .. } | Message::Have { .. } => {
                if let Some(bitfield) = &self.connection.peer.bitfield {
                    self.swarm.peers.update_bitfield(addr, bitfield.clone()).await;
                }
            }
            Message::Piece { index, begin, block } => {
                self.pending
                    .retain(|p| !(p.request.index == index && p.request.begin == begin));
                self.swarm.on_block(index, begin, &block).await?;
            }
            _ => {}
        }
        Ok(())
    }
}
