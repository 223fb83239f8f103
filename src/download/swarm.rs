//! Shared state of one download run
//!
//! Every peer session of a run works against a single [`Swarm`]: the pieces
//! being assembled, the bitfield of verified pieces, the peer registry and
//! the output file. Lock order is `have` before `active`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

use crate::download::picker::{PiecePicker, PieceSelectionStrategy};
use crate::download::session;
use crate::error::{Result, TorrentError};
use crate::peer::{ConnectionTimeouts, Peer, PeerManager};
use crate::storage::{Bitfield, BlockRequest, OutputFile, PieceBuffer};
use crate::torrent::TorrentInfo;

/// Where a run stands, as seen by `wait_for_completion`
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RunStatus {
    Idle,
    Running,
    Completed,
    Stopped,
    Failed(TorrentError),
}

pub(crate) struct Swarm {
    pub torrent: TorrentInfo,
    pub peer_id: [u8; 20],
    pub timeouts: ConnectionTimeouts,
    pub max_pipeline: usize,
    pub file: Arc<OutputFile>,
    pub peers: PeerManager,
    pub shutdown: watch::Sender<bool>,
    /// Signalled whenever a connection slot frees up
    pub slot_freed: Notify,
    /// Signalled once when the last piece is written
    pub completed: Notify,
    /// Signalled whenever claimed blocks go back to the pool
    pub work_available: Notify,
    pub tasks: Mutex<JoinSet<()>>,
    picker: PiecePicker,
    have: Mutex<Bitfield>,
    active: Mutex<HashMap<u32, PieceBuffer>>,
    downloaded: AtomicU64,
    status: Arc<watch::Sender<RunStatus>>,
}

impl Swarm {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        torrent: TorrentInfo,
        peer_id: [u8; 20],
        timeouts: ConnectionTimeouts,
        max_pipeline: usize,
        strategy: PieceSelectionStrategy,
        file: Arc<OutputFile>,
        peers: PeerManager,
        status: Arc<watch::Sender<RunStatus>>,
    ) -> Self {
        let piece_count = torrent.piece_count();
        let (shutdown, _) = watch::channel(false);
        Self {
            torrent,
            peer_id,
            timeouts,
            max_pipeline,
            file,
            peers,
            shutdown,
            slot_freed: Notify::new(),
            completed: Notify::new(),
            work_available: Notify::new(),
            tasks: Mutex::new(JoinSet::new()),
            picker: PiecePicker::new(strategy),
            have: Mutex::new(Bitfield::new(piece_count)),
            active: Mutex::new(HashMap::new()),
            downloaded: AtomicU64::new(0),
            status,
        }
    }

    /// Payload bytes received from peers, including data that later failed verification
    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub async fn is_complete(&self) -> bool {
        self.have.lock().await.is_complete()
    }

    pub async fn pieces_done(&self) -> usize {
        self.have.lock().await.count()
    }

    /// Bytes of verified pieces on disk
    pub async fn verified_bytes(&self) -> u64 {
        let have = self.have.lock().await;
        let mut bytes = have.count() as u64 * self.torrent.piece_length;
        let last = self.torrent.piece_count().saturating_sub(1);
        if have.has(last) {
            let short = self.torrent.piece_len(last).unwrap_or(self.torrent.piece_length);
            bytes -= self.torrent.piece_length - short;
        }
        bytes
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Claim the next block `peer` should be asked for.
    ///
    /// Active pieces the peer can serve come first so pieces finish before
    /// new ones are opened; otherwise the picker chooses a fresh piece.
    pub async fn next_request(&self, peer: &Peer) -> Result<Option<BlockRequest>> {
        let availability = match self.picker.strategy() {
            PieceSelectionStrategy::RarestFirst => self.peers.availability(self.torrent.piece_count()).await,
            PieceSelectionStrategy::Sequential => Vec::new(),
        };

        let have = self.have.lock().await;
        let mut active = self.active.lock().await;

        let mut helping: Vec<u32> = active
            .iter()
            .filter(|(index, buffer)| buffer.has_unrequested() && peer.has_piece(**index as usize))
            .map(|(index, _)| *index)
            .collect();
        helping.sort_unstable();
        if let Some(index) = helping.first() {
            return Ok(active.get_mut(index).and_then(PieceBuffer::next_block_request));
        }

        let picked = self.picker.select(
            &have,
            peer.bitfield.as_ref(),
            |i| active.contains_key(&(i as u32)),
            &availability,
        );
        let Some(index) = picked else {
            return Ok(None);
        };

        let length = u32::try_from(self.torrent.piece_len(index)?)
            .map_err(|_| TorrentError::storage_error(format!("Piece {} is too large to buffer", index)))?;
        let mut buffer = PieceBuffer::new(index as u32, length, self.torrent.piece_hash(index)?);
        let request = buffer.next_block_request();
        debug!("Starting piece {} ({} bytes, {} blocks)", index, length, buffer.block_count());
        active.insert(index as u32, buffer);
        Ok(request)
    }

    /// Return requests a peer will no longer answer
    pub async fn release_requests(&self, requests: &[BlockRequest]) {
        if requests.is_empty() {
            return;
        }
        let mut active = self.active.lock().await;
        for request in requests {
            if let Some(buffer) = active.get_mut(&request.index) {
                buffer.release_request(request.begin);
            }
        }
        drop(active);
        trace!("Released {} outstanding requests", requests.len());
        self.work_available.notify_waiters();
    }

    /// Store a received block; verify and persist the piece once it is whole.
    ///
    /// A failed hash check resets the piece so its blocks are requested
    /// again. The bitfield bit is set only after the disk write succeeds.
    pub async fn on_block(&self, index: u32, begin: u32, data: &[u8]) -> Result<()> {
        let verified = {
            let mut active = self.active.lock().await;
            let Some(buffer) = active.get_mut(&index) else {
                trace!("Discarding block {}:{} for inactive piece", index, begin);
                return Ok(());
            };
            if buffer.is_complete() {
                return Ok(());
            }
            buffer.write_block(begin, data)?;
            self.downloaded.fetch_add(data.len() as u64, Ordering::Relaxed);

            if !buffer.is_complete() {
                return Ok(());
            }
            if !buffer.verify() {
                warn!("Piece {} failed hash verification, re-requesting", index);
                buffer.reset();
                self.work_available.notify_waiters();
                return Ok(());
            }
            buffer.data().to_vec()
        };

        let offset = index as u64 * self.torrent.piece_length;
        if let Err(e) = self.file.write_at(offset, &verified).await {
            error!("Failed to write piece {}: {}", index, e);
            self.fail(e.clone());
            return Err(e);
        }

        let complete = {
            let mut have = self.have.lock().await;
            have.set(index as usize)?;
            self.active.lock().await.remove(&index);
            info!(
                "Piece {} verified and written ({}/{})",
                index,
                have.count(),
                have.len()
            );
            have.is_complete()
        };
        if complete {
            self.completed.notify_one();
        }
        Ok(())
    }

    /// End the run with a fatal error
    pub fn fail(&self, err: TorrentError) {
        self.status.send_if_modified(|status| {
            if *status == RunStatus::Running {
                *status = RunStatus::Failed(err);
                true
            } else {
                false
            }
        });
        self.shutdown.send_replace(true);
    }

    /// Record that every piece is on disk and wind down the run's tasks
    pub fn mark_completed(&self) {
        self.status.send_if_modified(|status| {
            if *status == RunStatus::Running {
                *status = RunStatus::Completed;
                true
            } else {
                false
            }
        });
        self.shutdown.send_replace(true);
    }

    /// Connect to registry candidates while connection slots are free
    pub async fn dial(self: &Arc<Self>) {
        if *self.shutdown.borrow() {
            return;
        }
        let mut tasks = self.tasks.lock().await;
        reap_finished(&mut tasks);

        let candidates = self.peers.take_dial_candidates().await;
        if candidates.is_empty() {
            return;
        }
        debug!("Dialing {} peers", candidates.len());
        for addr in candidates {
            tasks.spawn(session::run_peer(self.clone(), addr));
        }
    }
}

/// Collect tasks that already ended so the set only holds live ones
fn reap_finished(tasks: &mut JoinSet<()>) {
    let mut reaped = 0;
    while let Some(joined) = tasks.try_join_next() {
        if let Err(e) = joined {
            if e.is_panic() {
                error!("Peer session panicked: {}", e);
            }
        }
        reaped += 1;
    }
    if reaped > 0 {
        trace!("Reaped {} finished tasks, {} still running", reaped, tasks.len());
    }
}

/// Resolve once `flag` is raised; never resolves if its sender is dropped first
pub(crate) async fn wait_for_flag(flag: &mut watch::Receiver<bool>) {
    if flag.wait_for(|raised| *raised).await.is_err() {
        std::future::pending::<()>().await;
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;
    use crate::storage::BLOCK_SIZE;
    use crate::torrent::TorrentInfo;
    use sha1::{Digest, Sha1};
    use std::time::Duration;

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn swarm(data: &[u8], piece_length: usize, strategy: PieceSelectionStrategy) -> (Arc<Swarm>, tempfile::TempDir) {
        let pieces = data
            .chunks(piece_length)
            .map(|chunk| -> [u8; 20] { Sha1::digest(chunk).into() })
            .collect();
        let torrent = TorrentInfo::new(
            "clip.mp4".to_string(),
            Vec::new(),
            [7u8; 20],
            piece_length as u64,
            pieces,
            data.len() as u64,
        )
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let file = Arc::new(OutputFile::create(&dir.path().join("clip.mp4"), data.len() as u64).await.unwrap());
        let (status, _) = watch::channel(RunStatus::Running);
        let swarm = Swarm::new(
            torrent,
            [1u8; 20],
            ConnectionTimeouts::default(),
            5,
            strategy,
            file,
            PeerManager::new(5, Duration::ZERO),
            Arc::new(status),
        );
        (Arc::new(swarm), dir)
    }

    fn unchoked_peer(port: u16, piece_count: usize) -> Peer {
        let mut peer = Peer::new(std::net::SocketAddr::from(([127, 0, 0, 1], port)), piece_count);
        peer.peer_choking = false;
        peer
    }

    #[tokio::test]
    async fn test_requests_cover_piece_once() {
        let data = content(BLOCK_SIZE as usize * 2 + 100);
        let (swarm, _dir) = swarm(&data, BLOCK_SIZE as usize * 4, PieceSelectionStrategy::Sequential).await;
        let peer = unchoked_peer(1, 1);

        let mut requests = Vec::new();
        while let Some(request) = swarm.next_request(&peer).await.unwrap() {
            requests.push(request);
        }
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[2].length, 100);

        swarm.release_requests(&requests[1..2]).await;
        let again = swarm.next_request(&peer).await.unwrap().unwrap();
        assert_eq!(again, requests[1]);
    }

    #[tokio::test]
    async fn test_second_peer_helps_active_piece() {
        let data = content(BLOCK_SIZE as usize * 4);
        let (swarm, _dir) = swarm(&data, BLOCK_SIZE as usize * 2, PieceSelectionStrategy::Sequential).await;

        let first = swarm.next_request(&unchoked_peer(1, 2)).await.unwrap().unwrap();
        let second = swarm.next_request(&unchoked_peer(2, 2)).await.unwrap().unwrap();
        assert_eq!((first.index, first.begin), (0, 0));
        assert_eq!((second.index, second.begin), (0, BLOCK_SIZE));
    }

    #[tokio::test]
    async fn test_piece_written_after_verification() {
        let data = content(BLOCK_SIZE as usize * 2);
        let (swarm, dir) = swarm(&data, BLOCK_SIZE as usize, PieceSelectionStrategy::Sequential).await;
        let peer = unchoked_peer(1, 2);

        let request = swarm.next_request(&peer).await.unwrap().unwrap();
        assert_eq!(request.index, 0);
        swarm.on_block(0, 0, &data[..BLOCK_SIZE as usize]).await.unwrap();
        assert_eq!(swarm.pieces_done().await, 1);
        assert_eq!(swarm.verified_bytes().await, BLOCK_SIZE as u64);

        let request = swarm.next_request(&peer).await.unwrap().unwrap();
        assert_eq!(request.index, 1);
        swarm.on_block(1, 0, &data[BLOCK_SIZE as usize..]).await.unwrap();
        assert!(swarm.is_complete().await);

        swarm.file.close().await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("clip.mp4")).unwrap(), data);
    }

    #[tokio::test]
    async fn test_corrupt_piece_is_reset() {
        let data = content(BLOCK_SIZE as usize);
        let (swarm, _dir) = swarm(&data, BLOCK_SIZE as usize, PieceSelectionStrategy::Sequential).await;
        let peer = unchoked_peer(1, 1);

        swarm.next_request(&peer).await.unwrap().unwrap();
        swarm.on_block(0, 0, &vec![0xEE; BLOCK_SIZE as usize]).await.unwrap();
        assert_eq!(swarm.pieces_done().await, 0);

        let retry = swarm.next_request(&peer).await.unwrap().unwrap();
        assert_eq!((retry.index, retry.begin), (0, 0));
        swarm.on_block(0, 0, &data).await.unwrap();
        assert!(swarm.is_complete().await);
    }

    #[tokio::test]
    async fn test_rarest_first_uses_registry() {
        let data = content(BLOCK_SIZE as usize * 3);
        let (swarm, _dir) = swarm(&data, BLOCK_SIZE as usize, PieceSelectionStrategy::RarestFirst).await;
        let a = std::net::SocketAddr::from(([127, 0, 0, 1], 1));
        let b = std::net::SocketAddr::from(([127, 0, 0, 1], 2));
        swarm.peers.add_peers(vec![a, b]).await;
        swarm.peers.take_dial_candidates().await;
        swarm.peers.update_bitfield(a, Bitfield::from_bytes(&[0b1110_0000], 3).unwrap()).await;
        swarm.peers.update_bitfield(b, Bitfield::from_bytes(&[0b1100_0000], 3).unwrap()).await;

        let mut peer = unchoked_peer(1, 3);
        peer.apply_message(&Message::Bitfield { bitfield: vec![0b1110_0000] }).unwrap();
        let request = swarm.next_request(&peer).await.unwrap().unwrap();
        assert_eq!(request.index, 2);
    }

    #[tokio::test]
    async fn test_release_wakes_waiting_sessions() {
        let data = content(BLOCK_SIZE as usize * 2);
        let (swarm, _dir) = swarm(&data, BLOCK_SIZE as usize * 2, PieceSelectionStrategy::Sequential).await;
        let first = swarm.next_request(&unchoked_peer(1, 1)).await.unwrap().unwrap();
        let second = swarm.next_request(&unchoked_peer(1, 1)).await.unwrap().unwrap();
        let idle_peer = unchoked_peer(2, 1);
        assert_eq!(swarm.next_request(&idle_peer).await.unwrap(), None);

        let woken = swarm.work_available.notified();
        tokio::pin!(woken);
        woken.as_mut().enable();
        swarm.release_requests(&[second]).await;
        tokio::time::timeout(Duration::from_secs(1), woken).await.unwrap();

        let taken = swarm.next_request(&idle_peer).await.unwrap().unwrap();
        assert_eq!(taken, second);
        assert_ne!(taken, first);
    }

    #[tokio::test]
    async fn test_failed_verification_wakes_waiting_sessions() {
        let data = content(BLOCK_SIZE as usize);
        let (swarm, _dir) = swarm(&data, BLOCK_SIZE as usize, PieceSelectionStrategy::Sequential).await;
        swarm.next_request(&unchoked_peer(1, 1)).await.unwrap().unwrap();

        let woken = swarm.work_available.notified();
        tokio::pin!(woken);
        woken.as_mut().enable();
        swarm.on_block(0, 0, &vec![0u8; BLOCK_SIZE as usize]).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), woken).await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_reaps_finished_sessions() {
        let data = content(BLOCK_SIZE as usize);
        let (swarm, _dir) = swarm(&data, BLOCK_SIZE as usize, PieceSelectionStrategy::Sequential).await;

        // Nothing listens on this port, so every session ends right after dialing
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed = listener.local_addr().unwrap();
        drop(listener);
        swarm.peers.add_peers(vec![closed]).await;

        for _ in 0..3 {
            swarm.dial().await;
            swarm.slot_freed.notified().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        swarm.dial().await;
        assert_eq!(swarm.tasks.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_block_ignored() {
        let data = content(BLOCK_SIZE as usize);
        let (swarm, _dir) = swarm(&data, BLOCK_SIZE as usize, PieceSelectionStrategy::Sequential).await;
        swarm.on_block(0, 0, &data).await.unwrap();
        assert_eq!(swarm.pieces_done().await, 0);
        assert_eq!(swarm.downloaded(), 0);
    }
}
