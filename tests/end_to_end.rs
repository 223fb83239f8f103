//! End-to-end downloads against in-process seeding peers over loopback TCP.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use torrent_stream::protocol::{BitTorrentWire, Handshake, Message, WireProtocol};
use torrent_stream::tracker::{AnnounceRequest, PeerDescriptor};
use torrent_stream::{
    run_job, AnnounceEvent, Announcer, BencodeValue, Bitfield, Config, DownloadManager, DownloadOutcome,
    FailureReason, JobObserver, JobRequest, TorrentInfo, TorrentParser, TrackerResponse,
};

const SEEDER_ID: [u8; 20] = *b"-SD0001-abcdefghijkl";

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

fn piece_hashes(data: &[u8], piece_length: usize) -> Vec<[u8; 20]> {
    data.chunks(piece_length).map(|chunk| Sha1::digest(chunk).into()).collect()
}

/// How a test seeder treats its leechers
#[derive(Debug, Clone, Default)]
struct Behavior {
    /// Damage the first block served for this piece, once
    corrupt_piece: Option<u32>,
    /// Hang up on this many connections before serving any
    drop_first: usize,
    /// Accept requests but never answer them
    silent: bool,
    /// Hold the unchoke back this long after the bitfield
    unchoke_delay: Option<Duration>,
}

/// A seeding peer that advertises `has` and serves requests from `data`
async fn spawn_seeder(
    info_hash: [u8; 20],
    data: Arc<Vec<u8>>,
    piece_length: usize,
    has: Vec<usize>,
    behavior: Behavior,
) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let corrupted = Arc::new(AtomicBool::new(false));
    tokio::spawn(async move {
        let mut accepted = 0;
        while let Ok((stream, _)) = listener.accept().await {
            accepted += 1;
            if accepted <= behavior.drop_first {
                drop(stream);
                continue;
            }
            tokio::spawn(serve(
                stream,
                info_hash,
                data.clone(),
                piece_length,
                has.clone(),
                behavior.clone(),
                corrupted.clone(),
            ));
        }
    });
    addr
}

async fn serve(
    mut stream: TcpStream,
    info_hash: [u8; 20],
    data: Arc<Vec<u8>>,
    piece_length: usize,
    has: Vec<usize>,
    behavior: Behavior,
    corrupted: Arc<AtomicBool>,
) {
    let mut wire = BitTorrentWire;
    match wire.read_handshake(&mut stream).await {
        Ok(theirs) if theirs.info_hash == info_hash => {}
        _ => return,
    }
    if wire
        .write_handshake(&mut stream, &Handshake::new(info_hash, SEEDER_ID))
        .await
        .is_err()
    {
        return;
    }

    let mut bitfield = Bitfield::new(data.len().div_ceil(piece_length));
    for index in has {
        bitfield.set(index).unwrap();
    }
    let advertised = Message::Bitfield {
        bitfield: bitfield.as_bytes().to_vec(),
    };
    if wire.write_message(&mut stream, &advertised).await.is_err() {
        return;
    }
    if let Some(delay) = behavior.unchoke_delay {
        tokio::time::sleep(delay).await;
    }
    if wire.write_message(&mut stream, &Message::Unchoke).await.is_err() {
        return;
    }

    loop {
        match wire.read_message(&mut stream).await {
            Ok(Message::Request { .. }) if behavior.silent => {}
            Ok(Message::Request { index, begin, length }) => {
                let start = index as usize * piece_length + begin as usize;
                let mut block = data[start..start + length as usize].to_vec();
                if behavior.corrupt_piece == Some(index) && !corrupted.swap(true, Ordering::SeqCst) {
                    block[0] ^= 0xFF;
                }
                let reply = Message::Piece { index, begin, block };
                if wire.write_message(&mut stream, &reply).await.is_err() {
                    return;
                }
            }
            Ok(_) => {}
            Err(_) => return,
        }
    }
}

/// Hands out a fixed peer list and records every event
struct StaticAnnouncer {
    peers: Vec<SocketAddr>,
    events: Mutex<Vec<AnnounceEvent>>,
}

impl StaticAnnouncer {
    fn new(peers: Vec<SocketAddr>) -> Self {
        Self {
            peers,
            events: Mutex::new(Vec::new()),
        }
    }

    fn events(&self) -> Vec<AnnounceEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Announcer for StaticAnnouncer {
    fn peer_id(&self) -> [u8; 20] {
        *b"-ST0100-leecherleech"
    }

    async fn announce(&self, _trackers: &[String], request: &AnnounceRequest) -> torrent_stream::Result<TrackerResponse> {
        self.events.lock().unwrap().push(request.event);
        Ok(TrackerResponse {
            interval: 1800,
            min_interval: None,
            tracker_id: None,
            seeders: self.peers.len() as u64,
            leechers: 0,
            peers: self
                .peers
                .iter()
                .map(|addr| PeerDescriptor::new(addr.ip().to_string(), addr.port()))
                .collect(),
            warning: None,
        })
    }
}

#[derive(Default)]
struct Recorder {
    progress: Mutex<Vec<f64>>,
    completed: Mutex<Vec<PathBuf>>,
    failures: Mutex<Vec<FailureReason>>,
}

impl JobObserver for Recorder {
    fn on_progress(&self, _job_id: &str, percent: f64, _speed: f64, _eta: Option<u64>) {
        self.progress.lock().unwrap().push(percent);
    }

    fn on_complete(&self, _job_id: &str, output_path: &Path) {
        self.completed.lock().unwrap().push(output_path.to_path_buf());
    }

    fn on_failure(&self, _job_id: &str, reason: &FailureReason) {
        self.failures.lock().unwrap().push(reason.clone());
    }
}

#[tokio::test]
async fn test_download_from_seeder_with_corrupt_block() {
    let piece_length = 16384;
    let data = Arc::new(payload(3 * piece_length));
    let info_hash = [9u8; 20];
    let torrent = TorrentInfo::new(
        "clip.mp4".to_string(),
        vec!["http://tracker.invalid/announce".to_string()],
        info_hash,
        piece_length as u64,
        piece_hashes(&data, piece_length),
        data.len() as u64,
    )
    .unwrap();

    let seeder = spawn_seeder(
        info_hash,
        data.clone(),
        piece_length,
        vec![0, 1, 2],
        Behavior {
            corrupt_piece: Some(1),
            ..Behavior::default()
        },
    )
    .await;
    let announcer = Arc::new(StaticAnnouncer::new(vec![seeder]));

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("v1").join("clip.mp4");
    let mut manager = DownloadManager::new(torrent, output.clone(), Config::default(), announcer.clone());
    let reports = Arc::new(Mutex::new(Vec::new()));
    {
        let reports = reports.clone();
        manager.set_progress_callback(Arc::new(move |report: &torrent_stream::ProgressReport| {
            reports.lock().unwrap().push(report.percent);
        }));
    }

    manager.start().await.unwrap();
    assert_eq!(std::fs::metadata(&output).unwrap().len(), 49_152);

    let outcome = tokio::time::timeout(Duration::from_secs(30), manager.wait_for_completion())
        .await
        .expect("download timed out")
        .unwrap();
    assert_eq!(outcome, DownloadOutcome::Completed);
    manager.stop().await.unwrap();

    assert_eq!(std::fs::read(&output).unwrap(), *data);
    assert_eq!(reports.lock().unwrap().last().copied(), Some(100.0));
    assert_eq!(
        announcer.events(),
        vec![AnnounceEvent::Started, AnnounceEvent::Completed, AnnounceEvent::Stopped]
    );
}

#[tokio::test]
async fn test_pieces_split_across_peers() {
    let piece_length = 32768;
    let data = Arc::new(payload(2 * piece_length + 4464));
    let info_hash = [5u8; 20];
    let torrent = TorrentInfo::new(
        "split.mp4".to_string(),
        Vec::new(),
        info_hash,
        piece_length as u64,
        piece_hashes(&data, piece_length),
        data.len() as u64,
    )
    .unwrap();

    let first = spawn_seeder(info_hash, data.clone(), piece_length, vec![0, 2], Behavior::default()).await;
    let second = spawn_seeder(info_hash, data.clone(), piece_length, vec![1], Behavior::default()).await;
    let announcer = Arc::new(StaticAnnouncer::new(vec![first, second]));

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("split.mp4");
    let manager = DownloadManager::new(torrent, output.clone(), Config::default(), announcer);

    manager.start().await.unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(30), manager.wait_for_completion())
        .await
        .expect("download timed out")
        .unwrap();
    assert_eq!(outcome, DownloadOutcome::Completed);
    manager.stop().await.unwrap();

    assert_eq!(std::fs::read(&output).unwrap(), *data);
}

#[tokio::test]
async fn test_wrong_info_hash_peer_is_dropped() {
    let piece_length = 16384;
    let data = Arc::new(payload(piece_length));
    let torrent = TorrentInfo::new(
        "one.bin".to_string(),
        Vec::new(),
        [1u8; 20],
        piece_length as u64,
        piece_hashes(&data, piece_length),
        data.len() as u64,
    )
    .unwrap();

    // Serves a different torrent, so the handshake never validates
    let stranger = spawn_seeder([2u8; 20], data.clone(), piece_length, vec![0], Behavior::default()).await;
    let announcer = Arc::new(StaticAnnouncer::new(vec![stranger]));

    let dir = tempfile::tempdir().unwrap();
    let manager = Arc::new(DownloadManager::new(
        torrent,
        dir.path().join("one.bin"),
        Config::default(),
        announcer,
    ));
    manager.start().await.unwrap();

    let waited = tokio::time::timeout(Duration::from_millis(500), manager.wait_for_completion()).await;
    assert!(waited.is_err(), "download must not complete from a mismatched peer");

    manager.stop().await.unwrap();
    assert_eq!(manager.wait_for_completion().await.unwrap(), DownloadOutcome::Stopped);
}

fn small_torrent(data: &[u8], piece_length: usize, info_hash: [u8; 20]) -> TorrentInfo {
    TorrentInfo::new(
        "clip.mp4".to_string(),
        Vec::new(),
        info_hash,
        piece_length as u64,
        piece_hashes(data, piece_length),
        data.len() as u64,
    )
    .unwrap()
}

#[tokio::test]
async fn test_dropped_peer_redialed_after_cooldown() {
    let piece_length = 16384;
    let data = Arc::new(payload(3 * piece_length));
    let info_hash = [3u8; 20];

    let seeder = spawn_seeder(
        info_hash,
        data.clone(),
        piece_length,
        vec![0, 1, 2],
        Behavior {
            drop_first: 1,
            ..Behavior::default()
        },
    )
    .await;
    // The announcer hands out a 1800s interval, so only the cooldown can bring the seeder back
    let announcer = Arc::new(StaticAnnouncer::new(vec![seeder]));
    let config = Config {
        redial_cooldown: Duration::from_secs(1),
        ..Config::default()
    };

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("clip.mp4");
    let manager = DownloadManager::new(small_torrent(&data, piece_length, info_hash), output.clone(), config, announcer);
    manager.start().await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(10), manager.wait_for_completion())
        .await
        .expect("known seeder was not redialed after its cooldown")
        .unwrap();
    assert_eq!(outcome, DownloadOutcome::Completed);
    manager.stop().await.unwrap();
    assert_eq!(std::fs::read(&output).unwrap(), *data);
}

#[tokio::test]
async fn test_unanswered_blocks_move_to_another_peer() {
    let piece_length = 16384;
    let data = Arc::new(payload(3 * piece_length));
    let info_hash = [4u8; 20];

    // Unchokes at once and claims every block, then never answers
    let hoarder = spawn_seeder(
        info_hash,
        data.clone(),
        piece_length,
        vec![0, 1, 2],
        Behavior {
            silent: true,
            ..Behavior::default()
        },
    )
    .await;
    // Unchokes once everything is claimed and then has nothing left to ask for
    let helper = spawn_seeder(
        info_hash,
        data.clone(),
        piece_length,
        vec![0, 1, 2],
        Behavior {
            unchoke_delay: Some(Duration::from_millis(300)),
            ..Behavior::default()
        },
    )
    .await;

    let announcer = Arc::new(StaticAnnouncer::new(vec![hoarder, helper]));
    let config = Config {
        request_timeout: Duration::from_secs(1),
        redial_cooldown: Duration::from_secs(60),
        ..Config::default()
    };

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("clip.mp4");
    let manager = DownloadManager::new(small_torrent(&data, piece_length, info_hash), output.clone(), config, announcer);
    manager.start().await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(10), manager.wait_for_completion())
        .await
        .expect("blocks held by a stalled peer were never handed to the other one")
        .unwrap();
    assert_eq!(outcome, DownloadOutcome::Completed);
    manager.stop().await.unwrap();
    assert_eq!(std::fs::read(&output).unwrap(), *data);
}

/// Loopback HTTP tracker that answers every announce with `body`
async fn spawn_http_tracker(body: Vec<u8>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let body = body.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let mut read = 0;
                while !buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf[read..]).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => read += n,
                    }
                }
                let header = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(header.as_bytes()).await;
                let _ = socket.write_all(&body).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    format!("http://{}/announce", addr)
}

#[tokio::test]
async fn test_job_through_http_tracker() {
    let piece_length = 32768;
    let data = Arc::new(payload(70_000));
    let pieces: Vec<u8> = piece_hashes(&data, piece_length).concat();

    let info = BencodeValue::dict()
        .with("length", (data.len() as i64).into())
        .with("name", "Big Buck Bunny.mp4".into())
        .with("piece length", (piece_length as i64).into())
        .with("pieces", pieces.into());

    // The seeder must exist before the tracker can point at it
    let info_hash = TorrentParser::parse_bytes(
        &BencodeValue::dict()
            .with("announce", "http://placeholder/announce".into())
            .with("info", info.clone())
            .encode(),
    )
    .unwrap()
    .info_hash;
    let seeder = spawn_seeder(info_hash, data.clone(), piece_length, vec![0, 1, 2], Behavior::default()).await;

    let mut compact = vec![127u8, 0, 0, 1];
    compact.extend_from_slice(&seeder.port().to_be_bytes());
    let tracker_body = BencodeValue::dict()
        .with("interval", 1800i64.into())
        .with("complete", 1i64.into())
        .with("peers", compact.into())
        .encode();
    let tracker_url = spawn_http_tracker(tracker_body).await;

    let dir = tempfile::tempdir().unwrap();
    let torrent_path = dir.path().join("bbb.torrent");
    let metainfo = BencodeValue::dict()
        .with("announce", tracker_url.as_str().into())
        .with("info", info);
    std::fs::write(&torrent_path, metainfo.encode()).unwrap();

    let request = JobRequest {
        job_id: "job-42".to_string(),
        video_id: "video-7".to_string(),
        source: torrent_path.to_string_lossy().to_string(),
        output_directory: dir.path().join("media"),
    };
    let observer = Arc::new(Recorder::default());
    let (_cancel_tx, cancel) = watch::channel(false);

    let result = tokio::time::timeout(
        Duration::from_secs(30),
        run_job(&request, &Config::default(), observer.clone(), cancel),
    )
    .await
    .expect("job timed out");

    let path = result.unwrap();
    assert!(path.is_absolute());
    assert!(path.ends_with("video-7/Big Buck Bunny.mp4"));
    assert_eq!(std::fs::read(&path).unwrap(), *data);
    assert_eq!(*observer.completed.lock().unwrap(), vec![path]);
    assert!(observer.failures.lock().unwrap().is_empty());
    assert_eq!(observer.progress.lock().unwrap().last().copied(), Some(100.0));
}
