//! End-to-end transfers between engine instances sharing an in-process hub.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;

use bagstore::{
    BagInfo, DbError, HeaderResponse, KvStore, MemoryConnector, MemoryHub, MemoryKv, PeerId,
    PieceProof, PieceProvider, PieceResponse, Storage, StorageConfig, Torrent, TorrentStatus,
};

fn test_config() -> StorageConfig {
    StorageConfig {
        request_timeout: Duration::from_secs(2),
        connect_attempts: 2,
        connect_backoff: Duration::from_millis(50),
        stop_grace: Duration::from_secs(1),
        ..StorageConfig::default()
    }
}

struct Node {
    storage: Arc<Storage>,
    kv: Arc<MemoryKv>,
    root: TempDir,
}

async fn node(hub: &Arc<MemoryHub>, id: u8) -> Node {
    let kv = MemoryKv::new();
    let root = TempDir::new().unwrap();
    let storage = open_storage(hub, id, Arc::clone(&kv), root.path()).await;
    Node { storage, kv, root }
}

async fn open_storage(
    hub: &Arc<MemoryHub>,
    id: u8,
    kv: Arc<MemoryKv>,
    root: &Path,
) -> Arc<Storage> {
    init_tracing();
    let connector = MemoryConnector::new(Arc::clone(hub), PeerId([id; 32]));
    Storage::open(kv as Arc<dyn KvStore>, connector, root, test_config())
        .await
        .unwrap()
}

/// Honors `RUST_LOG` when debugging a test run; a no-op after the first
/// call.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn write_source(dir: &Path) {
    std::fs::create_dir_all(dir.join("sub")).unwrap();
    std::fs::write(dir.join("a.bin"), make_bytes(0, 1500)).unwrap();
    std::fs::write(dir.join("b.bin"), make_bytes(1, 700)).unwrap();
    std::fs::write(dir.join("sub/c.bin"), make_bytes(2, 2300)).unwrap();
}

fn make_bytes(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

async fn wait_for(mut cond: impl FnMut() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn created_bag_seeds_immediately() {
    let hub = MemoryHub::new();
    let seeder = node(&hub, 1).await;

    let src = TempDir::new().unwrap();
    write_source(src.path());
    let torrent = seeder
        .storage
        .create_bag(src.path(), "my files", 512)
        .await
        .unwrap();

    assert_eq!(torrent.status(), TorrentStatus::Seeding);
    let stats = torrent.stats();
    assert!(stats.completed);
    assert_eq!(stats.downloaded, stats.total);
    assert_eq!(stats.total, 1500 + 700 + 2300);
    assert_eq!(stats.description.as_deref(), Some("my files"));
    assert_eq!(seeder.storage.list().len(), 1);

    // identical content resolves to the same bag
    let again = seeder
        .storage
        .create_bag(src.path(), "my files", 512)
        .await
        .unwrap();
    assert_eq!(again.bag_id, torrent.bag_id);
    assert_eq!(seeder.storage.list().len(), 1);
}

#[tokio::test]
async fn two_instance_round_trip() {
    let hub = MemoryHub::new();
    let seeder = node(&hub, 1).await;
    let leecher = node(&hub, 2).await;

    let src = TempDir::new().unwrap();
    write_source(src.path());
    let seed = seeder
        .storage
        .create_bag(src.path(), "round trip", 512)
        .await
        .unwrap();

    let download = leecher.storage.download_bag(seed.bag_id, true).await.unwrap();
    let t = Arc::clone(&download);
    wait_for(move || t.is_complete(), "download to complete").await;
    assert_eq!(download.status(), TorrentStatus::Seeding);
    assert_eq!(download.stats().downloaded, download.stats().total);

    let out = TempDir::new().unwrap();
    download.extract(out.path()).await.unwrap();
    assert_eq!(
        std::fs::read(out.path().join("a.bin")).unwrap(),
        make_bytes(0, 1500)
    );
    assert_eq!(
        std::fs::read(out.path().join("b.bin")).unwrap(),
        make_bytes(1, 700)
    );
    assert_eq!(
        std::fs::read(out.path().join("sub/c.bin")).unwrap(),
        make_bytes(2, 2300)
    );
}

#[tokio::test]
async fn double_start_never_duplicates_fetches() {
    let hub = MemoryHub::new();
    let seeder = node(&hub, 1).await;
    let leecher = node(&hub, 2).await;

    let src = TempDir::new().unwrap();
    write_source(src.path());
    let seed = seeder
        .storage
        .create_bag(src.path(), "dup", 512)
        .await
        .unwrap();

    let download = leecher.storage.download_bag(seed.bag_id, true).await.unwrap();
    // racing start calls while the download is running must be no-ops
    let (a, b) = tokio::join!(download.start(true), download.start(true));
    a.unwrap();
    b.unwrap();
    leecher.storage.download_bag(seed.bag_id, true).await.unwrap();

    let t = Arc::clone(&download);
    wait_for(move || t.is_complete(), "download to complete").await;

    let pieces = download.info().unwrap().piece_count();
    // piece 0 rides along with the header response, so it is never
    // requested on its own; every other piece exactly once
    assert_eq!(hub.piece_request_count(&seed.bag_id, 0), 0);
    for index in 1..pieces {
        assert_eq!(
            hub.piece_request_count(&seed.bag_id, index),
            1,
            "piece {index} fetched more than once"
        );
    }
}

#[tokio::test]
async fn restart_resumes_without_refetching() {
    let hub = MemoryHub::new();
    let seeder = node(&hub, 1).await;
    let leecher = node(&hub, 2).await;

    let src = TempDir::new().unwrap();
    write_source(src.path());
    let seed = seeder
        .storage
        .create_bag(src.path(), "resume", 512)
        .await
        .unwrap();

    let download = leecher.storage.download_bag(seed.bag_id, true).await.unwrap();
    let t = Arc::clone(&download);
    wait_for(move || t.is_complete(), "download to complete").await;
    let pieces = download.info().unwrap().piece_count();
    let counts: Vec<u32> = (0..pieces)
        .map(|i| hub.piece_request_count(&seed.bag_id, i))
        .collect();

    // wind down and reopen over the same durable store and data root
    let Node { storage, kv, root } = leecher;
    storage.shutdown().await;
    drop(download);
    drop(storage);
    let storage = open_storage(&hub, 2, kv, root.path()).await;

    let resumed = storage.get(&seed.bag_id).unwrap();
    assert_eq!(resumed.status(), TorrentStatus::Seeding);
    assert!(resumed.is_complete());

    tokio::time::sleep(Duration::from_millis(500)).await;
    for (index, before) in counts.iter().enumerate() {
        assert_eq!(
            hub.piece_request_count(&seed.bag_id, index as u32),
            *before,
            "piece {index} refetched after restart"
        );
    }
}

#[tokio::test]
async fn stopped_torrent_keeps_progress_and_restarts() {
    let hub = MemoryHub::new();
    let seeder = node(&hub, 1).await;
    let leecher = node(&hub, 2).await;

    let src = TempDir::new().unwrap();
    write_source(src.path());
    let seed = seeder
        .storage
        .create_bag(src.path(), "stop", 512)
        .await
        .unwrap();

    let download = leecher.storage.download_bag(seed.bag_id, true).await.unwrap();
    let t = Arc::clone(&download);
    wait_for(move || t.is_complete(), "download to complete").await;

    download.stop().await.unwrap();
    assert_eq!(download.status(), TorrentStatus::Stopped);
    assert!(download.is_complete());

    let again = leecher.storage.download_bag(seed.bag_id, true).await.unwrap();
    assert!(Arc::ptr_eq(&again, &download));
    assert_eq!(again.status(), TorrentStatus::Seeding);
}

#[tokio::test]
async fn remove_bag_forgets_the_torrent() {
    let hub = MemoryHub::new();
    let seeder = node(&hub, 1).await;

    let src = TempDir::new().unwrap();
    write_source(src.path());
    let torrent = seeder
        .storage
        .create_bag(src.path(), "remove", 512)
        .await
        .unwrap();
    let id = torrent.bag_id;

    seeder.storage.remove_bag(&id, true).await.unwrap();
    assert!(seeder.storage.get(&id).is_none());
    assert_eq!(torrent.status(), TorrentStatus::Removed);
    assert!(matches!(
        seeder.storage.remove_bag(&id, true).await,
        Err(bagstore::StorageError::NotFound(_))
    ));
}

/// Announces garbage for a bag: plausible lengths, proofs that never
/// verify. A downloader must route around it.
struct LyingProvider {
    info: BagInfo,
    depth: usize,
}

#[async_trait]
impl PieceProvider for LyingProvider {
    async fn header(&self, _from: PeerId) -> Option<HeaderResponse> {
        Some(HeaderResponse {
            info: self.info.clone(),
            piece0: Bytes::from(vec![0xEE; self.info.piece_len(0) as usize]),
            proof: PieceProof {
                siblings: vec![[0u8; 32]; self.depth],
            },
        })
    }

    async fn piece(&self, _from: PeerId, index: u32) -> Option<PieceResponse> {
        if index >= self.info.piece_count() {
            return None;
        }
        Some(PieceResponse {
            data: Bytes::from(vec![0xEE; self.info.piece_len(index) as usize]),
            proof: PieceProof {
                siblings: vec![[0u8; 32]; self.depth],
            },
        })
    }
}

#[tokio::test]
async fn download_survives_a_lying_peer() {
    let hub = MemoryHub::new();
    let seeder = node(&hub, 1).await;
    let leecher = node(&hub, 2).await;

    let src = TempDir::new().unwrap();
    write_source(src.path());
    let seed = seeder
        .storage
        .create_bag(src.path(), "liar", 512)
        .await
        .unwrap();
    let info = seed.info().unwrap();

    let liar_connector = MemoryConnector::new(Arc::clone(&hub), PeerId([66; 32]));
    let liar: Arc<dyn PieceProvider> = Arc::new(LyingProvider {
        depth: bagstore::piece_tree::tree_depth(info.piece_count()),
        info,
    });
    bagstore::Connector::announce(&*liar_connector, seed.bag_id, Arc::clone(&liar));

    let download = leecher.storage.download_bag(seed.bag_id, true).await.unwrap();
    let t = Arc::clone(&download);
    wait_for(move || t.is_complete(), "download to complete").await;

    let out = TempDir::new().unwrap();
    download.extract(out.path()).await.unwrap();
    assert_eq!(
        std::fs::read(out.path().join("a.bin")).unwrap(),
        make_bytes(0, 1500)
    );
}

/// Serves a seed's verified pieces only below a movable index, so a
/// download can be frozen partway through.
struct GatedProvider {
    inner: Arc<Torrent>,
    limit: AtomicU32,
}

#[async_trait]
impl PieceProvider for GatedProvider {
    async fn header(&self, from: PeerId) -> Option<HeaderResponse> {
        self.inner.header(from).await
    }

    async fn piece(&self, from: PeerId, index: u32) -> Option<PieceResponse> {
        if index >= self.limit.load(Ordering::SeqCst) {
            return None;
        }
        self.inner.piece(from, index).await
    }
}

#[tokio::test]
async fn interrupted_download_resumes_fetching_only_missing_pieces() {
    let hub = MemoryHub::new();
    let seeder = node(&hub, 1).await;
    let leecher = node(&hub, 2).await;

    let src = TempDir::new().unwrap();
    write_source(src.path());
    let seed = seeder
        .storage
        .create_bag(src.path(), "partial", 512)
        .await
        .unwrap();
    let info = seed.info().unwrap();
    let total_pieces = info.piece_count();
    assert!(total_pieces > 5);

    // take the normal seeder offline; its data stays reachable through a
    // gate that stops serving at piece 4
    seeder.storage.shutdown().await;
    let gated = Arc::new(GatedProvider {
        inner: Arc::clone(&seed),
        limit: AtomicU32::new(4),
    });
    let gate_connector = MemoryConnector::new(Arc::clone(&hub), PeerId([9; 32]));
    bagstore::Connector::announce(
        &*gate_connector,
        seed.bag_id,
        Arc::clone(&gated) as Arc<dyn PieceProvider>,
    );

    let download = leecher
        .storage
        .download_bag(seed.bag_id, true)
        .await
        .unwrap();
    let t = Arc::clone(&download);
    let header_size = info.header_size;
    wait_for(
        move || t.stats().downloaded + header_size >= 4 * 512,
        "the gated pieces",
    )
    .await;

    // freeze the instance mid-download
    let Node { storage, kv, root } = leecher;
    storage.shutdown().await;
    drop(storage);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let verified = ((download.stats().downloaded + header_size) / 512) as u32;
    assert!(verified >= 4 && verified < total_pieces);
    let counts: Vec<u32> = (0..total_pieces)
        .map(|i| hub.piece_request_count(&seed.bag_id, i))
        .collect();
    drop(download);

    gated.limit.store(total_pieces, Ordering::SeqCst);
    let storage = open_storage(&hub, 2, kv, root.path()).await;
    let resumed = storage.get(&seed.bag_id).unwrap();
    let t = Arc::clone(&resumed);
    wait_for(move || t.is_complete(), "the resumed download").await;

    // pieces verified before the restart were never requested again
    assert_eq!(hub.piece_request_count(&seed.bag_id, 0), 0);
    for index in 1..verified {
        assert_eq!(
            hub.piece_request_count(&seed.bag_id, index),
            counts[index as usize],
            "piece {index} refetched after resume"
        );
    }

    let out = TempDir::new().unwrap();
    resumed.extract(out.path()).await.unwrap();
    assert_eq!(
        std::fs::read(out.path().join("sub/c.bin")).unwrap(),
        make_bytes(2, 2300)
    );
}

#[tokio::test]
async fn header_only_start_resolves_info_without_payload() {
    let hub = MemoryHub::new();
    let seeder = node(&hub, 1).await;
    let leecher = node(&hub, 2).await;

    let src = TempDir::new().unwrap();
    write_source(src.path());
    let seed = seeder
        .storage
        .create_bag(src.path(), "info only", 512)
        .await
        .unwrap();

    let download = leecher
        .storage
        .download_bag(seed.bag_id, false)
        .await
        .unwrap();
    let t = Arc::clone(&download);
    wait_for(move || t.info().is_some(), "the info to resolve").await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert!(!download.is_complete());
    assert_eq!(download.stats().total, 1500 + 700 + 2300);
    let pieces = download.info().unwrap().piece_count();
    for index in 1..pieces {
        assert_eq!(
            hub.piece_request_count(&seed.bag_id, index),
            0,
            "piece {index} fetched in header-only mode"
        );
    }

    // a later full start picks up from the persisted info
    download.stop().await.unwrap();
    let again = leecher
        .storage
        .download_bag(seed.bag_id, true)
        .await
        .unwrap();
    let t = Arc::clone(&again);
    wait_for(move || t.is_complete(), "the full download").await;
}

/// Delegates to a real in-memory store but fails deletes on demand.
struct FlakyDeleteKv {
    inner: Arc<MemoryKv>,
    fail_deletes: AtomicBool,
}

#[async_trait]
impl KvStore for FlakyDeleteKv {
    async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), DbError> {
        self.inner.put(key, value).await
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &[u8]) -> Result<(), DbError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(DbError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected delete failure",
            )));
        }
        self.inner.delete(key).await
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DbError> {
        self.inner.scan_prefix(prefix).await
    }
}

#[tokio::test]
async fn failed_remove_keeps_the_bag_registered() {
    init_tracing();
    let hub = MemoryHub::new();
    let kv = Arc::new(FlakyDeleteKv {
        inner: MemoryKv::new(),
        fail_deletes: AtomicBool::new(false),
    });
    let root = TempDir::new().unwrap();
    let connector = MemoryConnector::new(Arc::clone(&hub), PeerId([1; 32]));
    let storage = Storage::open(
        Arc::clone(&kv) as Arc<dyn KvStore>,
        connector,
        root.path(),
        test_config(),
    )
    .await
    .unwrap();

    let src = TempDir::new().unwrap();
    write_source(src.path());
    let torrent = storage.create_bag(src.path(), "sticky", 512).await.unwrap();
    let id = torrent.bag_id;

    kv.fail_deletes.store(true, Ordering::SeqCst);
    storage.remove_bag(&id, true).await.unwrap_err();
    // still registered, so the removal can be retried
    assert!(storage.get(&id).is_some());

    kv.fail_deletes.store(false, Ordering::SeqCst);
    storage.remove_bag(&id, true).await.unwrap();
    assert!(storage.get(&id).is_none());
}
