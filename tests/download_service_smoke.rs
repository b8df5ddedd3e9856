use rust_lanshare::{
    download::{
        AddOutcome, CHUNK_SIZE, ChunkRequest, DownloadServiceConfig, DownloadServiceStatus,
        DownloadStatus, Entry, FileCache, LoadedQueue, PeerDirectory, PeerHandle,
        ProgressReporter, Reply, start_service, store,
    },
    hash::Hash,
};
use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::sync::watch;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    let id = NEXT.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("{prefix}_{}_{}", std::process::id(), id))
}

#[derive(Default)]
struct MemoryCache {
    chunks: Mutex<HashSet<Hash>>,
}

impl MemoryCache {
    fn store(&self, hash: Hash) {
        self.chunks.lock().expect("cache lock").insert(hash);
    }

    fn len(&self) -> usize {
        self.chunks.lock().expect("cache lock").len()
    }
}

impl FileCache for MemoryCache {
    fn have_chunks(&self, hashes: &[Hash]) -> Vec<bool> {
        let chunks = self.chunks.lock().expect("cache lock");
        hashes.iter().map(|h| chunks.contains(h)).collect()
    }

    fn amount(&self) -> u64 {
        self.len() as u64 * CHUNK_SIZE
    }
}

/// Peer serving a fixed tree; every answer comes from a spawned task.
struct MemoryPeer {
    id: Hash,
    dirs: HashMap<String, Vec<Entry>>,
    cache: Arc<MemoryCache>,
}

fn chunk_hash(name: &str, index: usize) -> Hash {
    let mut b = [0u8; 20];
    b[0] = index as u8 + 1;
    for (i, byte) in name.bytes().enumerate() {
        b[1 + i % 19] ^= byte;
    }
    Hash::new(b)
}

impl PeerHandle for MemoryPeer {
    fn id(&self) -> Hash {
        self.id
    }

    fn get_entries(&self, dir: &Entry, reply: Reply<Vec<Entry>>) {
        let key = format!("{}{}/", dir.path, dir.name);
        let children = self.dirs.get(&key).cloned().unwrap_or_default();
        tokio::spawn(async move {
            reply.send(Ok(children));
        });
    }

    fn get_hashes(&self, file: &Entry, reply: Reply<Vec<Hash>>) {
        let hashes = (0..file.chunk_count())
            .map(|i| chunk_hash(&file.name, i))
            .collect();
        tokio::spawn(async move {
            reply.send(Ok(hashes));
        });
    }

    fn get_chunk(&self, request: ChunkRequest, progress: ProgressReporter, reply: Reply<u64>) {
        let cache = self.cache.clone();
        tokio::spawn(async move {
            progress.report(request.len / 2);
            tokio::task::yield_now().await;
            progress.report(request.len);
            cache.store(request.hash);
            reply.send(Ok(request.len));
        });
    }
}

#[derive(Default)]
struct MemoryPeers {
    peers: RwLock<HashMap<Hash, Arc<dyn PeerHandle>>>,
}

impl MemoryPeers {
    fn insert(&self, peer: Arc<dyn PeerHandle>) {
        self.peers
            .write()
            .expect("peers lock")
            .insert(peer.id(), peer);
    }
}

impl PeerDirectory for MemoryPeers {
    fn get_peer(&self, id: &Hash) -> Option<Arc<dyn PeerHandle>> {
        self.peers.read().expect("peers lock").get(id).cloned()
    }
}

async fn wait_for(
    rx: &mut watch::Receiver<DownloadServiceStatus>,
    what: &str,
    pred: impl Fn(&DownloadServiceStatus) -> bool,
) {
    let waited = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if pred(&rx.borrow_and_update()) {
                return;
            }
            rx.changed().await.expect("download service alive");
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

fn music_peer(id: Hash, cache: Arc<MemoryCache>) -> MemoryPeer {
    let mut dirs = HashMap::new();
    dirs.insert(
        "/share/music/".to_string(),
        vec![
            Entry::file("/share/music/", "long.flac", CHUNK_SIZE + 10),
            Entry::file("/share/music/", "short.flac", 1000),
        ],
    );
    MemoryPeer { id, dirs, cache }
}

#[tokio::test]
async fn directory_download_completes_end_to_end() {
    let root = unique_temp_dir("rust_lanshare_smoke_dir");
    let cache = Arc::new(MemoryCache::default());
    let peers = Arc::new(MemoryPeers::default());
    let source = Hash::new([0x11; 20]);
    peers.insert(Arc::new(music_peer(source, cache.clone())));

    let cfg = DownloadServiceConfig::from_data_dir(&root);
    let queue_file = cfg.queue_file.clone();
    let (handle, mut status_rx, join) = start_service(cfg, peers.clone(), cache.clone())
        .await
        .expect("start");
    assert_eq!(handle.file_cache_loaded().await.expect("cache loaded"), 0);

    let outcome = handle
        .add_download(Entry::dir("/share/", "music"), source, false)
        .await
        .expect("add");
    assert!(matches!(outcome, AddOutcome::Queued(_)));

    wait_for(&mut status_rx, "both files to complete", |s| {
        s.completed_total == 2 && s.queue_len == 0 && s.in_flight == 0
    })
    .await;
    assert_eq!(cache.len(), 3);
    assert!(handle.downloads().await.expect("downloads").is_empty());

    handle.shutdown().await.expect("shutdown");
    join.await.expect("join").expect("service");

    let saved = store::load_queue(&queue_file).await.expect("load");
    assert!(matches!(saved, LoadedQueue::Loaded { records, .. } if records.is_empty()));
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn offline_source_resumes_when_peer_appears() {
    let root = unique_temp_dir("rust_lanshare_smoke_offline");
    let cache = Arc::new(MemoryCache::default());
    let peers = Arc::new(MemoryPeers::default());
    let source = Hash::new([0x22; 20]);

    let cfg = DownloadServiceConfig::from_data_dir(&root);
    let (handle, mut status_rx, join) = start_service(cfg, peers.clone(), cache.clone())
        .await
        .expect("start");
    handle.file_cache_loaded().await.expect("cache loaded");

    handle
        .add_download(Entry::file("/share/", "late.bin", 2 * CHUNK_SIZE), source, false)
        .await
        .expect("add");
    let listed = handle.downloads().await.expect("downloads");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, DownloadStatus::NoSource);
    assert_eq!(listed[0].chunk_count, 2);

    // Saved while still pending.
    handle.save_now().await.expect("save");

    peers.insert(Arc::new(music_peer(source, cache.clone())));
    handle.peer_available(source).await.expect("peer available");

    wait_for(&mut status_rx, "the file to complete", |s| {
        s.completed_total == 1 && s.queue_len == 0
    })
    .await;
    assert_eq!(cache.len(), 2);

    handle.shutdown().await.expect("shutdown");
    join.await.expect("join").expect("service");
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn restart_resumes_from_cached_chunks() {
    let root = unique_temp_dir("rust_lanshare_smoke_resume");
    let cache = Arc::new(MemoryCache::default());
    let peers = Arc::new(MemoryPeers::default());
    let source = Hash::new([0x33; 20]);

    let name = "big.iso";
    let entry = Entry::file("/share/", name, 3 * CHUNK_SIZE)
        .with_chunk_hashes((0..3).map(|i| chunk_hash(name, i)).collect());
    cache.store(chunk_hash(name, 0));
    cache.store(chunk_hash(name, 2));

    let cfg = DownloadServiceConfig::from_data_dir(&root);
    store::save_queue(
        &cfg.queue_file,
        &[rust_lanshare::download::QueueRecord {
            entry,
            peer_id: source,
            complete: true,
        }],
    )
    .await
    .expect("seed queue");

    let (handle, mut status_rx, join) = start_service(cfg, peers.clone(), cache.clone())
        .await
        .expect("start");
    assert_eq!(handle.file_cache_loaded().await.expect("cache loaded"), 1);

    let listed = handle.downloads().await.expect("downloads");
    assert_eq!(listed[0].done_chunks, 2);
    assert_eq!(listed[0].status, DownloadStatus::NoSource);

    peers.insert(Arc::new(music_peer(source, cache.clone())));
    handle.peer_available(source).await.expect("peer available");
    wait_for(&mut status_rx, "the last chunk", |s| s.completed_total == 1).await;
    assert_eq!(cache.len(), 3);

    handle.shutdown().await.expect("shutdown");
    join.await.expect("join").expect("service");
    let _ = std::fs::remove_dir_all(&root);
}
