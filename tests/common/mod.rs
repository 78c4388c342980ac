//! Shared fixtures for the cache integration tests.

#![allow(dead_code)]

use std::io::{self, Cursor, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use diskcache::{CacheConfig, CacheContext, FileCache, Upstream};
use diskcache_watch::{
    BackendFactory, EventQueue, FsEvent, MirrorOptions, WatchBackend, WatchRegistry, WatchResult,
};

/// Backend that asks for a full rescan whenever someone waits for the mirror,
/// so barriered snapshots always match the disk.
#[derive(Default)]
struct RescanOnBarrier {
    queue: EventQueue,
}

impl WatchBackend for RescanOnBarrier {
    fn register_directory(&self, _dir: &Path) -> WatchResult<()> {
        Ok(())
    }

    fn poll_events(&self, timeout: Duration) -> WatchResult<Vec<FsEvent>> {
        self.queue.poll(timeout)
    }

    fn queued_total(&self) -> u64 {
        self.queue.push(vec![FsEvent::Overflow(None)]);
        self.queue.queued_total()
    }

    fn close(&self) {
        self.queue.close();
    }
}

/// A context whose mirrors are exact at every barrier.
pub fn test_context(config: &CacheConfig) -> Arc<CacheContext> {
    let factory: BackendFactory = Arc::new(|| {
        let backend: Arc<dyn WatchBackend> = Arc::new(RescanOnBarrier::default());
        Ok(backend)
    });
    let options = MirrorOptions {
        poll_interval: Duration::from_millis(20),
        rescan_on_worker: false,
    };
    CacheContext::with_watch_registry(config, WatchRegistry::with_backend_factory(options, factory))
}

pub fn test_config(root: &Path, limit: u64) -> CacheConfig {
    let mut config = CacheConfig::new(root, limit);
    config.poll_interval_ms = 20;
    config
}

/// Cache on its own context, i.e. its own simulated process.
pub fn test_cache(root: &Path, limit: u64) -> FileCache {
    let config = test_config(root, limit);
    let context = test_context(&config);
    FileCache::with_context(config, context).unwrap()
}

pub fn data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

/// Upstream that counts the bytes it hands out and records being dropped.
pub struct Probe {
    inner: Cursor<Vec<u8>>,
    served: Arc<AtomicU64>,
    dropped: Arc<AtomicBool>,
    fail_after: Option<u64>,
}

#[derive(Clone, Default)]
pub struct ProbeStats {
    pub served: Arc<AtomicU64>,
    pub dropped: Arc<AtomicBool>,
}

impl ProbeStats {
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::SeqCst)
    }

    pub fn dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }
}

impl Probe {
    pub fn new(content: Vec<u8>) -> (Upstream, ProbeStats) {
        Self::build(content, None)
    }

    /// Serves `limit` bytes, then fails every read.
    pub fn failing_after(content: Vec<u8>, limit: u64) -> (Upstream, ProbeStats) {
        Self::build(content, Some(limit))
    }

    fn build(content: Vec<u8>, fail_after: Option<u64>) -> (Upstream, ProbeStats) {
        let stats = ProbeStats::default();
        let probe = Probe {
            inner: Cursor::new(content),
            served: Arc::clone(&stats.served),
            dropped: Arc::clone(&stats.dropped),
            fail_after,
        };
        (Box::new(probe), stats)
    }
}

impl Read for Probe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let served = self.served.load(Ordering::SeqCst);
        let buf = match self.fail_after {
            Some(limit) if served >= limit => {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "upstream went away"));
            }
            Some(limit) => {
                let room = (limit - served).min(buf.len() as u64) as usize;
                &mut buf[..room]
            }
            None => buf,
        };
        let n = self.inner.read(buf)?;
        self.served.fetch_add(n as u64, Ordering::SeqCst);
        Ok(n)
    }
}

impl Drop for Probe {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

pub fn read_all(reader: &mut impl Read) -> Vec<u8> {
    let mut out = Vec::new();
    reader.read_to_end(&mut out).unwrap();
    out
}

/// Poll `condition` until it holds or `secs` pass.
pub fn wait_for(secs: u64, what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(secs);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Backdate the access marker of `entry` to `age` before now.
pub fn set_last_access(cache: &FileCache, entry: &Path, age: Duration) {
    let marker = cache.layout().marker_path(entry);
    let file = std::fs::OpenOptions::new().write(true).open(marker).unwrap();
    file.set_modified(SystemTime::now() - age).unwrap();
}
