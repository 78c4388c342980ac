//! The cache front door
//!
//! [`FileCache::get_cached_stream`] decides, per request, how to serve it:
//! 1. attach to a loader already fetching the entry in this process
//! 2. read a complete cache file
//! 3. resume an incomplete file left by an earlier fetch
//! 4. read a file another writer is filling, falling back to the upstream
//! 5. reserve space and start a fresh fetch
//! 6. hand the caller's upstream back uncached
//!
//! Caching is best effort: internal failures only move a request further
//! down that list, they never reach the caller.

mod space;

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use diskcache_watch::{DirectoryMirror, MirrorMode};
use tracing::{debug, info, warn};

use crate::cacheable::Cacheable;
use crate::config::CacheConfig;
use crate::context::CacheContext;
use crate::error::CacheResult;
use crate::key::{CacheKey, UNKNOWN};
use crate::layout::CacheLayout;
use crate::loader::Upstream;
use crate::lock::{FileLock, LockCoordinator};
use crate::stream::{ByteSource, CachedReader, CachedStream, FileReader, HybridReader, LockedSource, StreamKind};

/// What [`FileCache::entries`] reports for one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub key: CacheKey,
    pub path: PathBuf,
    /// Bytes on disk
    pub len: u64,
    pub complete: bool,
    /// Time of the last read or write access, if recorded
    pub last_access: Option<SystemTime>,
}

/// A size-bounded disk cache shared between threads and processes.
pub struct FileCache {
    config: CacheConfig,
    layout: CacheLayout,
    context: Arc<CacheContext>,
    locks: LockCoordinator,
    mirror: DirectoryMirror,
    owns_context: bool,
}

impl FileCache {
    /// Open the cache described by `config` with a context of its own.
    pub fn open(config: CacheConfig) -> CacheResult<Self> {
        let context = CacheContext::new(&config);
        let mut cache = Self::with_context(config, context)?;
        cache.owns_context = true;
        Ok(cache)
    }

    /// Open the cache described by `config` on a shared context.
    pub fn with_context(config: CacheConfig, context: Arc<CacheContext>) -> CacheResult<Self> {
        config.validate()?;
        let layout = CacheLayout::new(&config.cache_root);
        layout.create_dirs()?;

        let mirror = context
            .watches()
            .acquire(layout.root(), false, MirrorMode::Content)?;
        let locks = LockCoordinator::new(layout.clone(), Arc::clone(context.tokens()));
        info!(root = %layout.root().display(), limit = config.size_limit, "cache opened");

        Ok(Self {
            config,
            layout,
            context,
            locks,
            mirror,
            owns_context: false,
        })
    }

    /// Get a stream for the entry (id, size, last_modified).
    ///
    /// Without an upstream only a complete cached entry is served; with size
    /// and last_modified both [`UNKNOWN`] that is the newest cached version
    /// of `id`. Returns `None` if there is nothing to serve.
    ///
    /// With an upstream a stream is always returned, in the worst case the
    /// upstream itself.
    pub fn get_cached_stream(
        &self,
        id: impl AsRef<[u8]>,
        upstream: Option<Upstream>,
        size: i64,
        last_modified: i64,
    ) -> Option<CachedStream> {
        let size = normalize_size(size);
        let _decision = self.context.decision_lock();
        match upstream {
            None => self.lookup(id.as_ref(), size, last_modified),
            Some(upstream) => {
                let key = CacheKey::new(id, size, last_modified);
                Some(self.fetch(&key, upstream))
            }
        }
    }

    /// Like [`FileCache::get_cached_stream`], as a skippable byte source.
    pub fn get_cached_byte_channel(
        &self,
        id: impl AsRef<[u8]>,
        upstream: Option<Upstream>,
        size: i64,
        last_modified: i64,
    ) -> Option<Box<dyn ByteSource>> {
        self.get_cached_stream(id, upstream, size, last_modified)
            .map(|stream| Box::new(stream) as Box<dyn ByteSource>)
    }

    /// Serve `resource` from the cache, requesting its content only on a miss.
    pub fn get_cacheable(&self, resource: &dyn Cacheable) -> std::io::Result<CachedStream> {
        let id = resource.unique_id();
        let (size, last_modified) = (resource.size(), resource.last_modified());
        if let Some(hit) = self.get_cached_stream(&id, None, size, last_modified) {
            return Ok(hit);
        }

        let upstream = resource.request_content()?;
        let size = normalize_size(size);
        let key = CacheKey::new(&id, size, last_modified);
        let _decision = self.context.decision_lock();
        Ok(self.fetch(&key, upstream))
    }

    fn lookup(&self, id: &[u8], size: i64, last_modified: i64) -> Option<CachedStream> {
        let latest = size == UNKNOWN && last_modified == UNKNOWN;
        let entry = if latest {
            self.latest_version(id)?
        } else {
            self.layout.entry_path(&CacheKey::new(id, size, last_modified))
        };

        if !entry.is_file() || !self.is_file_complete(&entry) {
            return None;
        }
        let file = File::open(&entry).ok()?;
        let lock = match self.locks.acquire_read(&entry) {
            Ok(lock) => lock,
            Err(e) => {
                debug!(entry = %entry.display(), error = %e, "no read lock, not serving");
                return None;
            }
        };

        if latest {
            warn!(id = %String::from_utf8_lossy(id), "serving latest cached version without upstream");
        } else {
            info!(id = %String::from_utf8_lossy(id), "read from cache");
        }
        Some(CachedStream::new(FileReader::new(file), StreamKind::File).with_lock(lock))
    }

    /// Newest entry of `id` by last_modified, else its boundless entry.
    fn latest_version(&self, id: &[u8]) -> Option<PathBuf> {
        let boundless = diskcache_watch::directory_content(&self.layout.boundless_dir(), false);
        let best = self
            .mirror
            .barriered_snapshot()
            .paths()
            .into_iter()
            .chain(boundless)
            .filter_map(|path| CacheKey::from_path(&path).ok().map(|key| (key, path)))
            .filter(|(key, path)| key.id() == id && path.is_file())
            .max_by_key(|(key, _)| key.last_modified())
            .map(|(_, path)| path);

        let entry = best.unwrap_or_else(|| self.layout.entry_path(&CacheKey::new(id, UNKNOWN, UNKNOWN)));
        entry.exists().then_some(entry)
    }

    fn fetch(&self, key: &CacheKey, upstream: Upstream) -> CachedStream {
        let entry = self.layout.entry_path(key);

        let upstream = if entry.exists() {
            match self.serve_existing(key, &entry, upstream) {
                Ok(stream) => return stream,
                Err(upstream) => upstream,
            }
        } else {
            upstream
        };

        match self.reserve_space(key, &entry) {
            Ok(()) => match self.start_fetch(key, &entry, upstream) {
                Ok(stream) => return stream,
                Err(upstream) => {
                    info!(key = %key, "no data cached");
                    return CachedStream::passthrough(upstream);
                }
            },
            Err(e) => debug!(key = %key, error = %e, "space reservation failed"),
        }

        info!(key = %key, "no data cached");
        CachedStream::passthrough(upstream)
    }

    /// Steps 1 to 4 for an entry whose file exists.
    fn serve_existing(
        &self,
        key: &CacheKey,
        entry: &Path,
        upstream: Upstream,
    ) -> Result<CachedStream, Upstream> {
        if let Some(handle) = self.context.loaders().attach_existing(entry) {
            drop(upstream);
            info!(key = %key, "read from running cache stream");
            let lock = self.locks.acquire_read(entry).ok();
            return Ok(CachedStream::new(CachedReader::new(handle), StreamKind::Cached).with_optional_lock(lock));
        }

        if self.is_file_complete(entry) {
            if let Ok(file) = File::open(entry) {
                return match self.locks.acquire_read(entry) {
                    Ok(lock) => {
                        drop(upstream);
                        info!(key = %key, "read from cache");
                        Ok(CachedStream::new(FileReader::new(file), StreamKind::File).with_lock(lock))
                    }
                    Err(e) => {
                        debug!(key = %key, error = %e, "no read lock, reading hybrid");
                        Ok(CachedStream::new(HybridReader::new(upstream, file), StreamKind::Hybrid))
                    }
                };
            }
        } else {
            match self.resume(key, entry, upstream) {
                Ok(stream) => return Ok(stream),
                Err(upstream) => return self.serve_hybrid(key, entry, upstream),
            }
        }

        self.serve_hybrid(key, entry, upstream)
    }

    /// Continue filling an incomplete file from where it stopped.
    fn resume(&self, key: &CacheKey, entry: &Path, upstream: Upstream) -> Result<CachedStream, Upstream> {
        let (write_lock, channel) = match self.open_for_writing(entry) {
            Ok(opened) => opened,
            Err(e) => {
                debug!(key = %key, error = %e, "cannot resume cache file");
                return Err(upstream);
            }
        };
        let start = channel.metadata().map(|m| m.len()).unwrap_or(0);

        info!(key = %key, start, "resume data in cache");
        let source: Upstream = Box::new(LockedSource::new(upstream, write_lock));
        let handle = self.context.loaders().attach(entry, source, channel, start, true);
        let lock = self.locks.acquire_read(entry).ok();
        Ok(CachedStream::new(CachedReader::new(handle), StreamKind::Cached).with_optional_lock(lock))
    }

    /// Read what is on disk, then the upstream.
    fn serve_hybrid(&self, key: &CacheKey, entry: &Path, upstream: Upstream) -> Result<CachedStream, Upstream> {
        let file = match File::open(entry) {
            Ok(file) => file,
            Err(_) => return Err(upstream),
        };
        info!(key = %key, "hybrid read from cache");
        let lock = self.locks.acquire_read(entry).ok();
        Ok(CachedStream::new(HybridReader::new(upstream, file), StreamKind::Hybrid).with_optional_lock(lock))
    }

    /// Step 5: fill a freshly reserved file.
    fn start_fetch(&self, key: &CacheKey, entry: &Path, upstream: Upstream) -> Result<CachedStream, Upstream> {
        let (write_lock, channel) = match self.open_for_writing(entry) {
            Ok(opened) => opened,
            Err(e) => {
                debug!(key = %key, error = %e, "cannot write new cache file");
                return Err(upstream);
            }
        };

        info!(key = %key, "create data in cache");
        let source: Upstream = Box::new(LockedSource::new(upstream, write_lock));
        let handle = self.context.loaders().attach(entry, source, channel, 0, false);
        let lock = self.locks.acquire_read(entry).ok();
        Ok(CachedStream::new(CachedReader::new(handle), StreamKind::Cached).with_optional_lock(lock))
    }

    /// Write lock and read-write channel for filling `entry`.
    fn open_for_writing(&self, entry: &Path) -> CacheResult<(FileLock, File)> {
        let lock = self.locks.acquire_write(entry)?;
        let channel = open_channel(entry)?;
        Ok((lock, channel))
    }

    /// No live writer, and the length matches the declared size if known.
    fn is_file_complete(&self, entry: &Path) -> bool {
        if self.locks.is_write_locked(entry) {
            return false;
        }
        match CacheKey::from_path(entry) {
            Ok(key) => match key.known_size() {
                Some(size) => fs::metadata(entry).map(|m| m.len() == size).unwrap_or(false),
                None => true,
            },
            Err(_) => false,
        }
    }

    /// Whether the entry exists and is complete.
    pub fn is_entry_complete(&self, id: impl AsRef<[u8]>, size: i64, last_modified: i64) -> bool {
        let entry = self.layout.entry_path(&CacheKey::new(id, normalize_size(size), last_modified));
        entry.is_file() && self.is_file_complete(&entry)
    }

    /// Run the delete protocol on one entry. Returns whether it is gone.
    pub fn evict(&self, id: impl AsRef<[u8]>, size: i64, last_modified: i64) -> bool {
        let entry = self.layout.entry_path(&CacheKey::new(id, normalize_size(size), last_modified));
        let deleted = self.locks.try_delete(&entry);
        if deleted {
            info!(entry = %entry.display(), "evicted cache entry");
        }
        deleted
    }

    /// Sum of the declared sizes of the entries of known size.
    pub fn current_size(&self) -> u64 {
        self.mirror
            .barriered_snapshot()
            .paths()
            .into_iter()
            .filter(|path| path.is_file())
            .filter_map(|path| match CacheKey::from_path(&path) {
                Ok(key) => key.known_size(),
                Err(e) => {
                    debug!(error = %e, "skipping foreign file");
                    None
                }
            })
            .fold(0u64, u64::saturating_add)
    }

    /// Every entry on disk, of known and unknown size.
    pub fn entries(&self) -> Vec<EntryInfo> {
        let mut paths = self.mirror.barriered_snapshot().paths();
        paths.extend(diskcache_watch::directory_content(&self.layout.boundless_dir(), false));
        paths.sort();

        paths
            .into_iter()
            .filter_map(|path| {
                let key = CacheKey::from_path(&path).ok()?;
                let len = fs::metadata(&path).ok()?.len();
                let last_access = fs::metadata(self.layout.marker_path(&path))
                    .and_then(|m| m.modified())
                    .ok();
                Some(EntryInfo {
                    complete: self.is_file_complete(&path),
                    key,
                    path,
                    len,
                    last_access,
                })
            })
            .collect()
    }

    pub fn size_limit(&self) -> u64 {
        self.config.size_limit
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<CacheContext> {
        &self.context
    }

    /// Release the directory watch, and the context if this cache created it.
    pub fn shutdown(self) {
        let Self {
            mirror,
            context,
            owns_context,
            ..
        } = self;
        mirror.close();
        if owns_context {
            context.shutdown();
        }
    }
}

impl std::fmt::Debug for FileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCache")
            .field("root", &self.layout.root())
            .field("size_limit", &self.config.size_limit)
            .finish()
    }
}

/// Any negative size means the size is not known.
fn normalize_size(size: i64) -> i64 {
    if size < 0 {
        UNKNOWN
    } else {
        size
    }
}

fn open_channel(entry: &Path) -> std::io::Result<File> {
    OpenOptions::new().read(true).write(true).open(entry)
}
