//! Shared stream loaders
//!
//! At most one upstream fetch runs per cache entry in a process. Readers that
//! ask for an entry while its fetch is in flight attach to the same
//! [`SharedLoader`] and read through its write-head, lookback buffer or the
//! cache file, depending on where they are relative to the head.

mod shared;

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::CacheError;

pub use shared::SharedLoader;

/// A byte stream from wherever the cached resource originally comes from.
pub type Upstream = Box<dyn Read + Send>;

struct Registered {
    loader: Arc<SharedLoader>,
    refs: usize,
}

/// Process-wide map of in-flight loaders, keyed by cache file path.
pub struct LoaderRegistry {
    loaders: Mutex<HashMap<PathBuf, Registered>>,
    lookback_capacity: usize,
}

impl LoaderRegistry {
    pub fn new(lookback_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            loaders: Mutex::new(HashMap::new()),
            lookback_capacity,
        })
    }

    /// Attach to the loader for `path`, creating it from `source` and
    /// `channel` if there is none.
    ///
    /// When a loader already exists the given source and channel are closed.
    /// A new loader starts its head at `start`. With `autoload` a background
    /// thread drains the upstream to the end, so the file gets completed even
    /// if every reader goes away early.
    pub fn attach(
        self: &Arc<Self>,
        path: &Path,
        source: Upstream,
        channel: File,
        start: u64,
        autoload: bool,
    ) -> LoaderHandle {
        let mut loaders = self.loaders.lock();
        if let Some(registered) = loaders.get_mut(path) {
            registered.refs += 1;
            debug!(path = %path.display(), refs = registered.refs, "attached to running loader");
            return self.handle(Arc::clone(&registered.loader));
        }

        let loader = Arc::new(SharedLoader::new(
            path,
            source,
            channel,
            start,
            self.lookback_capacity,
        ));
        let refs = if autoload { 2 } else { 1 };
        loaders.insert(
            path.to_path_buf(),
            Registered {
                loader: Arc::clone(&loader),
                refs,
            },
        );
        drop(loaders);
        debug!(path = %path.display(), start, autoload, "loader started");

        if autoload {
            self.spawn_autoload(Arc::clone(&loader));
        }
        self.handle(loader)
    }

    /// Attach to the loader for `path` if one is running.
    pub fn attach_existing(self: &Arc<Self>, path: &Path) -> Option<LoaderHandle> {
        let mut loaders = self.loaders.lock();
        let registered = loaders.get_mut(path)?;
        registered.refs += 1;
        Some(self.handle(Arc::clone(&registered.loader)))
    }

    /// Whether a loader for `path` is running.
    pub fn contains(&self, path: &Path) -> bool {
        self.loaders.lock().contains_key(path)
    }

    /// Number of running loaders.
    pub fn active_count(&self) -> usize {
        self.loaders.lock().len()
    }

    /// Number of handles on the loader for `path`, 0 if none.
    pub fn ref_count(&self, path: &Path) -> usize {
        self.loaders.lock().get(path).map(|r| r.refs).unwrap_or(0)
    }

    /// Close every loader regardless of outstanding handles.
    ///
    /// Handles detached afterwards are no-ops; their reads see a closed loader.
    pub fn shutdown(&self) {
        let drained: Vec<Registered> = self.loaders.lock().drain().map(|(_, r)| r).collect();
        for registered in drained {
            registered.loader.shutdown();
        }
    }

    fn handle(self: &Arc<Self>, loader: Arc<SharedLoader>) -> LoaderHandle {
        LoaderHandle {
            loader,
            registry: Arc::clone(self),
            detached: false,
        }
    }

    fn spawn_autoload(self: &Arc<Self>, loader: Arc<SharedLoader>) {
        let handle = self.handle(loader);
        let path = handle.path().to_path_buf();
        let spawned = std::thread::Builder::new()
            .name("diskcache-autoload".to_string())
            .spawn(move || {
                if let Err(e) = handle.drain().map_err(CacheError::SourceIo) {
                    warn!(path = %handle.path().display(), error = %e, "autoload stopped early");
                }
                handle.detach();
            });
        if let Err(e) = spawned {
            // The closure, and with it the handle, is dropped and detaches.
            warn!(path = %path.display(), error = %e, "could not start autoload thread");
        }
    }

    fn detach(&self, loader: &Arc<SharedLoader>) {
        let path = loader.path();
        {
            let mut loaders = self.loaders.lock();
            match loaders.get_mut(path) {
                Some(registered) if Arc::ptr_eq(&registered.loader, loader) => {
                    registered.refs -= 1;
                    if registered.refs > 0 {
                        return;
                    }
                }
                _ => return,
            }
            loaders.remove(path);
        }

        // Flushing touches the disk; keep it out of the map lock.
        loader.shutdown();
        debug!(path = %path.display(), "loader finished");
    }
}

impl std::fmt::Debug for LoaderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderRegistry")
            .field("active", &self.active_count())
            .field("lookback_capacity", &self.lookback_capacity)
            .finish()
    }
}

/// One reference to a shared loader. Dropping it detaches.
#[derive(Debug)]
pub struct LoaderHandle {
    loader: Arc<SharedLoader>,
    registry: Arc<LoaderRegistry>,
    detached: bool,
}

impl LoaderHandle {
    pub fn path(&self) -> &Path {
        self.loader.path()
    }

    pub fn read_at(&self, pos: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        self.loader.read_at(pos, buf)
    }

    pub fn skip_from(&self, pos: u64, n: u64) -> std::io::Result<u64> {
        self.loader.skip_from(pos, n)
    }

    /// Pull the rest of the upstream into the cache file.
    pub fn drain(&self) -> std::io::Result<u64> {
        self.loader.drain()
    }

    /// Release this reference; the last one closes the loader.
    pub fn detach(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.detached {
            self.detached = true;
            self.registry.detach(&self.loader);
        }
    }
}

impl Drop for LoaderHandle {
    fn drop(&mut self) {
        self.release();
    }
}
