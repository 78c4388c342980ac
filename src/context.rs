//! Process-wide state shared by caches.

use std::sync::Arc;

use diskcache_watch::{MirrorOptions, WatchRegistry};
use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use crate::config::CacheConfig;
use crate::loader::LoaderRegistry;
use crate::lock::ReadLockTokens;

/// Registries and identity of one process.
///
/// Create one per process and share it by `Arc` between [`crate::FileCache`]
/// instances. Caches built on separate contexts behave like separate
/// processes against the same directory.
#[derive(Debug)]
pub struct CacheContext {
    loaders: Arc<LoaderRegistry>,
    watches: Arc<WatchRegistry>,
    tokens: Arc<ReadLockTokens>,
    decisions: Mutex<()>,
}

impl CacheContext {
    /// Context tuned from `config`, watching with the OS backend.
    pub fn new(config: &CacheConfig) -> Arc<Self> {
        let watches = WatchRegistry::new(MirrorOptions {
            poll_interval: config.poll_interval(),
            rescan_on_worker: config.rescan_on_worker,
        });
        Self::with_watch_registry(config, watches)
    }

    /// Context using a given watch registry.
    pub fn with_watch_registry(config: &CacheConfig, watches: Arc<WatchRegistry>) -> Arc<Self> {
        let tokens = Arc::new(ReadLockTokens::new());
        debug!(process = tokens.process_uid(), "cache context created");
        Arc::new(Self {
            loaders: LoaderRegistry::new(config.lookback_capacity),
            watches,
            tokens,
            decisions: Mutex::new(()),
        })
    }

    /// Serializes cache decisions within the process, so that two requests
    /// for the same entry never both start a loader.
    pub(crate) fn decision_lock(&self) -> MutexGuard<'_, ()> {
        self.decisions.lock()
    }

    pub fn loaders(&self) -> &Arc<LoaderRegistry> {
        &self.loaders
    }

    pub fn watches(&self) -> &Arc<WatchRegistry> {
        &self.watches
    }

    pub fn tokens(&self) -> &Arc<ReadLockTokens> {
        &self.tokens
    }

    /// Stop every directory mirror and close every loader.
    pub fn shutdown(&self) {
        self.watches.shutdown();
        self.loaders.shutdown();
        debug!(process = self.tokens.process_uid(), "cache context shut down");
    }
}
