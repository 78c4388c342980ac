//! Reference-counted ownership of directory mirrors.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::backend::{NotifyBackend, WatchBackend};
use crate::mirror::{MirrorCore, MirrorMode, Snapshot};
use crate::scan::normalize;
use crate::{WatchError, WatchResult};

/// Creates a fresh backend for every new mirror.
pub type BackendFactory = Arc<dyn Fn() -> WatchResult<Arc<dyn WatchBackend>> + Send + Sync>;

/// Tuning shared by every mirror of a registry.
#[derive(Debug, Clone)]
pub struct MirrorOptions {
    /// Longest time the background loop blocks waiting for notifications.
    pub poll_interval: Duration,
    /// Scan newly created subdirectories on a worker thread.
    pub rescan_on_worker: bool,
}

impl Default for MirrorOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            rescan_on_worker: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MirrorKey {
    root: PathBuf,
    recursive: bool,
    mode: MirrorMode,
}

struct Registered {
    core: Arc<MirrorCore>,
    refs: usize,
    worker: Option<JoinHandle<()>>,
}

/// Owner of every live mirror in a process.
pub struct WatchRegistry {
    mirrors: Mutex<HashMap<MirrorKey, Registered>>,
    factory: BackendFactory,
    options: MirrorOptions,
}

impl WatchRegistry {
    /// Registry whose mirrors use the OS-native notification backend.
    pub fn new(options: MirrorOptions) -> Arc<Self> {
        let factory: BackendFactory = Arc::new(|| {
            let backend: Arc<dyn WatchBackend> = Arc::new(NotifyBackend::new()?);
            Ok(backend)
        });
        Self::with_backend_factory(options, factory)
    }

    pub fn with_backend_factory(options: MirrorOptions, factory: BackendFactory) -> Arc<Self> {
        Arc::new(Self {
            mirrors: Mutex::new(HashMap::new()),
            factory,
            options,
        })
    }

    /// Get a handle on the mirror of `dir`, creating it if needed.
    ///
    /// A new mirror scans `dir` synchronously and returns only once its
    /// background loop is running.
    pub fn acquire(
        self: &Arc<Self>,
        dir: impl AsRef<Path>,
        recursive: bool,
        mode: MirrorMode,
    ) -> WatchResult<DirectoryMirror> {
        let key = MirrorKey {
            root: normalize(dir.as_ref()),
            recursive,
            mode,
        };

        let mut mirrors = self.mirrors.lock();
        if let Some(registered) = mirrors.get_mut(&key) {
            registered.refs += 1;
            return Ok(self.handle(key, Arc::clone(&registered.core)));
        }

        let backend = (self.factory)()?;
        let core = Arc::new(MirrorCore::new(
            key.root.clone(),
            recursive,
            mode,
            self.options.poll_interval,
            self.options.rescan_on_worker,
            backend,
        ));
        core.rescan(&key.root);

        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let loop_core = Arc::clone(&core);
        let worker = std::thread::Builder::new()
            .name("diskcache-watch".to_string())
            .spawn(move || loop_core.run(ready_tx))?;

        if ready_rx.recv().is_err() {
            core.stop();
            let _ = worker.join();
            return Err(WatchError::Closed);
        }

        debug!(root = %key.root.display(), recursive, ?mode, "directory mirror started");
        mirrors.insert(
            key.clone(),
            Registered {
                core: Arc::clone(&core),
                refs: 1,
                worker: Some(worker),
            },
        );
        Ok(self.handle(key, core))
    }

    fn handle(self: &Arc<Self>, key: MirrorKey, core: Arc<MirrorCore>) -> DirectoryMirror {
        DirectoryMirror {
            core,
            registry: Arc::clone(self),
            key,
            released: false,
        }
    }

    fn retain(&self, key: &MirrorKey) -> bool {
        match self.mirrors.lock().get_mut(key) {
            Some(registered) => {
                registered.refs += 1;
                true
            }
            None => false,
        }
    }

    fn release(&self, key: &MirrorKey) {
        let removed = {
            let mut mirrors = self.mirrors.lock();
            match mirrors.get_mut(key) {
                Some(registered) if registered.refs > 1 => {
                    registered.refs -= 1;
                    None
                }
                Some(_) => mirrors.remove(key),
                None => None,
            }
        };

        if let Some(registered) = removed {
            Self::teardown(registered);
            debug!(root = %key.root.display(), "directory mirror stopped");
        }
    }

    fn teardown(mut registered: Registered) {
        registered.core.stop();
        if let Some(worker) = registered.worker.take() {
            if worker.join().is_err() {
                warn!(root = %registered.core.root().display(), "watch thread panicked");
            }
        }
    }

    /// Number of distinct live mirrors.
    pub fn active_count(&self) -> usize {
        self.mirrors.lock().len()
    }

    /// Number of handles sharing the mirror of `dir`, 0 if none.
    pub fn ref_count(&self, dir: impl AsRef<Path>, recursive: bool, mode: MirrorMode) -> usize {
        let key = MirrorKey {
            root: normalize(dir.as_ref()),
            recursive,
            mode,
        };
        self.mirrors.lock().get(&key).map(|r| r.refs).unwrap_or(0)
    }

    /// Stop every mirror regardless of outstanding handles.
    ///
    /// Handles released afterwards are no-ops; their snapshots stay frozen.
    pub fn shutdown(&self) {
        let drained: Vec<Registered> = self.mirrors.lock().drain().map(|(_, r)| r).collect();
        for registered in drained {
            Self::teardown(registered);
        }
    }
}

impl std::fmt::Debug for WatchRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchRegistry")
            .field("active", &self.active_count())
            .field("options", &self.options)
            .finish()
    }
}

/// One reference to a shared directory mirror.
///
/// Dropping the handle releases the reference; [`DirectoryMirror::close`]
/// does the same explicitly.
pub struct DirectoryMirror {
    core: Arc<MirrorCore>,
    registry: Arc<WatchRegistry>,
    key: MirrorKey,
    released: bool,
}

impl DirectoryMirror {
    pub fn root(&self) -> &Path {
        self.core.root()
    }

    pub fn recursive(&self) -> bool {
        self.core.recursive()
    }

    pub fn mode(&self) -> MirrorMode {
        self.core.mode()
    }

    /// The mirror as it is now; may lag behind the filesystem.
    pub fn snapshot(&self) -> Snapshot {
        self.core.snapshot()
    }

    /// The mirror after every queued notification has been applied.
    pub fn barriered_snapshot(&self) -> Snapshot {
        self.core.wait_drained();
        self.core.snapshot()
    }

    /// Mirrored file paths, without waiting.
    pub fn content(&self) -> Vec<PathBuf> {
        self.snapshot().paths()
    }

    /// Mirrored file paths after draining queued notifications.
    pub fn actual_content(&self) -> Vec<PathBuf> {
        self.barriered_snapshot().paths()
    }

    /// Total tracked bytes, without waiting. Always 0 for content mirrors.
    pub fn size(&self) -> u64 {
        self.core.total_size()
    }

    /// Total tracked bytes after draining queued notifications.
    pub fn actual_size(&self) -> u64 {
        self.core.wait_drained();
        self.core.total_size()
    }

    /// Take another reference on the same mirror.
    pub fn share(&self) -> DirectoryMirror {
        let released = !self.registry.retain(&self.key);
        DirectoryMirror {
            core: Arc::clone(&self.core),
            registry: Arc::clone(&self.registry),
            key: self.key.clone(),
            released,
        }
    }

    /// Release this reference; the last one stops the watch.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.registry.release(&self.key);
        }
    }
}

impl Drop for DirectoryMirror {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for DirectoryMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryMirror")
            .field("root", &self.key.root)
            .field("recursive", &self.key.recursive)
            .field("mode", &self.key.mode)
            .finish()
    }
}
