//! Mirror state and the background notification loop.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::backend::{FsEvent, WatchBackend};
use crate::scan::{normalize, walker};
use crate::WatchError;

/// What a mirror tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MirrorMode {
    /// The set of regular files.
    Content,
    /// Regular files with their sizes, plus a running total.
    Size,
}

/// A point-in-time copy of a mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Snapshot {
    Content(HashSet<PathBuf>),
    Size {
        files: HashMap<PathBuf, u64>,
        total: u64,
    },
}

impl Snapshot {
    /// Paths of all mirrored files.
    pub fn paths(&self) -> Vec<PathBuf> {
        match self {
            Snapshot::Content(set) => set.iter().cloned().collect(),
            Snapshot::Size { files, .. } => files.keys().cloned().collect(),
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        let path = normalize(path);
        match self {
            Snapshot::Content(set) => set.contains(&path),
            Snapshot::Size { files, .. } => files.contains_key(&path),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Snapshot::Content(set) => set.len(),
            Snapshot::Size { files, .. } => files.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total size in bytes; `None` for content mirrors.
    pub fn total_size(&self) -> Option<u64> {
        match self {
            Snapshot::Content(_) => None,
            Snapshot::Size { total, .. } => Some(*total),
        }
    }
}

#[derive(Default)]
struct MirrorState {
    /// Content mirrors record 0 for every file.
    files: HashMap<PathBuf, u64>,
    total: u64,
}

impl MirrorState {
    fn record(&mut self, path: PathBuf, size: u64) {
        let old = self.files.insert(path, size).unwrap_or(0);
        self.total = self.total - old + size;
    }

    fn forget(&mut self, path: &Path) {
        if let Some(old) = self.files.remove(path) {
            self.total -= old;
        }
    }

    /// Forget `path` and everything below it.
    fn forget_tree(&mut self, path: &Path) {
        let mut removed = 0;
        self.files.retain(|p, size| {
            if p.starts_with(path) {
                removed += *size;
                false
            } else {
                true
            }
        });
        self.total -= removed;
    }
}

struct DrainState {
    /// Events the loop has finished applying.
    applied: u64,
    /// The loop has not exited.
    running: bool,
}

pub(crate) struct MirrorCore {
    root: PathBuf,
    recursive: bool,
    mode: MirrorMode,
    poll_interval: Duration,
    rescan_on_worker: bool,
    backend: Arc<dyn WatchBackend>,
    state: Mutex<MirrorState>,
    drain: Mutex<DrainState>,
    drained: Condvar,
    stopping: AtomicBool,
}

impl MirrorCore {
    pub(crate) fn new(
        root: PathBuf,
        recursive: bool,
        mode: MirrorMode,
        poll_interval: Duration,
        rescan_on_worker: bool,
        backend: Arc<dyn WatchBackend>,
    ) -> Self {
        Self {
            root,
            recursive,
            mode,
            poll_interval,
            rescan_on_worker,
            backend,
            state: Mutex::new(MirrorState::default()),
            drain: Mutex::new(DrainState {
                applied: 0,
                running: true,
            }),
            drained: Condvar::new(),
            stopping: AtomicBool::new(false),
        }
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn recursive(&self) -> bool {
        self.recursive
    }

    pub(crate) fn mode(&self) -> MirrorMode {
        self.mode
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        let state = self.state.lock();
        match self.mode {
            MirrorMode::Content => Snapshot::Content(state.files.keys().cloned().collect()),
            MirrorMode::Size => Snapshot::Size {
                files: state.files.clone(),
                total: state.total,
            },
        }
    }

    pub(crate) fn total_size(&self) -> u64 {
        self.state.lock().total
    }

    /// Block until the loop has applied every notification queued so far.
    ///
    /// Subdirectory scans handed to worker threads are not covered.
    pub(crate) fn wait_drained(&self) {
        let target = self.backend.queued_total();
        let mut drain = self.drain.lock();
        while drain.running && drain.applied < target {
            self.drained.wait(&mut drain);
        }
    }

    fn record(&self, path: &Path, size: u64) {
        let size = match self.mode {
            MirrorMode::Content => 0,
            MirrorMode::Size => size,
        };
        self.state.lock().record(normalize(path), size);
    }

    fn forget(&self, path: &Path) {
        let path = normalize(path);
        let mut state = self.state.lock();
        if self.recursive {
            state.forget_tree(&path);
        } else {
            state.forget(&path);
        }
    }

    /// Walk `dir`, registering directories and replacing every mirrored entry
    /// below it with what is actually on disk.
    pub(crate) fn rescan(&self, dir: &Path) {
        let dir = normalize(dir);
        let mut found: HashMap<PathBuf, u64> = HashMap::new();

        for entry in walker(&dir, self.recursive) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) if e.depth() == 0 => {
                    warn!(dir = %dir.display(), error = %e, "I/O error while scanning");
                    return;
                }
                Err(_) => continue,
            };

            let file_type = entry.file_type();
            if file_type.is_dir() {
                if entry.depth() == 0 || self.recursive {
                    if let Err(e) = self.backend.register_directory(entry.path()) {
                        warn!(dir = %entry.path().display(), error = %e, "cannot watch directory");
                    }
                }
            } else if file_type.is_file() {
                let size = match self.mode {
                    MirrorMode::Content => 0,
                    MirrorMode::Size => match entry.metadata() {
                        Ok(meta) => meta.len(),
                        Err(_) => continue,
                    },
                };
                found.insert(normalize(entry.path()), size);
            }
        }

        let mut state = self.state.lock();
        let stale: Vec<PathBuf> = state
            .files
            .keys()
            .filter(|p| p.starts_with(&dir) && !found.contains_key(*p))
            .cloned()
            .collect();
        for path in stale {
            state.forget(&path);
        }
        for (path, size) in found {
            state.record(path, size);
        }
    }

    fn apply(self: &Arc<Self>, event: FsEvent) {
        match event {
            FsEvent::Created(path) => match fs::symlink_metadata(&path) {
                Ok(meta) if meta.is_dir() => {
                    if self.recursive {
                        self.rescan_subdirectory(path);
                    }
                }
                Ok(meta) if meta.is_file() => self.record(&path, meta.len()),
                Ok(_) => {}
                Err(_) => self.forget(&path),
            },
            FsEvent::Removed(path) => self.forget(&path),
            FsEvent::Modified(path) => {
                if self.mode == MirrorMode::Size {
                    match fs::symlink_metadata(&path) {
                        Ok(meta) if meta.is_file() => self.record(&path, meta.len()),
                        Ok(_) => {}
                        Err(_) => self.forget(&path),
                    }
                }
            }
            FsEvent::Overflow(path) => {
                let dir = match path {
                    Some(p) if p.starts_with(&self.root) && p.is_dir() => p,
                    _ => self.root.clone(),
                };
                debug!(dir = %dir.display(), "notification overflow, rescanning");
                self.rescan(&dir);
            }
        }
    }

    fn rescan_subdirectory(self: &Arc<Self>, dir: PathBuf) {
        if !self.rescan_on_worker {
            self.rescan(&dir);
            return;
        }

        let core = Arc::clone(self);
        let target = dir.clone();
        let spawned = std::thread::Builder::new()
            .name("diskcache-rescan".to_string())
            .spawn(move || core.rescan(&target));
        if let Err(e) = spawned {
            warn!(error = %e, "cannot spawn rescan worker, scanning inline");
            self.rescan(&dir);
        }
    }

    /// Background loop. Signals `ready` once running, then applies
    /// notifications until the backend closes or the mirror is stopped.
    pub(crate) fn run(self: Arc<Self>, ready: SyncSender<()>) {
        let _ = ready.send(());
        drop(ready);

        while !self.stopping.load(Ordering::Acquire) {
            let events = match self.backend.poll_events(self.poll_interval) {
                Ok(events) => events,
                Err(WatchError::Closed) => break,
                Err(e) => {
                    warn!(root = %self.root.display(), error = %e, "watch poll failed");
                    continue;
                }
            };
            if events.is_empty() {
                continue;
            }

            let count = events.len() as u64;
            for event in events {
                self.apply(event);
            }

            let mut drain = self.drain.lock();
            drain.applied += count;
            self.drained.notify_all();
        }

        let mut drain = self.drain.lock();
        drain.running = false;
        self.drained.notify_all();
    }

    pub(crate) fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.backend.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_running_total() {
        let mut state = MirrorState::default();
        state.record(PathBuf::from("/r/a"), 10);
        state.record(PathBuf::from("/r/b"), 5);
        state.record(PathBuf::from("/r/a"), 4);
        assert_eq!(state.total, 9);

        state.forget(Path::new("/r/b"));
        assert_eq!(state.total, 4);

        state.forget(Path::new("/r/missing"));
        assert_eq!(state.total, 4);
    }

    #[test]
    fn test_state_forget_tree() {
        let mut state = MirrorState::default();
        state.record(PathBuf::from("/r/sub/a"), 3);
        state.record(PathBuf::from("/r/sub/deeper/b"), 4);
        state.record(PathBuf::from("/r/subway"), 5);

        state.forget_tree(Path::new("/r/sub"));
        assert_eq!(state.files.len(), 1);
        assert!(state.files.contains_key(Path::new("/r/subway")));
        assert_eq!(state.total, 5);
    }

    #[test]
    fn test_snapshot_accessors() {
        let mut files = HashMap::new();
        files.insert(PathBuf::from("/r/a"), 7);
        let snapshot = Snapshot::Size { files, total: 7 };
        assert_eq!(snapshot.total_size(), Some(7));
        assert!(snapshot.contains(Path::new("/r/./a")));
        assert_eq!(snapshot.len(), 1);

        let content = Snapshot::Content(HashSet::new());
        assert!(content.is_empty());
        assert_eq!(content.total_size(), None);
    }
}
