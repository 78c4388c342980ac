//! Cross-process coordination of cache entries
//!
//! Every entry has three kinds of advisory lock, each a file next to it:
//! - one write lock, held while the entry is being filled
//! - any number of read locks, one per open reader
//! - one delete lock, held while the entry is being evicted
//!
//! Readers and deleters exclude each other by checking the other side's locks
//! before and after taking their own. Every successful read or write bumps
//! the entry's access marker, which is the clock eviction runs on.

mod file;

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use thiserror::Error;
use tracing::{debug, trace};

use crate::layout::{self, CacheLayout};

pub use file::{check_lock, check_locks_in, FileLock};

/// Lock result type
pub type LockResult<T> = Result<T, LockError>;

/// Errors from lock operations
#[derive(Debug, Error)]
pub enum LockError {
    /// Someone else holds the lock.
    #[error("lock busy: {0}")]
    Busy(PathBuf),

    #[error("lock I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Length of a read-lock token: 22 chars of process id plus 16 hex digits.
pub const TOKEN_LEN: usize = 38;

/// Source of read-lock tokens unique across processes and readers.
#[derive(Debug)]
pub struct ReadLockTokens {
    process_uid: String,
    seq: AtomicU64,
}

impl ReadLockTokens {
    pub fn new() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self {
            process_uid: URL_SAFE_NO_PAD.encode(bytes),
            seq: AtomicU64::new(0),
        }
    }

    /// Identifier of this process in lock file names.
    pub fn process_uid(&self) -> &str {
        &self.process_uid
    }

    pub fn next_token(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{}{:016x}", self.process_uid, seq)
    }
}

impl Default for ReadLockTokens {
    fn default() -> Self {
        Self::new()
    }
}

/// Implements the read, write and delete protocols for one cache root.
#[derive(Debug, Clone)]
pub struct LockCoordinator {
    layout: CacheLayout,
    tokens: Arc<ReadLockTokens>,
}

impl LockCoordinator {
    pub fn new(layout: CacheLayout, tokens: Arc<ReadLockTokens>) -> Self {
        Self { layout, tokens }
    }

    /// Take the single write lock of `entry` and mark it accessed.
    pub fn acquire_write(&self, entry: &Path) -> LockResult<FileLock> {
        let lock = FileLock::try_acquire(&layout::write_lock_path(entry))?;
        self.touch_marker(entry);
        Ok(lock)
    }

    /// Take a read lock on an existing `entry` and mark it accessed.
    ///
    /// Refused while a delete is in progress.
    pub fn acquire_read(&self, entry: &Path) -> LockResult<FileLock> {
        let delete_lock = layout::delete_lock_path(entry);
        if check_lock(&delete_lock) {
            return Err(LockError::Busy(delete_lock));
        }
        if !entry.exists() {
            return Err(LockError::Io {
                path: entry.to_path_buf(),
                source: io::Error::new(io::ErrorKind::NotFound, "cache entry missing"),
            });
        }

        let token = self.tokens.next_token();
        let lock = FileLock::try_acquire(&layout::read_lock_path(entry, &token))?;

        // A deleter may have slipped in between the first check and our lock.
        if check_lock(&delete_lock) {
            lock.release();
            return Err(LockError::Busy(delete_lock));
        }
        // Or come and gone.
        if !entry.exists() {
            lock.release();
            return Err(LockError::Io {
                path: entry.to_path_buf(),
                source: io::Error::new(io::ErrorKind::NotFound, "cache entry deleted"),
            });
        }

        self.touch_marker(entry);
        Ok(lock)
    }

    /// Delete `entry` unless it is being written or read.
    ///
    /// Removes the payload, leftover read locks and the access marker.
    /// Returns whether this call removed the entry.
    pub fn try_delete(&self, entry: &Path) -> bool {
        if self.is_write_locked(entry) || self.has_active_readers(entry) {
            return false;
        }

        let delete_lock = match FileLock::try_acquire(&layout::delete_lock_path(entry)) {
            Ok(lock) => lock,
            Err(e) => {
                trace!(entry = %entry.display(), error = %e, "delete lock unavailable");
                return false;
            }
        };

        // Readers check the delete lock only after creating their own lock.
        if self.is_write_locked(entry) || self.has_active_readers(entry) {
            delete_lock.release();
            return false;
        }

        let removed = remove_if_exists(entry);
        self.sweep_read_locks(entry);
        remove_if_exists(&self.layout.marker_path(entry));
        delete_lock.release();

        if removed {
            debug!(entry = %entry.display(), "cache entry deleted");
        }
        removed
    }

    /// Whether a live writer holds `entry`.
    pub fn is_write_locked(&self, entry: &Path) -> bool {
        check_lock(&layout::write_lock_path(entry))
    }

    /// Whether a live reader holds `entry`, from any process.
    pub fn has_active_readers(&self, entry: &Path) -> bool {
        check_locks_in(&layout::read_lock_dir(entry), |name| {
            layout::is_read_lock_of(entry, name, TOKEN_LEN)
        })
    }

    /// Set the access marker of `entry` to now, creating it if missing.
    pub fn touch_marker(&self, entry: &Path) {
        let marker = self.layout.marker_path(entry);
        let result = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&marker)
            .and_then(|file| file.set_modified(SystemTime::now()));
        if let Err(e) = result {
            debug!(marker = %marker.display(), error = %e, "could not update access marker");
        }
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    fn sweep_read_locks(&self, entry: &Path) {
        let Ok(entries) = std::fs::read_dir(layout::read_lock_dir(entry)) else {
            return;
        };
        for lock in entries.flatten() {
            let name = lock.file_name();
            if name
                .to_str()
                .is_some_and(|n| layout::is_read_lock_of(entry, n, TOKEN_LEN))
            {
                remove_if_exists(&lock.path());
            }
        }
    }
}

/// Returns whether `path` was unlinked by this call.
fn remove_if_exists(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(e) => {
            if e.kind() != io::ErrorKind::NotFound {
                debug!(path = %path.display(), error = %e, "could not remove file");
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    use crate::key::CacheKey;

    fn setup() -> (TempDir, LockCoordinator, PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let layout = CacheLayout::new(temp_dir.path());
        layout.create_dirs().unwrap();
        let entry = layout.entry_path(&CacheKey::new("entry", 4, 1));
        fs::write(&entry, b"data").unwrap();
        let coordinator = LockCoordinator::new(layout, Arc::new(ReadLockTokens::new()));
        (temp_dir, coordinator, entry)
    }

    #[test]
    fn test_tokens_have_fixed_length_and_are_unique() {
        let tokens = ReadLockTokens::new();
        let a = tokens.next_token();
        let b = tokens.next_token();
        assert_eq!(a.len(), TOKEN_LEN);
        assert_eq!(b.len(), TOKEN_LEN);
        assert_ne!(a, b);
        assert_ne!(tokens.process_uid(), ReadLockTokens::new().process_uid());
    }

    #[test]
    fn test_write_lock_touches_marker() {
        let (_temp_dir, coordinator, entry) = setup();
        let marker = coordinator.layout().marker_path(&entry);
        assert!(!marker.exists());

        let lock = coordinator.acquire_write(&entry).unwrap();
        assert!(marker.exists());
        assert!(coordinator.is_write_locked(&entry));
        drop(lock);
        assert!(!coordinator.is_write_locked(&entry));
    }

    #[test]
    fn test_readers_are_independent() {
        let (_temp_dir, coordinator, entry) = setup();
        let first = coordinator.acquire_read(&entry).unwrap();
        let second = coordinator.acquire_read(&entry).unwrap();
        assert_ne!(first.path(), second.path());
        assert!(coordinator.has_active_readers(&entry));

        drop(first);
        assert!(coordinator.has_active_readers(&entry));
        drop(second);
        assert!(!coordinator.has_active_readers(&entry));
    }

    #[test]
    fn test_read_lock_requires_existing_entry() {
        let (_temp_dir, coordinator, entry) = setup();
        fs::remove_file(&entry).unwrap();
        assert!(matches!(
            coordinator.acquire_read(&entry),
            Err(LockError::Io { .. })
        ));
    }

    #[test]
    #[cfg(unix)]
    fn test_read_refused_during_delete() {
        let (_temp_dir, coordinator, entry) = setup();
        let _deleting = FileLock::try_acquire(&layout::delete_lock_path(&entry)).unwrap();
        assert!(matches!(
            coordinator.acquire_read(&entry),
            Err(LockError::Busy(_))
        ));
    }

    #[test]
    fn test_delete_refused_while_read() {
        let (_temp_dir, coordinator, entry) = setup();
        let reader = coordinator.acquire_read(&entry).unwrap();

        assert!(!coordinator.try_delete(&entry));
        assert!(entry.exists());

        drop(reader);
        assert!(coordinator.try_delete(&entry));
        assert!(!entry.exists());
        assert!(!coordinator.layout().marker_path(&entry).exists());
    }

    #[test]
    fn test_delete_of_missing_entry_reports_nothing_removed() {
        let (_temp_dir, coordinator, entry) = setup();
        fs::remove_file(&entry).unwrap();
        assert!(!coordinator.try_delete(&entry));

        let never = coordinator.layout().entry_path(&CacheKey::new("never-cached", 10, 1));
        assert!(!coordinator.try_delete(&never));
        assert!(!layout::delete_lock_path(&never).exists());
    }

    #[test]
    fn test_delete_refused_while_written() {
        let (_temp_dir, coordinator, entry) = setup();
        let _writer = coordinator.acquire_write(&entry).unwrap();
        assert!(!coordinator.try_delete(&entry));
        assert!(entry.exists());
    }

    #[test]
    fn test_delete_ignores_readers_of_other_entries() {
        let (_temp_dir, coordinator, entry) = setup();
        let layout = coordinator.layout().clone();
        let longer = layout.entry_path(&CacheKey::new("entry-with-suffix", 4, 1));
        fs::write(&longer, b"data").unwrap();
        let _reader = coordinator.acquire_read(&longer).unwrap();

        assert!(coordinator.try_delete(&entry));
        assert!(longer.exists());
    }

    #[test]
    #[cfg(unix)]
    fn test_orphaned_read_lock_does_not_block_delete() {
        let (_temp_dir, coordinator, entry) = setup();
        let token = ReadLockTokens::new().next_token();
        let orphan = layout::read_lock_path(&entry, &token);
        fs::create_dir_all(orphan.parent().unwrap()).unwrap();
        fs::write(&orphan, b"").unwrap();

        assert!(coordinator.try_delete(&entry));
        assert!(!orphan.exists());
    }
}
