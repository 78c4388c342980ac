//! On-disk layout of a cache root.
//!
//! ```text
//! <root>/<entry>                                  entries of known size
//! <root>/boundless/<entry>                        entries of unknown size
//! <dir>/wlock/<entry>.wlock                       single writer
//! <dir>/rlock/<entry><token>.rlock                one per reader
//! <dir>/dlock/<entry>.remove                      single deleter
//! <root>/lastModified/<entry>.modified            LRU clock
//! <root>/lastModified/boundless/<entry>.modified  LRU clock, boundless
//! ```
//!
//! `<dir>` is the directory holding the entry, so boundless entries keep their
//! lock files under `<root>/boundless/`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::key::CacheKey;

pub const BOUNDLESS_DIR: &str = "boundless";
pub const MARKER_DIR: &str = "lastModified";
pub const WRITE_LOCK_DIR: &str = "wlock";
pub const READ_LOCK_DIR: &str = "rlock";
pub const DELETE_LOCK_DIR: &str = "dlock";

const WRITE_LOCK_EXT: &str = ".wlock";
const READ_LOCK_EXT: &str = ".rlock";
const DELETE_LOCK_EXT: &str = ".remove";
const MARKER_EXT: &str = ".modified";

/// Paths of everything belonging to one cache root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: diskcache_watch::normalize(&root.into()),
        }
    }

    /// Create the fixed directory skeleton.
    pub fn create_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(self.boundless_dir())?;
        fs::create_dir_all(self.marker_dir())?;
        fs::create_dir_all(self.marker_dir().join(BOUNDLESS_DIR))?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn boundless_dir(&self) -> PathBuf {
        self.root.join(BOUNDLESS_DIR)
    }

    pub fn marker_dir(&self) -> PathBuf {
        self.root.join(MARKER_DIR)
    }

    /// Where the payload for `key` lives.
    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        if key.is_boundless() {
            self.boundless_dir().join(key.file_name())
        } else {
            self.root.join(key.file_name())
        }
    }

    /// Whether `entry` sits in the boundless subtree.
    pub fn is_boundless_entry(&self, entry: &Path) -> bool {
        entry.parent() == Some(self.boundless_dir().as_path())
    }

    /// The access marker whose mtime is the LRU clock for `entry`.
    pub fn marker_path(&self, entry: &Path) -> PathBuf {
        let name = format!("{}{}", entry_name(entry), MARKER_EXT);
        if self.is_boundless_entry(entry) {
            self.marker_dir().join(BOUNDLESS_DIR).join(name)
        } else {
            self.marker_dir().join(name)
        }
    }

    /// The entry an access marker belongs to, if `marker` is one.
    pub fn entry_for_marker(&self, marker: &Path) -> Option<PathBuf> {
        let name = marker.file_name()?.to_str()?.strip_suffix(MARKER_EXT)?;
        let parent = marker.parent()?;
        if parent == self.marker_dir().join(BOUNDLESS_DIR) {
            Some(self.boundless_dir().join(name))
        } else if parent == self.marker_dir() {
            Some(self.root.join(name))
        } else {
            None
        }
    }
}

fn entry_name(entry: &Path) -> String {
    entry
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn sibling(entry: &Path, dir: &str, file_name: String) -> PathBuf {
    match entry.parent() {
        Some(parent) => parent.join(dir).join(file_name),
        None => PathBuf::from(dir).join(file_name),
    }
}

pub fn write_lock_path(entry: &Path) -> PathBuf {
    sibling(entry, WRITE_LOCK_DIR, format!("{}{}", entry_name(entry), WRITE_LOCK_EXT))
}

pub fn delete_lock_path(entry: &Path) -> PathBuf {
    sibling(entry, DELETE_LOCK_DIR, format!("{}{}", entry_name(entry), DELETE_LOCK_EXT))
}

/// Read lock of one reader, identified by a fixed-length `token`.
pub fn read_lock_path(entry: &Path, token: &str) -> PathBuf {
    sibling(
        entry,
        READ_LOCK_DIR,
        format!("{}{}{}", entry_name(entry), token, READ_LOCK_EXT),
    )
}

/// Directory holding the read locks of `entry` and its siblings.
pub fn read_lock_dir(entry: &Path) -> PathBuf {
    sibling(entry, READ_LOCK_DIR, String::new())
}

/// Whether `lock_name` is a read lock of `entry` with a token of `token_len` chars.
pub fn is_read_lock_of(entry: &Path, lock_name: &str, token_len: usize) -> bool {
    let name = entry_name(entry);
    lock_name.len() == name.len() + token_len + READ_LOCK_EXT.len()
        && lock_name.starts_with(&name)
        && lock_name.ends_with(READ_LOCK_EXT)
}
