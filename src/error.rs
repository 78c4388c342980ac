//! Error taxonomy for cache operations.
//!
//! None of these reach callers of the public `get*` API: failures there turn
//! into a fallback stream (see [`crate::FileCache`]).

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::lock::LockError;

/// Cache result type
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors from cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    /// Another holder is active; retry later or give up.
    #[error("lock busy: {0}")]
    LockBusy(PathBuf),

    /// The lock could not even be attempted; treated as busy.
    #[error("lock I/O error on {path}: {source}")]
    LockIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The upstream failed mid-stream. The partial cache file is kept.
    #[error("source I/O error: {0}")]
    SourceIo(#[source] io::Error),

    /// Eviction could not make room or the disk is full.
    #[error("no space for {requested} bytes (limit {limit})")]
    SpaceUnavailable { requested: i64, limit: u64 },

    /// A file name that does not decode to a cache key.
    #[error("corrupt cache key {name:?}: {reason}")]
    CorruptKey { name: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("watch error: {0}")]
    Watch(#[from] diskcache_watch::WatchError),
}

impl From<LockError> for CacheError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Busy(path) => CacheError::LockBusy(path),
            LockError::Io { path, source } => CacheError::LockIo { path, source },
        }
    }
}
