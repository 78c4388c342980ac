//! Directory mirrors for the disk cache
//!
//! A [`DirectoryMirror`] keeps an in-memory view of a directory tree current
//! without full rescans:
//! - an initial synchronous scan establishes the baseline
//! - a background thread applies filesystem change notifications
//! - overflow notifications force a rescan of the affected subtree
//!
//! The view is eventually consistent. [`DirectoryMirror::barriered_snapshot`]
//! waits until the background thread has drained every queued notification
//! before reading, which is a fence and not a transactional snapshot.
//!
//! ## Sharing
//!
//! Mirrors are owned by a [`WatchRegistry`]. Requests for the same
//! (directory, recursive, mode) identity share one underlying watch; each
//! handle holds one reference and the last release tears the watch down.
//!
//! ## Backends
//!
//! Platform notification facilities sit behind the [`WatchBackend`] trait.
//! [`NotifyBackend`] uses the OS-native facility through `notify`.

mod backend;
mod mirror;
mod registry;
mod scan;

use std::io;

use thiserror::Error;

pub use backend::{EventQueue, FsEvent, NotifyBackend, WatchBackend};
pub use mirror::{MirrorMode, Snapshot};
pub use registry::{BackendFactory, DirectoryMirror, MirrorOptions, WatchRegistry};
pub use scan::{directory_content, directory_content_last_access, directory_size, normalize};

/// Watch result type
pub type WatchResult<T> = Result<T, WatchError>;

/// Errors from directory watching
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("watch backend error: {0}")]
    Backend(String),

    #[error("watch backend closed")]
    Closed,
}

impl From<notify::Error> for WatchError {
    fn from(err: notify::Error) -> Self {
        let message = err.to_string();
        match err.kind {
            notify::ErrorKind::Io(e) => WatchError::Io(e),
            _ => WatchError::Backend(message),
        }
    }
}

impl From<walkdir::Error> for WatchError {
    fn from(err: walkdir::Error) -> Self {
        WatchError::Io(err.into())
    }
}
