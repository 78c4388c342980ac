//! Advisory lock files.
//!
//! A lock is held as an exclusive `flock` on a file whose existence signals
//! intent. Holders delete the file when they release it. A lock file that
//! exists but whose lock can be taken was left behind by a dead holder and is
//! removed by whoever notices.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use super::{LockError, LockResult};

/// An exclusive lock on one lock file. Released, and the file deleted, on drop.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    file: Option<File>,
}

impl FileLock {
    /// Take the lock at `path` without blocking.
    ///
    /// Creates missing parent directories. Fails with [`LockError::Busy`] if
    /// another holder has it.
    pub fn try_acquire(path: &Path) -> LockResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| LockError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }

        let file = try_lock_file(path)?;
        trace!(path = %path.display(), "lock acquired");
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
        })
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock now.
    pub fn release(mut self) {
        self.unlock();
    }

    fn unlock(&mut self) {
        if let Some(file) = self.file.take() {
            // Delete while still holding the lock; late openers of the old
            // inode fail the identity check in `try_lock_file`.
            if let Err(e) = fs::remove_file(&self.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    debug!(path = %self.path.display(), error = %e, "could not remove lock file");
                }
            }
            unlock_file(&file);
            trace!(path = %self.path.display(), "lock released");
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        self.unlock();
    }
}

/// Whether the lock at `path` is held by someone.
///
/// An orphaned lock file is deleted and reported as free. Errors other than a
/// missing file count as held.
pub fn check_lock(path: &Path) -> bool {
    let file = match OpenOptions::new().write(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return false,
        Err(_) => return true,
    };

    match lock_exclusive(&file) {
        Ok(()) => {
            // The file may have been replaced since we opened it; only an
            // orphan still named by `path` is ours to remove.
            if !names_same_file(path, &file) {
                unlock_file(&file);
                return true;
            }
            debug!(path = %path.display(), "removing orphaned lock file");
            let _ = fs::remove_file(path);
            unlock_file(&file);
            false
        }
        Err(_) => true,
    }
}

/// Whether any file in `dir` accepted by `matches` is a held lock.
///
/// Orphans among them are cleaned up along the way.
pub fn check_locks_in<F>(dir: &Path, matches: F) -> bool
where
    F: Fn(&str) -> bool,
{
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return false,
        Err(_) => return true,
    };

    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => return true,
        };
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if matches(name) && check_lock(&entry.path()) {
            return true;
        }
    }
    false
}

fn try_lock_file(path: &Path) -> LockResult<File> {
    let file = open_lock_file(path).map_err(|source| LockError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    match lock_exclusive(&file) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            return Err(LockError::Busy(path.to_path_buf()));
        }
        Err(source) => {
            return Err(LockError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    }

    // A releasing holder may have unlinked the file between our open and our
    // lock, leaving us holding a lock nobody can see.
    if !names_same_file(path, &file) {
        unlock_file(&file);
        return Err(LockError::Busy(path.to_path_buf()));
    }
    Ok(file)
}

#[cfg(unix)]
fn open_lock_file(path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;

    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o644)
        .open(path)
}

#[cfg(not(unix))]
fn open_lock_file(path: &Path) -> io::Result<File> {
    OpenOptions::new().write(true).create_new(true).open(path).map_err(|e| {
        if e.kind() == io::ErrorKind::AlreadyExists {
            io::Error::new(io::ErrorKind::WouldBlock, "lock held")
        } else {
            e
        }
    })
}

#[cfg(unix)]
fn lock_exclusive(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        Ok(())
    } else {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            Err(io::Error::new(io::ErrorKind::WouldBlock, "lock held"))
        } else {
            Err(err)
        }
    }
}

// Without flock, holding the file created by `create_new` is the lock.
#[cfg(not(unix))]
fn lock_exclusive(_file: &File) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn unlock_file(file: &File) {
    use std::os::unix::io::AsRawFd;

    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

#[cfg(not(unix))]
fn unlock_file(_file: &File) {}

#[cfg(unix)]
fn names_same_file(path: &Path, file: &File) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (fs::metadata(path), file.metadata()) {
        (Ok(named), Ok(held)) => named.dev() == held.dev() && named.ino() == held.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn names_same_file(path: &Path, _file: &File) -> bool {
    path.exists()
}
