//! Space reservation and LRU eviction.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;

use tracing::{debug, info, warn};

use super::FileCache;
use crate::error::{CacheError, CacheResult};
use crate::key::{CacheKey, UNKNOWN};

impl FileCache {
    /// Reserve room for `key` by creating its empty file at `entry`.
    ///
    /// Evicts least recently accessed entries while the cache is over budget.
    /// On failure the placeholder is removed again.
    pub(crate) fn reserve_space(&self, key: &CacheKey, entry: &Path) -> CacheResult<()> {
        if let Some(parent) = entry.parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new().write(true).create_new(true).open(entry)?;

        let requested = key.known_size().unwrap_or(0);
        let limit = self.config.size_limit;
        let mut used = self.tracked_size_excluding(entry).saturating_add(requested);
        let boundless = match diskcache_watch::directory_size(&self.layout.boundless_dir(), true) {
            Ok(size) => size,
            Err(e) => {
                warn!(error = %e, "could not measure boundless entries");
                0
            }
        };
        used = used.saturating_add(boundless);

        if used > limit {
            used = self.evict_until(used, limit, entry);
        }

        let free = free_space(self.layout.root()).unwrap_or(u64::MAX);
        if used > limit || free < requested {
            remove_placeholder(entry);
            debug!(key = %key, used, limit, free, "no space for entry");
            return Err(CacheError::SpaceUnavailable {
                requested: key.size(),
                limit,
            });
        }
        Ok(())
    }

    /// Delete entries oldest-access first until `used` fits into `limit` or
    /// nothing more can be deleted. Returns the new usage.
    fn evict_until(&self, mut used: u64, limit: u64, keep: &Path) -> u64 {
        let markers = diskcache_watch::directory_content_last_access(&self.layout.marker_dir(), true);
        for (_, marker) in markers {
            if used <= limit {
                break;
            }
            let Some(victim) = self.layout.entry_for_marker(&marker) else {
                continue;
            };
            if victim == keep {
                continue;
            }

            let freed = accounted_size(&victim);
            if self.locks.try_delete(&victim) {
                used = used.saturating_sub(freed);
                info!(entry = %victim.display(), bytes = freed, "evicted cache entry");
            }
        }
        used
    }

    /// Sum of the declared sizes of the entries in the root, except `skip`.
    fn tracked_size_excluding(&self, skip: &Path) -> u64 {
        self.mirror
            .barriered_snapshot()
            .paths()
            .into_iter()
            .filter(|path| path != skip && path.is_file())
            .filter_map(|path| CacheKey::from_path(&path).ok())
            .filter_map(|key| key.known_size())
            .fold(0u64, u64::saturating_add)
    }
}

/// Bytes an entry counts for: its declared size, or its length when the size
/// is unknown. Zero when it is gone.
fn accounted_size(entry: &Path) -> u64 {
    let Ok(meta) = fs::metadata(entry) else {
        return 0;
    };
    match CacheKey::from_path(entry) {
        Ok(key) if key.size() != UNKNOWN => key.known_size().unwrap_or(0),
        _ => meta.len(),
    }
}

fn remove_placeholder(entry: &Path) {
    if let Err(e) = fs::remove_file(entry) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(entry = %entry.display(), error = %e, "could not remove placeholder");
        }
    }
}

/// Bytes available to unprivileged users on the filesystem holding `dir`.
#[cfg(unix)]
#[allow(clippy::unnecessary_cast)]
pub(crate) fn free_space(dir: &Path) -> io::Result<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(dir.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
}

#[cfg(not(unix))]
pub(crate) fn free_space(_dir: &Path) -> io::Result<u64> {
    Ok(u64::MAX)
}
