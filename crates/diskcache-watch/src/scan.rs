//! One-shot directory scans.

use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use tracing::warn;
use walkdir::WalkDir;

use crate::WatchResult;

pub(crate) fn walker(dir: &Path, recursive: bool) -> WalkDir {
    WalkDir::new(dir)
        .follow_links(false)
        .max_depth(if recursive { usize::MAX } else { 1 })
}

/// Lexically normalize a path: drop `.` and fold `..` into its parent.
///
/// The path is not resolved against the filesystem, so the directory does not
/// have to exist and symlinks are preserved.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Sum the sizes of the regular files in `dir`.
///
/// Fails only when `dir` itself cannot be read; entries that vanish during the
/// scan are skipped.
pub fn directory_size(dir: &Path, recursive: bool) -> WatchResult<u64> {
    let mut size = 0;
    for entry in walker(dir, recursive) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) if e.depth() == 0 => return Err(e.into()),
            Err(_) => continue,
        };
        if entry.file_type().is_file() {
            if let Ok(meta) = entry.metadata() {
                size += meta.len();
            }
        }
    }
    Ok(size)
}

/// List the regular files in `dir`.
pub fn directory_content(dir: &Path, recursive: bool) -> Vec<PathBuf> {
    let mut content = Vec::new();
    for entry in walker(dir, recursive) {
        match entry {
            Ok(e) if e.file_type().is_file() => content.push(e.into_path()),
            Ok(_) => {}
            Err(e) if e.depth() == 0 => {
                warn!(dir = %dir.display(), error = %e, "I/O error while scanning");
                break;
            }
            Err(_) => {}
        }
    }
    content
}

/// List the regular files in `dir` with their modification times, oldest first.
///
/// Files sharing a timestamp keep all their entries; ordering among them is
/// unspecified.
pub fn directory_content_last_access(dir: &Path, recursive: bool) -> Vec<(SystemTime, PathBuf)> {
    let mut content: Vec<(SystemTime, PathBuf)> = walker(dir, recursive)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let modified = e.metadata().ok()?.modified().ok()?;
            Some((modified, e.into_path()))
        })
        .collect();
    content.sort_by(|a, b| a.0.cmp(&b.0));
    content
}
