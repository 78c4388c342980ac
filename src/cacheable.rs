//! Resources the cache can fetch on its own.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::key::UNKNOWN;
use crate::loader::Upstream;

/// A resource with a stable identity and a way to fetch its bytes.
pub trait Cacheable {
    /// Identifier that stays the same across versions of the resource.
    fn unique_id(&self) -> String;

    /// Size in bytes, or [`UNKNOWN`].
    fn size(&self) -> i64;

    /// Version timestamp in milliseconds, or [`UNKNOWN`].
    fn last_modified(&self) -> i64;

    /// Open the content. Called only on a cache miss.
    fn request_content(&self) -> io::Result<Upstream>;
}

/// A local file as a cacheable resource.
///
/// Size and version come from the file's metadata when it is created.
#[derive(Debug, Clone)]
pub struct FileResource {
    path: PathBuf,
    id: String,
    size: i64,
    last_modified: i64,
}

impl FileResource {
    /// Describe `path`, identified by its canonical path.
    pub fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = fs::canonicalize(path.as_ref())?;
        let id = path.to_string_lossy().into_owned();
        Self::with_id(path, id)
    }

    /// Describe `path` under a caller-chosen id.
    pub fn with_id(path: impl AsRef<Path>, id: impl Into<String>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let meta = fs::metadata(&path)?;
        let size = i64::try_from(meta.len()).unwrap_or(UNKNOWN);
        let last_modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .and_then(|d| i64::try_from(d.as_millis()).ok())
            .unwrap_or(UNKNOWN);

        Ok(Self {
            path,
            id: id.into(),
            size,
            last_modified,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Cacheable for FileResource {
    fn unique_id(&self) -> String {
        self.id.clone()
    }

    fn size(&self) -> i64 {
        self.size
    }

    fn last_modified(&self) -> i64 {
        self.last_modified
    }

    fn request_content(&self) -> io::Result<Upstream> {
        Ok(Box::new(File::open(&self.path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    #[test]
    fn test_file_resource_metadata() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("asset.bin");
        fs::write(&path, vec![3u8; 42]).unwrap();

        let resource = FileResource::new(&path).unwrap();
        assert_eq!(resource.size(), 42);
        assert!(resource.last_modified() > 0);
        assert!(resource.unique_id().ends_with("asset.bin"));

        let mut content = Vec::new();
        resource.request_content().unwrap().read_to_end(&mut content).unwrap();
        assert_eq!(content, vec![3u8; 42]);
    }

    #[test]
    fn test_custom_id() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a");
        fs::write(&path, b"x").unwrap();
        assert_eq!(FileResource::with_id(&path, "my-id").unwrap().unique_id(), "my-id");
    }

    #[test]
    fn test_missing_file() {
        assert!(FileResource::new("/nonexistent/asset").is_err());
    }
}
