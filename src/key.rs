//! Cache keys and their self-describing file names.
//!
//! A key is (id, size, last_modified). The file name is
//! `base64url(id ++ size:i64-LE ++ last_modified:i64-LE)` without padding,
//! so every entry on disk can be decoded back to its key from the name alone.

use std::fmt;
use std::path::Path;

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;

use crate::error::{CacheError, CacheResult};

/// Size or timestamp that is not known.
pub const UNKNOWN: i64 = -1;

const TRAILER_LEN: usize = 16;

/// URL-safe alphabet; encodes without padding, decodes with or without it.
const FILE_NAME_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Identity of one cached resource version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    id: Vec<u8>,
    size: i64,
    last_modified: i64,
}

impl CacheKey {
    pub fn new(id: impl AsRef<[u8]>, size: i64, last_modified: i64) -> Self {
        Self {
            id: id.as_ref().to_vec(),
            size,
            last_modified,
        }
    }

    pub fn id(&self) -> &[u8] {
        &self.id
    }

    /// The id as text, with invalid UTF-8 replaced.
    pub fn id_lossy(&self) -> String {
        String::from_utf8_lossy(&self.id).into_owned()
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn last_modified(&self) -> i64 {
        self.last_modified
    }

    /// Declared size, if known.
    pub fn known_size(&self) -> Option<u64> {
        u64::try_from(self.size).ok()
    }

    /// Entries of unknown size live in the boundless subtree.
    pub fn is_boundless(&self) -> bool {
        self.size == UNKNOWN
    }

    pub fn file_name(&self) -> String {
        let mut data = Vec::with_capacity(self.id.len() + TRAILER_LEN);
        data.extend_from_slice(&self.id);
        data.extend_from_slice(&self.size.to_le_bytes());
        data.extend_from_slice(&self.last_modified.to_le_bytes());
        FILE_NAME_ENGINE.encode(data)
    }

    /// Decode a file name produced by [`CacheKey::file_name`].
    ///
    /// The standard alphabet (`/`, `+`) is accepted as well.
    pub fn from_file_name(name: &str) -> CacheResult<Self> {
        let corrupt = |reason: String| CacheError::CorruptKey {
            name: name.to_string(),
            reason,
        };

        let normalized = name.replace('/', "_").replace('+', "-");
        let data = FILE_NAME_ENGINE
            .decode(normalized)
            .map_err(|e| corrupt(e.to_string()))?;
        if data.len() < TRAILER_LEN {
            return Err(corrupt(format!("{} bytes is too short", data.len())));
        }

        let split = data.len() - TRAILER_LEN;
        let mut size = [0u8; 8];
        let mut last_modified = [0u8; 8];
        size.copy_from_slice(&data[split..split + 8]);
        last_modified.copy_from_slice(&data[split + 8..]);

        Ok(Self {
            id: data[..split].to_vec(),
            size: i64::from_le_bytes(size),
            last_modified: i64::from_le_bytes(last_modified),
        })
    }

    /// Decode the final component of `path`.
    pub fn from_path(path: &Path) -> CacheResult<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| CacheError::CorruptKey {
                name: path.display().to_string(),
                reason: "no UTF-8 file name".to_string(),
            })?;
        Self::from_file_name(name)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (size {}, last modified {})",
            self.id_lossy(),
            self.size,
            self.last_modified
        )
    }
}
