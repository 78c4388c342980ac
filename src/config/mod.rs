//! Cache configuration
//!
//! Values are resolved in three layers, later ones winning:
//! 1. Built-in defaults
//! 2. A TOML file, if given
//! 3. Environment variables (`DISKCACHE_ROOT`, `DISKCACHE_SIZE_LIMIT`)
//!
//! Command-line flags are applied on top by the binary.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable overriding [`CacheConfig::cache_root`]
pub const ENV_ROOT: &str = "DISKCACHE_ROOT";

/// Environment variable overriding [`CacheConfig::size_limit`]
pub const ENV_SIZE_LIMIT: &str = "DISKCACHE_SIZE_LIMIT";

/// Default size budget: 1 GiB
pub const DEFAULT_SIZE_LIMIT: u64 = 1024 * 1024 * 1024;

/// Default lookback buffer of a shared loader
pub const DEFAULT_LOOKBACK: usize = 8192;

/// Configuration of one cache root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding entries, locks and access markers
    pub cache_root: PathBuf,
    /// Budget in bytes for all entries together
    pub size_limit: u64,
    /// Bytes a shared loader keeps in memory behind its head
    pub lookback_capacity: usize,
    /// How long the directory watcher sleeps between wake-ups
    pub poll_interval_ms: u64,
    /// Scan newly created subdirectories on a worker thread
    pub rescan_on_worker: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_root: std::env::temp_dir().join("diskcache"),
            size_limit: DEFAULT_SIZE_LIMIT,
            lookback_capacity: DEFAULT_LOOKBACK,
            poll_interval_ms: 250,
            rescan_on_worker: true,
        }
    }
}

impl CacheConfig {
    /// Defaults with `cache_root` and `size_limit` replaced.
    pub fn new(cache_root: impl Into<PathBuf>, size_limit: u64) -> Self {
        Self {
            cache_root: cache_root.into(),
            size_limit,
            ..Self::default()
        }
    }

    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse(format!("TOML parse error: {}", e)))
    }

    /// Load a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&contents)
    }

    /// Defaults, then `path` if given, then the environment; validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup(ENV_ROOT).filter(|v| !v.is_empty()) {
            self.cache_root = PathBuf::from(root);
        }
        if let Some(limit) = lookup(ENV_SIZE_LIMIT).filter(|v| !v.is_empty()) {
            self.size_limit = limit.trim().parse().map_err(|e| {
                ConfigError::Parse(format!("{}={:?}: {}", ENV_SIZE_LIMIT, limit, e))
            })?;
        }
        Ok(())
    }

    /// Reject values the cache cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.size_limit == 0 {
            return Err(ConfigError::Invalid("size_limit must be positive".to_string()));
        }
        if self.lookback_capacity == 0 {
            return Err(ConfigError::Invalid(
                "lookback_capacity must be positive".to_string(),
            ));
        }
        if self.cache_root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("cache_root must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
