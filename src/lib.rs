//! diskcache - a size-bounded disk cache for byte streams
//!
//! Entries are keyed by (id, size, last_modified) and stored as files whose
//! names encode the key, so the cache directory describes itself. Several
//! threads and several processes may use one cache directory at once:
//! - advisory lock files coordinate writers, readers and evictions
//! - readers of an entry that is still downloading share one upstream fetch
//! - a background directory mirror tracks what is on disk
//! - least recently accessed entries are evicted to stay within budget
//!
//! ```no_run
//! use diskcache::{CacheConfig, FileCache, Upstream, UNKNOWN};
//! use std::io::Read;
//!
//! let cache = FileCache::open(CacheConfig::new("/tmp/mycache", 64 << 20))?;
//! let upstream: Upstream = Box::new(std::fs::File::open("/etc/hosts")?);
//! if let Some(mut stream) = cache.get_cached_stream("hosts", Some(upstream), UNKNOWN, 1) {
//!     let mut text = String::new();
//!     stream.read_to_string(&mut text)?;
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod cache;
pub mod cacheable;
pub mod config;
pub mod context;
pub mod error;
pub mod key;
pub mod layout;
pub mod loader;
pub mod lock;
pub mod stream;

pub use cache::{EntryInfo, FileCache};
pub use cacheable::{Cacheable, FileResource};
pub use config::{CacheConfig, ConfigError};
pub use context::CacheContext;
pub use error::{CacheError, CacheResult};
pub use key::{CacheKey, UNKNOWN};
pub use layout::CacheLayout;
pub use loader::{LoaderHandle, LoaderRegistry, SharedLoader, Upstream};
pub use lock::{LockCoordinator, LockError, LockResult};
pub use stream::{ByteSource, CachedStream, HybridReader, StreamKind};

pub use diskcache_watch::{
    directory_content, directory_content_last_access, directory_size, DirectoryMirror, MirrorMode,
    WatchError, WatchRegistry,
};
