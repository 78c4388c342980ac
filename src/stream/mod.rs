//! Streams handed out by the cache
//!
//! Callers always get a [`CachedStream`]. Underneath it is one of:
//! - a reader attached to a shared loader ([`StreamKind::Cached`])
//! - a plain reader over a complete cache file ([`StreamKind::File`])
//! - a [`HybridReader`] over a partial file and the upstream
//! - the caller's own upstream, untouched ([`StreamKind::Passthrough`])
//!
//! Locks that protect the underlying file travel with the stream and are
//! released when it is closed or dropped.

mod hybrid;

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

use crate::loader::{LoaderHandle, Upstream};
use crate::lock::FileLock;

pub use hybrid::HybridReader;

const SCRATCH_LEN: usize = 8192;

/// A readable byte stream that can also skip forward.
pub trait ByteSource: Read + Send {
    /// Advance by up to `n` bytes without returning them.
    ///
    /// Returns how far the stream moved; less than `n` only at the end.
    fn skip(&mut self, n: u64) -> io::Result<u64>;
}

/// Read and throw away up to `n` bytes.
pub(crate) fn discard<R: Read + ?Sized>(reader: &mut R, n: u64) -> io::Result<u64> {
    let mut scratch = [0u8; SCRATCH_LEN];
    let mut done = 0u64;
    while done < n {
        let want = (n - done).min(SCRATCH_LEN as u64) as usize;
        match reader.read(&mut scratch[..want]) {
            Ok(0) => break,
            Ok(read) => done += read as u64,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

/// Which path the cache took for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Attached to a loader that fills the cache file.
    Cached,
    /// Reading a complete cache file.
    File,
    /// Reading a partial cache file, then the upstream.
    Hybrid,
    /// Not cached at all.
    Passthrough,
}

/// Reader positioned on a shared loader.
pub struct CachedReader {
    handle: LoaderHandle,
    position: u64,
}

impl CachedReader {
    pub fn new(handle: LoaderHandle) -> Self {
        Self {
            handle,
            position: 0,
        }
    }
}

impl Read for CachedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.handle.read_at(self.position, buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl ByteSource for CachedReader {
    fn skip(&mut self, n: u64) -> io::Result<u64> {
        let skipped = self.handle.skip_from(self.position, n)?;
        self.position += skipped;
        Ok(skipped)
    }
}

/// Reader over a complete cache file.
pub struct FileReader {
    file: File,
}

impl FileReader {
    pub fn new(file: File) -> Self {
        Self { file }
    }
}

impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl ByteSource for FileReader {
    fn skip(&mut self, n: u64) -> io::Result<u64> {
        let len = self.file.metadata()?.len();
        let pos = self.file.stream_position()?;
        let step = n.min(len.saturating_sub(pos));
        self.file.seek(SeekFrom::Start(pos + step))?;
        Ok(step)
    }
}

/// The caller's upstream, unwrapped.
pub struct Passthrough {
    upstream: Upstream,
}

impl Passthrough {
    pub fn new(upstream: Upstream) -> Self {
        Self { upstream }
    }
}

impl Read for Passthrough {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.upstream.read(buf)
    }
}

impl ByteSource for Passthrough {
    fn skip(&mut self, n: u64) -> io::Result<u64> {
        discard(&mut self.upstream, n)
    }
}

/// Upstream that owns the write lock of the entry it feeds. The lock goes
/// away with the upstream.
pub(crate) struct LockedSource {
    inner: Upstream,
    _lock: FileLock,
}

impl LockedSource {
    pub(crate) fn new(inner: Upstream, lock: FileLock) -> Self {
        Self { inner, _lock: lock }
    }
}

impl Read for LockedSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

/// Stream returned by [`crate::FileCache`].
pub struct CachedStream {
    // Declared before `locks` so the reader closes first.
    inner: Box<dyn ByteSource>,
    kind: StreamKind,
    locks: Vec<FileLock>,
}

impl CachedStream {
    pub(crate) fn new(inner: impl ByteSource + 'static, kind: StreamKind) -> Self {
        Self {
            inner: Box::new(inner),
            kind,
            locks: Vec::new(),
        }
    }

    pub(crate) fn passthrough(upstream: Upstream) -> Self {
        Self::new(Passthrough::new(upstream), StreamKind::Passthrough)
    }

    /// Keep `lock` held for as long as the stream lives.
    pub(crate) fn with_lock(mut self, lock: FileLock) -> Self {
        self.locks.push(lock);
        self
    }

    pub(crate) fn with_optional_lock(self, lock: Option<FileLock>) -> Self {
        match lock {
            Some(lock) => self.with_lock(lock),
            None => self,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Whether the stream holds any lock on a cache file.
    pub fn is_locked(&self) -> bool {
        !self.locks.is_empty()
    }

    /// Release the underlying reader, then its locks.
    pub fn close(self) {
        drop(self);
    }
}

impl Read for CachedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl ByteSource for CachedStream {
    fn skip(&mut self, n: u64) -> io::Result<u64> {
        self.inner.skip(n)
    }
}

impl std::fmt::Debug for CachedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedStream")
            .field("kind", &self.kind)
            .field("locks", &self.locks.len())
            .finish()
    }
}
