//! One in-flight fetch shared by every reader of the same entry.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::Upstream;

const SCRATCH_LEN: usize = 8192;

/// Failure of the upstream that later readers at the head must see too.
#[derive(Debug, Clone)]
struct SourceFailure {
    kind: io::ErrorKind,
    message: String,
}

impl SourceFailure {
    fn to_error(&self) -> io::Error {
        io::Error::new(self.kind, self.message.clone())
    }
}

/// Bytes `[0, flushed)` are in the channel and `[flushed, head)` are pending
/// in memory, so `flushed + pending.len() == head` at all times.
struct LoaderState {
    source: Option<Upstream>,
    channel: Option<File>,
    head: u64,
    flushed: u64,
    pending: Vec<u8>,
    /// Upstream bytes still to discard before the head lines up with it.
    resume_skip: u64,
    failure: Option<SourceFailure>,
}

/// Upstream source and destination file of one entry, with a write-head.
///
/// Every operation runs under one mutex, so advances of the head are totally
/// ordered while readers at different positions interleave.
pub struct SharedLoader {
    path: PathBuf,
    capacity: usize,
    state: Mutex<LoaderState>,
}

impl SharedLoader {
    /// Build a loader whose head starts at `start`.
    ///
    /// The first `start` bytes of `source` are expected to be in `channel`
    /// already. They are discarded from the upstream on first use, not here,
    /// so construction never waits on the upstream.
    pub(crate) fn new(path: &Path, source: Upstream, channel: File, start: u64, capacity: usize) -> Self {
        Self {
            path: path.to_path_buf(),
            capacity: capacity.max(1),
            state: Mutex::new(LoaderState {
                source: Some(source),
                channel: Some(channel),
                head: start,
                flushed: start,
                pending: Vec::with_capacity(capacity),
                resume_skip: start,
                failure: None,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Furthest position pulled from the upstream so far.
    pub fn head(&self) -> u64 {
        self.state.lock().head
    }

    /// Whether the upstream has been fully consumed or failed.
    pub fn input_closed(&self) -> bool {
        self.state.lock().source.is_none()
    }

    /// Fill `buf` with bytes starting at absolute position `pos`.
    ///
    /// Returns 0 at the end of the data.
    pub fn read_at(&self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut state = self.state.lock();
        self.settle(&mut state);
        if pos > state.head {
            let gap = pos - state.head;
            if self.advance(&mut state, gap)? < gap {
                return Ok(0);
            }
        }

        if pos == state.head {
            return self.pull(&mut state, buf);
        }

        if pos >= state.flushed {
            let offset = (pos - state.flushed) as usize;
            let available = &state.pending[offset..];
            let n = available.len().min(buf.len());
            buf[..n].copy_from_slice(&available[..n]);
            return Ok(n);
        }

        let limit = (state.flushed - pos).min(buf.len() as u64) as usize;
        match state.channel.as_mut() {
            Some(channel) => {
                channel.seek(SeekFrom::Start(pos))?;
                channel.read(&mut buf[..limit])
            }
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "loader closed")),
        }
    }

    /// Move a reader at `pos` forward by up to `n` bytes.
    ///
    /// Returns how far it moved, which is less than `n` only at the end.
    pub fn skip_from(&self, pos: u64, n: u64) -> io::Result<u64> {
        let target = pos.saturating_add(n);
        let mut state = self.state.lock();
        self.settle(&mut state);
        if target > state.head {
            let gap = target - state.head;
            self.advance(&mut state, gap)?;
        }
        Ok(state.head.min(target).saturating_sub(pos))
    }

    /// Pull everything left from the upstream, a chunk at a time so readers
    /// can interleave.
    pub fn drain(&self) -> io::Result<u64> {
        let mut total = 0u64;
        loop {
            let mut state = self.state.lock();
            self.settle(&mut state);
            let moved = self.advance(&mut state, SCRATCH_LEN as u64)?;
            if moved == 0 {
                return Ok(total);
            }
            total += moved;
        }
    }

    /// Flush, close the upstream and close the channel.
    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock();
        if let Err(e) = self.flush(&mut state) {
            warn!(path = %self.path.display(), error = %e, "could not flush cache file");
        }
        state.source = None;
        if let Some(channel) = state.channel.take() {
            if let Err(e) = channel.sync_data() {
                debug!(path = %self.path.display(), error = %e, "could not sync cache file");
            }
        }
        trace!(path = %self.path.display(), head = state.head, "loader closed");
    }

    /// Read up to `buf.len()` bytes at the head from the upstream.
    fn pull(&self, state: &mut LoaderState, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(failure) = &state.failure {
            return Err(failure.to_error());
        }
        let Some(source) = state.source.as_mut() else {
            return Ok(0);
        };

        // Never hold more than `capacity` unflushed bytes.
        let room = self.capacity.saturating_sub(state.pending.len()).max(1);
        let want = buf.len().min(room);
        let n = loop {
            match source.read(&mut buf[..want]) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(path = %self.path.display(), head = state.head, error = %e, "upstream read failed");
                    return Err(e);
                }
            }
        };

        if n == 0 {
            self.close_input(state)?;
            return Ok(0);
        }

        state.head += n as u64;
        state.pending.extend_from_slice(&buf[..n]);
        if state.pending.len() >= self.capacity {
            self.flush(state)?;
        }
        Ok(n)
    }

    /// Discard the resume prefix of the upstream, once.
    ///
    /// If the upstream ends or fails first, the head falls back to where it
    /// stopped and the upstream is closed.
    fn settle(&self, state: &mut LoaderState) {
        let start = state.resume_skip;
        if start == 0 {
            return;
        }
        state.resume_skip = 0;
        let Some(source) = state.source.as_mut() else {
            return;
        };

        let mut skipped = 0u64;
        let mut scratch = [0u8; SCRATCH_LEN];
        while skipped < start {
            let want = (start - skipped).min(SCRATCH_LEN as u64) as usize;
            match source.read(&mut scratch[..want]) {
                Ok(0) => break,
                Ok(n) => skipped += n as u64,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(path = %self.path.display(), start, skipped, error = %e, "upstream failed while skipping to resume position");
                    state.failure = Some(SourceFailure {
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                    break;
                }
            }
        }

        if skipped < start {
            if state.failure.is_none() {
                debug!(path = %self.path.display(), start, skipped, "upstream shorter than resume position");
            }
            state.source = None;
            state.head = skipped;
            state.flushed = skipped;
        }
    }

    /// Discard up to `n` bytes at the head. Returns how many were available.
    fn advance(&self, state: &mut LoaderState, n: u64) -> io::Result<u64> {
        let mut scratch = [0u8; SCRATCH_LEN];
        let mut done = 0u64;
        while done < n {
            let want = (n - done).min(SCRATCH_LEN as u64) as usize;
            let read = self.pull(state, &mut scratch[..want])?;
            if read == 0 {
                break;
            }
            done += read as u64;
        }
        Ok(done)
    }

    fn flush(&self, state: &mut LoaderState) -> io::Result<()> {
        if state.pending.is_empty() {
            return Ok(());
        }
        let Some(channel) = state.channel.as_mut() else {
            return Ok(());
        };
        channel.seek(SeekFrom::Start(state.flushed))?;
        channel.write_all(&state.pending)?;
        state.flushed += state.pending.len() as u64;
        state.pending.clear();
        Ok(())
    }

    /// The upstream ended: commit what is pending and let go of the source,
    /// along with anything bound to it.
    fn close_input(&self, state: &mut LoaderState) -> io::Result<()> {
        if state.source.is_none() {
            return Ok(());
        }
        self.flush(state)?;
        state.source = None;
        debug!(path = %self.path.display(), bytes = state.head, "upstream fully loaded");
        Ok(())
    }
}

impl std::fmt::Debug for SharedLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedLoader")
            .field("path", &self.path)
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, OpenOptions};
    use std::io::Cursor;
    use tempfile::TempDir;

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn channel(path: &Path) -> File {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .unwrap()
    }

    fn read_all_from(loader: &SharedLoader, mut pos: u64, chunk: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; chunk];
        loop {
            let n = loader.read_at(pos, &mut buf).unwrap();
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&buf[..n]);
            pos += n as u64;
        }
    }

    #[test]
    fn test_sequential_read_fills_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("entry");
        let source = data(20_000);
        let loader = SharedLoader::new(&path, Box::new(Cursor::new(source.clone())), channel(&path), 0, 64);

        assert_eq!(read_all_from(&loader, 0, 1000), source);
        assert!(loader.input_closed());
        assert_eq!(fs::read(&path).unwrap(), source);
    }

    #[test]
    fn test_lookback_and_rewind() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("entry");
        let source = data(1000);
        let loader = SharedLoader::new(&path, Box::new(Cursor::new(source.clone())), channel(&path), 0, 100);

        let mut buf = [0u8; 250];
        assert_eq!(loader.read_at(0, &mut buf).unwrap(), 100);
        assert_eq!(loader.read_at(100, &mut buf).unwrap(), 100);
        assert_eq!(loader.read_at(200, &mut buf[..50]).unwrap(), 50);
        assert_eq!(loader.head(), 250);

        // Pending bytes were flushed once the lookback filled.
        let mut small = [0u8; 10];
        assert_eq!(loader.read_at(5, &mut small).unwrap(), 10);
        assert_eq!(&small[..], &source[5..15]);
        assert_eq!(loader.head(), 250);
    }

    #[test]
    fn test_recent_bytes_served_from_memory() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("entry");
        let source = data(100);
        let loader = SharedLoader::new(&path, Box::new(Cursor::new(source.clone())), channel(&path), 0, 4096);

        let mut buf = [0u8; 60];
        loader.read_at(0, &mut buf).unwrap();
        // Nothing has reached the file yet.
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);

        let mut back = [0u8; 20];
        assert_eq!(loader.read_at(30, &mut back).unwrap(), 20);
        assert_eq!(&back[..], &source[30..50]);
    }

    #[test]
    fn test_read_ahead_skips_gap() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("entry");
        let source = data(500);
        let loader = SharedLoader::new(&path, Box::new(Cursor::new(source.clone())), channel(&path), 0, 64);

        let mut buf = [0u8; 10];
        assert_eq!(loader.read_at(300, &mut buf).unwrap(), 10);
        assert_eq!(&buf[..], &source[300..310]);
        assert_eq!(read_all_from(&loader, 0, 33), source);
    }

    #[test]
    fn test_skip_stops_at_end() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("entry");
        let loader = SharedLoader::new(&path, Box::new(Cursor::new(data(100))), channel(&path), 0, 64);

        assert_eq!(loader.skip_from(0, 40).unwrap(), 40);
        assert_eq!(loader.skip_from(40, 1000).unwrap(), 60);
        assert_eq!(loader.skip_from(100, 10).unwrap(), 0);
        // Skipping behind the head does not touch the upstream.
        assert_eq!(loader.skip_from(10, 20).unwrap(), 20);
    }

    #[test]
    fn test_resume_skips_upstream_prefix() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("entry");
        let source = data(100);
        fs::write(&path, &source[..50]).unwrap();

        // The first half of this upstream differs; only the tail may be used.
        let mut upstream = vec![0xAAu8; 50];
        upstream.extend_from_slice(&source[50..]);
        let loader = SharedLoader::new(&path, Box::new(Cursor::new(upstream)), channel(&path), 50, 64);
        assert_eq!(loader.head(), 50);

        assert_eq!(read_all_from(&loader, 0, 16), source);
        loader.shutdown();
        assert_eq!(fs::read(&path).unwrap(), source);
    }

    #[test]
    fn test_short_upstream_on_resume() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("entry");
        fs::write(&path, data(80)).unwrap();

        let loader = SharedLoader::new(&path, Box::new(Cursor::new(data(30))), channel(&path), 80, 64);
        assert_eq!(loader.head(), 80);
        assert_eq!(read_all_from(&loader, 0, 16), data(30));
        assert_eq!(loader.head(), 30);
        assert!(loader.input_closed());
    }

    #[test]
    fn test_construction_does_not_read_upstream() {
        struct Untouchable;
        impl Read for Untouchable {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                panic!("upstream read during construction");
            }
        }

        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("entry");
        let loader = SharedLoader::new(&path, Box::new(Untouchable), channel(&path), 20_000, 64);
        assert_eq!(loader.head(), 20_000);
        loader.shutdown();
    }

    #[test]
    fn test_large_reads_keep_pending_within_capacity() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("entry");
        let source = data(1 << 20);
        let loader = SharedLoader::new(&path, Box::new(Cursor::new(source.clone())), channel(&path), 0, 4096);

        let mut buf = vec![0u8; 1 << 20];
        let n = loader.read_at(0, &mut buf).unwrap();
        assert!(n > 0 && n <= 4096, "read {} bytes into a 4096 byte lookback", n);
        assert!(loader.state.lock().pending.len() <= 4096);
        assert_eq!(read_all_from(&loader, 0, 1 << 20), source);
    }

    #[test]
    fn test_upstream_error_reaches_reader_and_keeps_partial_file() {
        struct Failing {
            left: usize,
        }
        impl Read for Failing {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                if self.left == 0 {
                    return Err(io::Error::new(io::ErrorKind::ConnectionReset, "gone"));
                }
                let n = buf.len().min(self.left);
                buf[..n].fill(7);
                self.left -= n;
                Ok(n)
            }
        }

        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("entry");
        let loader = SharedLoader::new(&path, Box::new(Failing { left: 50 }), channel(&path), 0, 16);

        let mut buf = [0u8; 100];
        let mut pos = 0u64;
        let err = loop {
            match loader.read_at(pos, &mut buf) {
                Ok(n) => {
                    assert!(n > 0);
                    pos += n as u64;
                }
                Err(e) => break e,
            }
        };
        assert_eq!(pos, 50);
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);

        loader.shutdown();
        assert_eq!(fs::metadata(&path).unwrap().len(), 50);
    }
}
