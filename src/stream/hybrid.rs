//! Reader over a partial cache file that continues from the upstream.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

use tracing::trace;

use super::{discard, ByteSource};
use crate::loader::Upstream;

/// Serves bytes from the cache file while it has them, then switches to the
/// upstream for the rest.
///
/// The switch happens once: the file is closed and the upstream is advanced
/// past the bytes already delivered.
pub struct HybridReader {
    upstream: Upstream,
    channel: Option<File>,
    position: u64,
}

impl HybridReader {
    pub fn new(upstream: Upstream, channel: File) -> Self {
        Self {
            upstream,
            channel: Some(channel),
            position: 0,
        }
    }

    /// Whether reads still come from the cache file.
    pub fn on_file(&self) -> bool {
        self.channel.is_some()
    }

    /// Bytes delivered or skipped so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Close the file and line the upstream up with `position`.
    ///
    /// Returns how far the upstream could be advanced.
    fn switch_to_upstream(&mut self) -> io::Result<u64> {
        if self.channel.take().is_none() {
            return Ok(self.position);
        }
        let skipped = discard(&mut self.upstream, self.position)?;
        trace!(position = self.position, skipped, "hybrid reader switched to upstream");
        Ok(skipped)
    }
}

impl Read for HybridReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        if let Some(channel) = self.channel.as_mut() {
            match channel.read(buf) {
                Ok(n) if n > 0 => {
                    self.position += n as u64;
                    return Ok(n);
                }
                // End of file, or the file became unreadable: fall through.
                Ok(_) | Err(_) => {
                    let skipped = self.switch_to_upstream()?;
                    if skipped < self.position {
                        return Ok(0);
                    }
                }
            }
        }

        let n = self.upstream.read(buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl ByteSource for HybridReader {
    fn skip(&mut self, n: u64) -> io::Result<u64> {
        let start = self.position;
        let Some(channel) = self.channel.as_mut() else {
            let skipped = discard(&mut self.upstream, n)?;
            self.position += skipped;
            return Ok(skipped);
        };

        let in_file = match (channel.metadata(), channel.stream_position()) {
            (Ok(meta), Ok(pos)) => meta.len().saturating_sub(pos),
            _ => 0,
        };
        if n <= in_file {
            channel.seek(SeekFrom::Current(n as i64))?;
            self.position += n;
            return Ok(n);
        }

        let target = start.saturating_add(n);
        self.position = target;
        let reached = self.switch_to_upstream()?;
        self.position = reached.min(target);
        Ok(self.position - start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 199) as u8).collect()
    }

    /// Partial file holding the first `cached` bytes of `data`, and an
    /// upstream whose prefix is garbage so that reading it would show.
    fn setup(temp_dir: &TempDir, data: &[u8], cached: usize) -> HybridReader {
        let path = temp_dir.path().join("partial");
        fs::write(&path, &data[..cached]).unwrap();
        let mut upstream = vec![0xEEu8; cached];
        upstream.extend_from_slice(&data[cached..]);
        HybridReader::new(Box::new(Cursor::new(upstream)), File::open(&path).unwrap())
    }

    #[test]
    fn test_reads_file_then_upstream() {
        let temp_dir = TempDir::new().unwrap();
        let data = data(300);
        let mut reader = setup(&temp_dir, &data, 120);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
        assert!(!reader.on_file());
    }

    #[test]
    fn test_skip_within_file() {
        let temp_dir = TempDir::new().unwrap();
        let data = data(300);
        let mut reader = setup(&temp_dir, &data, 120);

        assert_eq!(reader.skip(100).unwrap(), 100);
        assert!(reader.on_file());
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, &data[100..]);
    }

    #[test]
    fn test_skip_across_boundary() {
        let temp_dir = TempDir::new().unwrap();
        let data = data(300);
        let mut reader = setup(&temp_dir, &data, 120);

        let mut head = [0u8; 20];
        reader.read_exact(&mut head).unwrap();
        assert_eq!(reader.skip(130).unwrap(), 130);
        assert!(!reader.on_file());
        assert_eq!(reader.position(), 150);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, &data[150..]);
    }

    #[test]
    fn test_skip_past_end() {
        let temp_dir = TempDir::new().unwrap();
        let data = data(50);
        let mut reader = setup(&temp_dir, &data, 30);

        assert_eq!(reader.skip(500).unwrap(), 50);
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    }
}
