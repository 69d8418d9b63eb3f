//! Re-chunking filter: turns a trickle of small writes into few large ones.

use crate::constants::CHUNKY_MIN_AVAIL_BYTES;
use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;
use tracing::{debug, warn};

#[derive(Default, Clone, Debug)]
pub struct ChunkStats {
    pub inputs: usize,
    pub bytes: u64,
    pub writes: u64,
}

pub fn chunk_bytes_from_mb(size_mb: i64) -> Result<usize> {
    if size_mb <= 0 {
        bail!("chunk size must be a positive number of MiB, got {}", size_mb);
    }
    usize::try_from(size_mb)
        .ok()
        .and_then(|mb| mb.checked_mul(1024 * 1024))
        .with_context(|| format!("chunk size of {} MiB is too large", size_mb))
}

/// Buffers input and writes it out once fewer than `flush_below` bytes of
/// buffer space remain.
pub struct Rechunker<W: Write> {
    out: W,
    buf: Vec<u8>,
    filled: usize,
    flush_below: usize,
    stats: ChunkStats,
}

impl<W: Write> Rechunker<W> {
    pub fn new(out: W, chunk_bytes: usize, flush_below: usize) -> Self {
        let chunk_bytes = chunk_bytes.max(1);
        Self { out, buf: vec![0; chunk_bytes], filled: 0, flush_below: flush_below.clamp(1, chunk_bytes), stats: ChunkStats::default() }
    }

    /// Only ever writes full buffers (plus the tail at `finish`).
    pub fn full_chunks(out: W, chunk_bytes: usize) -> Self {
        Self::new(out, chunk_bytes, 1)
    }

    /// Writes whenever less than 1 MiB of space is left, so reads of many files
    /// are concatenated into large writes.
    pub fn concatenating(out: W, chunk_bytes: usize) -> Self {
        Self::new(out, chunk_bytes, CHUNKY_MIN_AVAIL_BYTES)
    }

    pub fn pump<R: Read>(&mut self, mut reader: R) -> Result<()> {
        self.stats.inputs += 1;
        loop {
            let rd = match reader.read(&mut self.buf[self.filled..]) {
                Ok(0) => return Ok(()),
                Ok(rd) => rd,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("read chunk input"),
            };
            self.filled += rd;
            self.stats.bytes += rd as u64;
            if self.buf.len() - self.filled < self.flush_below {
                self.write_out()?;
            }
        }
    }

    fn write_out(&mut self) -> Result<()> {
        if self.filled == 0 {
            return Ok(());
        }
        self.out.write_all(&self.buf[..self.filled]).context("write chunk")?;
        self.stats.writes += 1;
        self.filled = 0;
        Ok(())
    }

    pub fn finish(mut self) -> Result<ChunkStats> {
        self.write_out()?;
        self.out.flush().context("flush chunk output")?;
        debug!(inputs = self.stats.inputs, bytes = self.stats.bytes, writes = self.stats.writes, "rechunk complete");
        Ok(self.stats)
    }
}

/// Concatenates `paths` into `out`, skipping files that cannot be opened.
pub fn rechunk_files<W: Write>(paths: &[PathBuf], chunk_bytes: usize, out: W) -> Result<ChunkStats> {
    let mut chunker = Rechunker::concatenating(out, chunk_bytes);
    for path in paths {
        match File::open(path) {
            Ok(file) => chunker.pump(file).with_context(|| format!("rechunk {}", path.display()))?,
            Err(e) => warn!(path = %path.display(), "skipping unreadable input: {}", e),
        }
    }
    chunker.finish()
}

pub fn rechunk_stream<R: Read, W: Write>(reader: R, chunk_bytes: usize, out: W) -> Result<ChunkStats> {
    let mut chunker = Rechunker::full_chunks(out, chunk_bytes);
    chunker.pump(reader)?;
    chunker.finish()
}
