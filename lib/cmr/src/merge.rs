//! External k-way merge of key-sorted files, grouping equal keys.
//!
//! Each source holds its current line and the length of that line's key (the
//! bytes before the delimiter). Every round picks the smallest current key and
//! then drains, source by source in list order, every line carrying exactly
//! that key, so a key's lines come out as one contiguous run.

use crate::io::{content_len, read_record};
use crate::stats::MergeStats;
use anyhow::{bail, Result};
use memchr::memchr;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, warn};

struct MergeSource<R> {
    reader: R,
    label: PathBuf,
    line: Vec<u8>,
    key_len: usize,
    line_no: u64,
}

impl<R: BufRead> MergeSource<R> {
    fn key(&self) -> &[u8] {
        &self.line[..self.key_len]
    }

    /// Loads the next line. `Ok(false)` means the source is finished, either
    /// at end of file or after a read error.
    fn advance(&mut self, delimiter: u8) -> Result<bool> {
        match read_record(&mut self.reader, &mut self.line) {
            Ok(0) => return Ok(false),
            Ok(_) => {}
            Err(e) => {
                warn!(source = %self.label.display(), line = self.line_no + 1, "read failed, closing source: {}", e);
                return Ok(false);
            }
        }
        self.line_no += 1;
        match memchr(delimiter, &self.line[..content_len(&self.line)]) {
            Some(key_len) => {
                self.key_len = key_len;
                Ok(true)
            }
            None => bail!(
                "{}:{}: line has no key delimiter {:#04x}; merge inputs must be delimited and key-sorted",
                self.label.display(),
                self.line_no,
                delimiter
            ),
        }
    }
}

pub struct KWayMerge<R> {
    sources: Vec<MergeSource<R>>,
    delimiter: u8,
    stats: MergeStats,
}

impl<R: BufRead> KWayMerge<R> {
    pub fn new(delimiter: u8) -> Self {
        Self { sources: Vec::new(), delimiter, stats: MergeStats::default() }
    }

    /// Registers a source and loads its first line; empty sources are dropped
    /// immediately.
    pub fn add_source(&mut self, label: impl Into<PathBuf>, reader: R) -> Result<()> {
        let mut source = MergeSource { reader, label: label.into(), line: Vec::new(), key_len: 0, line_no: 0 };
        self.stats.sources += 1;
        if source.advance(self.delimiter)? {
            self.sources.push(source);
        } else {
            debug!(source = %source.label.display(), "empty merge source");
        }
        Ok(())
    }

    /// Merges every source into `out`.
    pub fn run<W: Write>(mut self, out: &mut W) -> Result<MergeStats> {
        let started = Instant::now();
        let mut min_key: Vec<u8> = Vec::new();

        while !self.sources.is_empty() {
            // min_by keeps the first of equal candidates
            let next = self
                .sources
                .iter()
                .min_by(|a, b| a.key().cmp(b.key()))
                .map(|s| s.key())
                .unwrap_or_default();
            min_key.clear();
            min_key.extend_from_slice(next);
            self.stats.groups += 1;

            let mut i = 0;
            while i < self.sources.len() {
                let source = &mut self.sources[i];
                let mut open = true;
                while source.key() == min_key.as_slice() {
                    out.write_all(&source.line)?;
                    self.stats.lines_out += 1;
                    self.stats.bytes_out += source.line.len() as u64;
                    if !source.advance(self.delimiter)? {
                        open = false;
                        break;
                    }
                }
                if open {
                    i += 1;
                } else {
                    debug!(source = %source.label.display(), lines = source.line_no, "merge source exhausted");
                    self.sources.remove(i);
                }
            }
        }

        out.flush()?;
        self.stats.finish(started.elapsed());
        self.stats.log();
        Ok(self.stats)
    }
}

/// Opens every path (skipping unreadable ones) and merges them into `out`.
pub fn merge_paths<W: Write>(paths: &[PathBuf], delimiter: u8, buffer_bytes: usize, out: &mut W) -> Result<MergeStats> {
    let mut merge = KWayMerge::new(delimiter);
    for path in paths {
        match File::open(path) {
            Ok(file) => merge.add_source(path.clone(), BufReader::with_capacity(buffer_bytes, file))?,
            Err(e) => warn!(path = %path.display(), "skipping unreadable merge input: {}", e),
        }
    }
    merge.run(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Cursor;

    const D: u8 = 0x02;

    fn merge(inputs: &[&str]) -> Result<Vec<u8>> {
        let mut merge = KWayMerge::new(D);
        for (i, input) in inputs.iter().enumerate() {
            merge.add_source(format!("src{}", i), Cursor::new(input.as_bytes().to_vec()))?;
        }
        let mut out = Vec::new();
        merge.run(&mut out)?;
        Ok(out)
    }

    #[test]
    fn interleaved_keys_are_grouped_in_order() {
        let out = merge(&[
            "a\x02a1\nc\x02c1\nc\x02c2\ne\x02e1\n",
            "b\x02b1\nc\x02c3\nd\x02d1\n",
            "a\x02a2\ne\x02e2\n",
        ])
        .unwrap();
        assert_eq!(
            out,
            b"a\x02a1\na\x02a2\nb\x02b1\nc\x02c1\nc\x02c2\nc\x02c3\nd\x02d1\ne\x02e1\ne\x02e2\n".to_vec()
        );
    }

    #[test]
    fn single_source_is_reproduced() {
        let input = "k1\x02x\nk1\x02y\nk2\x02z\n";
        assert_eq!(merge(&[input]).unwrap(), input.as_bytes().to_vec());
    }

    #[test]
    fn equal_keys_follow_source_order() {
        let out = merge(&["k\x021\nk\x022\n", "k\x023\n", "j\x020\nk\x024\n"]).unwrap();
        assert_eq!(out, b"j\x020\nk\x021\nk\x022\nk\x023\nk\x024\n".to_vec());
    }

    #[test]
    fn key_prefix_sorts_first() {
        let out = merge(&["ab\x021\n", "a\x022\n"]).unwrap();
        assert_eq!(out, b"a\x022\nab\x021\n".to_vec());
    }

    #[test]
    fn last_line_without_newline_is_kept() {
        let out = merge(&["a\x021\nc\x023", "b\x022\n"]).unwrap();
        assert_eq!(out, b"a\x021\nb\x022\nc\x023".to_vec());
    }

    #[test]
    fn missing_delimiter_is_fatal() {
        let err = merge(&["a\x021\nbroken line\n"]).unwrap_err();
        assert!(err.to_string().contains("src0:2"), "{}", err);
        assert!(merge(&["nodelim\n"]).is_err());
    }

    #[test]
    fn no_sources_no_output() {
        assert!(merge(&[]).unwrap().is_empty());
        assert!(merge(&["", ""]).unwrap().is_empty());
    }

    #[test]
    fn groups_are_contiguous_and_complete() {
        let mut inputs: Vec<String> = vec![String::new(); 4];
        for k in 0..50u32 {
            for (s, input) in inputs.iter_mut().enumerate() {
                if (k as usize + s) % 3 != 0 {
                    input.push_str(&format!("key{:03}\x02{}\n", k, s));
                }
            }
        }
        let refs: Vec<&str> = inputs.iter().map(|v| v.as_str()).collect();
        let out = merge(&refs).unwrap();
        let keys: Vec<&[u8]> = out.split(|b| *b == b'\n').filter(|l| !l.is_empty()).map(|l| l.split(|b| *b == D).next().unwrap()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        let total: usize = inputs.iter().map(|i| i.matches('\n').count()).sum();
        assert_eq!(keys.len(), total);
    }

    #[test]
    fn files_on_disk_including_duplicates_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, b"1\x02a\n3\x02a\n").unwrap();
        fs::write(&b, b"2\x02b\n").unwrap();
        let paths = vec![a.clone(), b.clone(), a.clone(), dir.path().join("missing")];
        let mut out = Vec::new();
        let stats = merge_paths(&paths, D, 16, &mut out).unwrap();
        assert_eq!(out, b"1\x02a\n1\x02a\n2\x02b\n3\x02a\n3\x02a\n".to_vec());
        assert_eq!(stats.sources, 3);
        assert_eq!(stats.lines_out, 5);
        assert_eq!(stats.groups, 3);
    }
}
