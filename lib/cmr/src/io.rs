use crate::constants::OUTPUT_FILE_MODE;
use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::BufRead;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Makes sure the partition destination exists, creating parents as needed.
pub fn ensure_dir(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(dir).with_context(|| format!("create destination directory {}", dir.display()))
}

/// Creates (or truncates) an output file with the mode partition files get.
pub fn open_output_file(path: impl AsRef<Path>) -> Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(OUTPUT_FILE_MODE)
        .open(path.as_ref())
        .with_context(|| format!("open output {}", path.as_ref().display()))
}

/// Expands `{a,b}` alternatives left to right, nested ones included, like
/// `glob(3)` with `GLOB_BRACE`. Unbalanced braces and `{}` stay literal.
pub fn expand_braces(pattern: &str) -> Vec<String> {
    let Some(open) = pattern.find('{') else { return vec![pattern.to_string()] };
    let mut depth = 0usize;
    let mut bounds = vec![open];
    let mut close = None;
    for (i, b) in pattern.bytes().enumerate().skip(open) {
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    close = Some(i);
                    break;
                }
            }
            b',' if depth == 1 => bounds.push(i),
            _ => {}
        }
    }
    let Some(close) = close else { return vec![pattern.to_string()] };
    let (prefix, suffix) = (&pattern[..open], &pattern[close + 1..]);
    if close == open + 1 {
        return expand_braces(suffix).into_iter().map(|rest| format!("{}{{}}{}", prefix, rest)).collect();
    }
    bounds.push(close);
    bounds
        .windows(2)
        .flat_map(|w| expand_braces(&format!("{}{}{}", prefix, &pattern[w[0] + 1..w[1]], suffix)))
        .collect()
}

/// Expands every pattern in order and concatenates the matches.
///
/// Brace alternatives are expanded first. Each resulting pattern contributes
/// its matches in sorted order; a path matched twice appears twice. Bad
/// patterns and unreadable entries are skipped.
pub fn expand_globs<S: AsRef<str>>(patterns: &[S]) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for pattern in patterns.iter().flat_map(|p| expand_braces(p.as_ref())) {
        let pattern = pattern.as_str();
        match glob::glob(pattern) {
            Ok(entries) => {
                for entry in entries {
                    match entry {
                        Ok(p) => paths.push(p),
                        Err(e) => warn!(pattern, "glob entry: {}", e),
                    }
                }
            }
            Err(e) => warn!(pattern, "bad glob pattern: {}", e),
        }
    }
    paths
}

/// Reads one newline-terminated record into `buf`, replacing its contents.
/// Returns the number of bytes read; zero means end of input.
pub fn read_record<R: BufRead + ?Sized>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<usize> {
    buf.clear();
    reader.read_until(b'\n', buf)
}

/// Length of `record` without its trailing newline.
pub fn content_len(record: &[u8]) -> usize {
    match record.last() {
        Some(b'\n') => record.len() - 1,
        _ => record.len(),
    }
}

/// Soft limit on open descriptors; `None` when unlimited or unknown.
pub fn open_file_limit() -> Option<u64> {
    let mut limit = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
    // SAFETY: getrlimit only writes into the struct we hand it.
    match unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } {
        0 if limit.rlim_cur != libc::RLIM_INFINITY => Some(limit.rlim_cur as u64),
        _ => None,
    }
}
