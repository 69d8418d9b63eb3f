//! Exit-code policy for pipeline stages.
//!
//! Copy and filter tools exit 1 when whoever reads their output goes away
//! early (`cat big | head -1`). Those exits are expected in truncated
//! pipelines and are not failures.

use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::ExitStatus;

/// Programs whose exit code 1 is tolerated.
pub const TOLERATED_ON_EXIT_1: &[&str] = &["cat", "zcat", "grep"];
/// Shell wrappers whose script is checked against [`TOLERATED_ON_EXIT_1`].
pub const SHELL_WRAPPERS: &[&str] = &["sh"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Success,
    /// Non-zero, but an expected broken-pipe style exit.
    Tolerated,
    Failure,
}

impl Verdict {
    pub fn is_failure(self) -> bool {
        self == Verdict::Failure
    }
}

fn base_name(program: &str) -> &str {
    Path::new(program).file_name().and_then(|n| n.to_str()).unwrap_or(program)
}

/// Whether `program args...` is one of the commands allowed to exit 1.
pub fn tolerates_exit_1(program: &str, args: &[String]) -> bool {
    let name = base_name(program);
    if TOLERATED_ON_EXIT_1.contains(&name) {
        return true;
    }
    if SHELL_WRAPPERS.contains(&name) {
        // sh -c "<command> ...": look at the script's first word
        if let Some(script) = args.get(1) {
            if let Some(first) = script.split_whitespace().next() {
                return TOLERATED_ON_EXIT_1.contains(&base_name(first));
            }
        }
    }
    false
}

pub fn judge(program: &str, args: &[String], status: ExitStatus) -> Verdict {
    if status.success() {
        return Verdict::Success;
    }
    match status.code() {
        Some(1) if tolerates_exit_1(program, args) => Verdict::Tolerated,
        Some(_) => Verdict::Failure,
        // killed by SIGPIPE: the producer's reader went away
        None if status.signal() == Some(libc::SIGPIPE) => Verdict::Tolerated,
        None => Verdict::Failure,
    }
}
