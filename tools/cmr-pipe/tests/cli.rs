use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const BIN: &str = env!("CARGO_BIN_EXE_cmr-pipe");

#[test]
fn no_arguments_exit_1() {
    let out = Command::new(BIN).output().unwrap();
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("usage"));
}

#[test]
fn malformed_pipeline_exits_1() {
    let out = Command::new(BIN).args(["echo", "a", ":"]).output().unwrap();
    assert_eq!(out.status.code(), Some(1));
}

#[test]
fn two_stages_forward_output() {
    let out = Command::new(BIN).args(["echo", "a", ":", "cat"]).stdin(Stdio::null()).output().unwrap();
    assert_eq!(out.status.code(), Some(0));
    assert_eq!(out.stdout, b"a\n");
}

#[test]
fn failing_stage_exits_1_with_prefixed_stderr() {
    let out = Command::new(BIN)
        .args(["--CMR_NAME", "worker", "sh", "-c", "echo boom >&2; exit 2", ":", "sleep", "30"])
        .stdin(Stdio::null())
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("worker: boom"));
}

#[test]
fn sigterm_kills_the_pipeline_and_exits_1() {
    let mut child = Command::new(BIN).args(["sleep", "30", ":", "sleep", "30"]).stdin(Stdio::null()).spawn().unwrap();
    thread::sleep(Duration::from_millis(500));
    let started = Instant::now();
    let rc = unsafe { libc::kill(child.id() as libc::pid_t, libc::SIGTERM) };
    assert_eq!(rc, 0);
    let status = child.wait().unwrap();
    assert_eq!(status.code(), Some(1));
    assert!(started.elapsed() < Duration::from_secs(10));
}
