//! Runs a chain of processes connected stdout -> stdin and watches them.
//!
//! A single supervising thread polls every stage: it echoes captured stderr
//! as `name: line`, reaps exited stages without blocking, applies the
//! exit-code policy, and kills every remaining stage once one has failed or a
//! cancellation was requested. Reader threads turn the children's stderr into
//! channel events; a copier thread forwards the last stage's stdout.

use crate::constants::{DEFAULT_PIPE_POLL_MS, ENV_PIPE_POLL_MS, EXIT_GRACE_MS};
use crate::io::{content_len, open_output_file};
use crate::pipe::policy::{judge, Verdict};
use crate::pipe::signals::CancelToken;
use crate::pipe::spec::{PipelineSpec, ProcSpec};
use crate::utils::env_or;
use anyhow::{bail, Context, Result};
use crossbeam_channel::{self as channel, Receiver, RecvTimeoutError, Sender};
use std::io::{self, BufRead, BufReader, ErrorKind, Read, Write};
use std::os::unix::process::CommandExt;
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

enum StderrEvent {
    Line(usize, Vec<u8>),
    Closed(usize),
}

#[derive(Clone, Debug)]
pub struct StageReport {
    pub name: String,
    pub program: String,
    pub status: Option<ExitStatus>,
    pub verdict: Verdict,
}

#[derive(Clone, Debug)]
pub struct PipelineOutcome {
    pub stages: Vec<StageReport>,
    pub cancelled: bool,
}

impl PipelineOutcome {
    pub fn success(&self) -> bool {
        !self.cancelled && !self.stages.iter().any(|s| s.verdict.is_failure())
    }

    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }
}

struct Stage {
    spec: ProcSpec,
    child: Child,
    finished: bool,
    kill_sent: bool,
    status: Option<ExitStatus>,
    verdict: Option<Verdict>,
}

impl Stage {
    fn kill(&mut self) {
        if self.kill_sent {
            return;
        }
        self.kill_sent = true;
        if let Err(e) = self.child.kill() {
            debug!(stage = %self.spec.name, "kill: {}", e);
        }
    }
}

pub struct Supervisor {
    spec: PipelineSpec,
    stdout: Box<dyn Write + Send>,
    stderr_echo: Box<dyn Write + Send>,
    cancel: CancelToken,
    poll_interval: Duration,
    exit_grace: Duration,
}

impl Supervisor {
    pub fn new(spec: PipelineSpec) -> Self {
        Self {
            spec,
            stdout: Box::new(io::stdout()),
            stderr_echo: Box::new(io::stderr()),
            cancel: CancelToken::new(),
            poll_interval: Duration::from_millis(env_or(ENV_PIPE_POLL_MS, DEFAULT_PIPE_POLL_MS)),
            exit_grace: Duration::from_millis(EXIT_GRACE_MS),
        }
    }

    /// Where the last stage's output goes, unless it has a file sink.
    pub fn stdout(mut self, out: impl Write + Send + 'static) -> Self {
        self.stdout = Box::new(out);
        self
    }

    /// Where captured `name: line` stderr is echoed.
    pub fn stderr_echo(mut self, out: impl Write + Send + 'static) -> Self {
        self.stderr_echo = Box::new(out);
        self
    }

    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// How long output may keep draining once every stage has exited.
    pub fn exit_grace(mut self, grace: Duration) -> Self {
        self.exit_grace = grace;
        self
    }

    /// Spawns every stage and supervises them until all have exited.
    pub fn run(self) -> Result<PipelineOutcome> {
        let started = Instant::now();
        let Supervisor { spec, stdout, stderr_echo, cancel, poll_interval, exit_grace } = self;
        if spec.stages.is_empty() {
            bail!("pipeline has no stages");
        }
        let (tx, events) = channel::unbounded();
        let mut run = RunningPipeline {
            stages: Vec::with_capacity(spec.stages.len()),
            events,
            open_stderr: 0,
            echo: stderr_echo,
            copier: None,
            failed: false,
            running: 0,
        };
        if let Err(e) = run.spawn_all(&spec, stdout, &tx) {
            run.terminate_all();
            return Err(e);
        }
        drop(tx);
        info!(stages = run.stages.len(), "Pipeline started");

        let cancelled = run.supervise(&cancel, poll_interval);
        run.drain_remaining_stderr(exit_grace);
        if !cancelled {
            run.finish_stdout(exit_grace);
        }

        let outcome = run.into_outcome(cancelled);
        let failed = outcome.stages.iter().filter(|s| s.verdict.is_failure()).count();
        info!(stages = outcome.stages.len(), failed, cancelled, wall_ms = started.elapsed().as_millis() as u64, "Pipeline complete");
        Ok(outcome)
    }
}

struct RunningPipeline {
    stages: Vec<Stage>,
    events: Receiver<StderrEvent>,
    open_stderr: usize,
    echo: Box<dyn Write + Send>,
    copier: Option<StdoutCopier>,
    failed: bool,
    running: usize,
}

impl RunningPipeline {
    fn spawn_all(&mut self, spec: &PipelineSpec, stdout: Box<dyn Write + Send>, tx: &Sender<StderrEvent>) -> Result<()> {
        let last = spec.stages.len() - 1;
        let mut stdout = Some(stdout);
        let mut upstream: Option<ChildStdout> = None;

        for (index, stage) in spec.stages.iter().enumerate() {
            let mut cmd = Command::new(&stage.program);
            cmd.args(&stage.args);
            if let Some(uid) = spec.uid {
                cmd.uid(uid);
            }
            if let Some(gid) = spec.gid {
                cmd.gid(gid);
            }
            // after a file sink the chain restarts from our own stdin
            cmd.stdin(match upstream.take() {
                Some(out) => Stdio::from(out),
                None => Stdio::inherit(),
            });
            match &stage.stdout_file {
                Some(path) => cmd.stdout(Stdio::from(open_output_file(path)?)),
                None => cmd.stdout(Stdio::piped()),
            };
            match &stage.stderr_file {
                Some(path) => cmd.stderr(Stdio::from(open_output_file(path)?)),
                None => cmd.stderr(Stdio::piped()),
            };

            let mut child = cmd.spawn().with_context(|| format!("spawn stage {} ({:?})", stage.name, stage.program))?;
            // closes our copies of the redirect files and the upstream read end
            drop(cmd);
            debug!(stage = %stage.name, pid = child.id(), "spawned pipeline stage");

            let stderr = child.stderr.take();
            let out = child.stdout.take();
            self.stages.push(Stage { spec: stage.clone(), child, finished: false, kill_sent: false, status: None, verdict: None });
            self.running += 1;

            if let Some(stderr) = stderr {
                spawn_stderr_reader(index, stderr, tx.clone())?;
                self.open_stderr += 1;
            }
            if let Some(out) = out {
                if index == last {
                    if let Some(sink) = stdout.take() {
                        self.copier = Some(spawn_stdout_copier(out, sink)?);
                    }
                } else {
                    upstream = Some(out);
                }
            }
        }
        Ok(())
    }

    /// Polls until every stage has exited. Returns whether the run was cancelled.
    fn supervise(&mut self, cancel: &CancelToken, poll_interval: Duration) -> bool {
        loop {
            if cancel.is_cancelled() {
                warn!("termination requested, killing pipeline");
                self.terminate_all();
                return true;
            }
            self.drain_stderr();

            for index in 0..self.stages.len() {
                if self.stages[index].finished {
                    continue;
                }
                if self.failed {
                    self.stages[index].kill();
                }
                match self.stages[index].child.try_wait() {
                    Ok(Some(status)) => self.on_exit(index, Some(status)),
                    Ok(None) => {}
                    Err(e) => {
                        error!(stage = %self.stages[index].spec.name, "wait: {}", e);
                        self.on_exit(index, None);
                    }
                }
            }

            if self.running == 0 {
                return false;
            }
            thread::sleep(poll_interval);
        }
    }

    fn on_exit(&mut self, index: usize, status: Option<ExitStatus>) {
        self.drain_stderr();
        let stage = &mut self.stages[index];
        let verdict = match status {
            Some(status) => judge(&stage.spec.program, &stage.spec.args, status),
            None => Verdict::Failure,
        };
        stage.finished = true;
        stage.status = status;
        stage.verdict = Some(verdict);
        self.running -= 1;

        match verdict {
            Verdict::Success => debug!(stage = %stage.spec.name, "stage finished"),
            Verdict::Tolerated => {
                warn!(stage = %stage.spec.name, status = ?status, "stage exited non-zero after its reader went away; tolerated")
            }
            Verdict::Failure if stage.kill_sent => debug!(stage = %stage.spec.name, "stage killed"),
            Verdict::Failure => {
                error!(stage = %stage.spec.name, status = ?status, "stage failed, tearing down pipeline");
                self.failed = true;
            }
        }
    }

    /// Kills and reaps every stage that is still running.
    fn terminate_all(&mut self) {
        for stage in self.stages.iter_mut().filter(|s| !s.finished) {
            stage.kill();
            let status = stage.child.wait().ok();
            stage.finished = true;
            stage.status = status;
            stage.verdict = Some(Verdict::Failure);
        }
        self.running = 0;
        self.failed = true;
    }

    fn drain_stderr(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event);
        }
    }

    /// Collects stderr still in flight after the last stage exited, bounded
    /// by `grace` in case a grandchild keeps a stderr pipe open.
    fn drain_remaining_stderr(&mut self, grace: Duration) {
        let deadline = Instant::now() + grace;
        while self.open_stderr > 0 {
            let timeout = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(timeout) {
                Ok(event) => self.handle_event(event),
                Err(RecvTimeoutError::Timeout) => {
                    debug!(open = self.open_stderr, "stderr still open after grace period");
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        let _ = self.echo.flush();
    }

    fn handle_event(&mut self, event: StderrEvent) {
        match event {
            StderrEvent::Line(index, line) => {
                let name = &self.stages[index].spec.name;
                let echoed = self
                    .echo
                    .write_all(name.as_bytes())
                    .and_then(|_| self.echo.write_all(b": "))
                    .and_then(|_| self.echo.write_all(&line[..content_len(&line)]))
                    .and_then(|_| self.echo.write_all(b"\n"));
                if let Err(e) = echoed {
                    debug!(stage = %name, "echo stderr: {}", e);
                }
            }
            StderrEvent::Closed(_) => self.open_stderr = self.open_stderr.saturating_sub(1),
        }
    }

    /// Waits for the last stage's output to be forwarded. A grandchild may
    /// hold the pipe open after every stage exited: once a whole `grace`
    /// passes without progress the copier is left behind.
    fn finish_stdout(&mut self, grace: Duration) {
        let Some(copier) = self.copier.take() else { return };
        let mut seen = copier.copied.load(Ordering::Relaxed);
        loop {
            match copier.done.recv_timeout(grace) {
                Ok(Ok(bytes)) => {
                    debug!(bytes, "pipeline output forwarded");
                    return;
                }
                Ok(Err(e)) => {
                    warn!("forward pipeline output: {}", e);
                    return;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    error!("pipeline output copier stopped without reporting");
                    return;
                }
                Err(RecvTimeoutError::Timeout) => {
                    let copied = copier.copied.load(Ordering::Relaxed);
                    if copied == seen {
                        warn!(bytes = copied, "pipeline output still open after every stage exited, detaching");
                        return;
                    }
                    seen = copied;
                }
            }
        }
    }

    fn into_outcome(self, cancelled: bool) -> PipelineOutcome {
        let stages = self
            .stages
            .into_iter()
            .map(|s| StageReport {
                name: s.spec.name,
                program: s.spec.program,
                status: s.status,
                verdict: s.verdict.unwrap_or(Verdict::Failure),
            })
            .collect();
        PipelineOutcome { stages, cancelled }
    }
}

fn spawn_stderr_reader(index: usize, stderr: ChildStderr, tx: Sender<StderrEvent>) -> Result<()> {
    thread::Builder::new()
        .name(format!("cmr-pipe-stderr-{}", index))
        .spawn(move || {
            let mut reader = BufReader::new(stderr);
            let mut line = Vec::new();
            loop {
                match reader.read_until(b'\n', &mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        if tx.send(StderrEvent::Line(index, std::mem::take(&mut line))).is_err() {
                            return;
                        }
                    }
                }
            }
            let _ = tx.send(StderrEvent::Closed(index));
        })
        .context("spawn stderr reader thread")?;
    Ok(())
}

struct StdoutCopier {
    done: Receiver<io::Result<u64>>,
    copied: Arc<AtomicU64>,
}

fn spawn_stdout_copier(mut out: ChildStdout, mut sink: Box<dyn Write + Send>) -> Result<StdoutCopier> {
    let (done_tx, done) = channel::bounded(1);
    let copied = Arc::new(AtomicU64::new(0));
    let progress = Arc::clone(&copied);
    thread::Builder::new()
        .name("cmr-pipe-stdout".into())
        .spawn(move || {
            let _ = done_tx.send(copy_counted(&mut out, &mut sink, &progress));
        })
        .context("spawn stdout copier thread")?;
    Ok(StdoutCopier { done, copied })
}

fn copy_counted(out: &mut ChildStdout, sink: &mut Box<dyn Write + Send>, progress: &AtomicU64) -> io::Result<u64> {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let rd = match out.read(&mut buf) {
            Ok(0) => break,
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        sink.write_all(&buf[..rd])?;
        progress.fetch_add(rd as u64, Ordering::Relaxed);
    }
    sink.flush()?;
    Ok(progress.load(Ordering::Relaxed))
}
