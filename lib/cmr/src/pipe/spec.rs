//! Parsing of the flattened `cmr-pipe` argument list into process specs.
//!
//! ```text
//! [--CMR_PIPE_UID <uid>] [--CMR_PIPE_GID <gid>] <stage> [: <stage> ...]
//! <stage> := [--CMR_NAME <name>] [--CMR_PIPE_OUT <path>] [--CMR_PIPE_ERR <path>] <command> [args...]
//! ```

use crate::constants::{PIPE_CTL_ERR, PIPE_CTL_GID, PIPE_CTL_NAME, PIPE_CTL_OUT, PIPE_CTL_UID, PIPE_STAGE_SEPARATOR};
use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

/// One stage of a pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcSpec {
    /// Prefix for this stage's captured stderr lines.
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    /// Send stdout here instead of into the next stage.
    pub stdout_file: Option<PathBuf>,
    /// Send stderr here instead of capturing it.
    pub stderr_file: Option<PathBuf>,
}

impl ProcSpec {
    pub fn new<S: Into<String>>(program: impl Into<String>, args: impl IntoIterator<Item = S>) -> Self {
        let program = program.into();
        Self { name: program.clone(), program, args: args.into_iter().map(Into::into).collect(), stdout_file: None, stderr_file: None }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn stdout_to(mut self, path: impl AsRef<Path>) -> Self {
        self.stdout_file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn stderr_to(mut self, path: impl AsRef<Path>) -> Self {
        self.stderr_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// A stage with a file sink does not feed the next stage.
    pub fn is_sink(&self) -> bool {
        self.stdout_file.is_some()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineSpec {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub stages: Vec<ProcSpec>,
}

impl PipelineSpec {
    pub fn new(stages: Vec<ProcSpec>) -> Self {
        Self { uid: None, gid: None, stages }
    }
}

fn take_value<I: Iterator<Item = String>>(args: &mut I, control: &str) -> Result<String> {
    args.next().with_context(|| format!("{} needs a value", control))
}

fn parse_id(value: &str, control: &str) -> Result<u32> {
    value.parse::<u32>().with_context(|| format!("{} expects a numeric id, got {:?}", control, value))
}

#[derive(Default)]
struct StageBuilder {
    name: Option<String>,
    argv: Vec<String>,
    stdout_file: Option<PathBuf>,
    stderr_file: Option<PathBuf>,
}

impl StageBuilder {
    fn build(self, index: usize) -> Result<ProcSpec> {
        let mut argv = self.argv.into_iter();
        let program = match argv.next() {
            Some(program) => program,
            None => bail!("pipeline stage {} has no command", index),
        };
        Ok(ProcSpec {
            name: self.name.unwrap_or_else(|| program.clone()),
            program,
            args: argv.collect(),
            stdout_file: self.stdout_file,
            stderr_file: self.stderr_file,
        })
    }
}

/// Splits the argument list (program name excluded) into stages.
pub fn parse_pipeline<I>(args: I) -> Result<PipelineSpec>
where
    I: IntoIterator,
    I::Item: Into<String>,
{
    let mut args = args.into_iter().map(Into::into).peekable();
    let mut spec = PipelineSpec::default();

    // uid/gid may only lead the argument list
    loop {
        match args.peek().map(String::as_str) {
            Some(PIPE_CTL_UID) => {
                args.next();
                spec.uid = Some(parse_id(&take_value(&mut args, PIPE_CTL_UID)?, PIPE_CTL_UID)?);
            }
            Some(PIPE_CTL_GID) => {
                args.next();
                spec.gid = Some(parse_id(&take_value(&mut args, PIPE_CTL_GID)?, PIPE_CTL_GID)?);
            }
            _ => break,
        }
    }

    let mut stage = StageBuilder::default();
    let mut saw_any = false;
    while let Some(arg) = args.next() {
        saw_any = true;
        match arg.as_str() {
            PIPE_STAGE_SEPARATOR => {
                let index = spec.stages.len();
                spec.stages.push(std::mem::take(&mut stage).build(index)?);
            }
            PIPE_CTL_NAME => stage.name = Some(take_value(&mut args, PIPE_CTL_NAME)?),
            PIPE_CTL_OUT => stage.stdout_file = Some(PathBuf::from(take_value(&mut args, PIPE_CTL_OUT)?)),
            PIPE_CTL_ERR => stage.stderr_file = Some(PathBuf::from(take_value(&mut args, PIPE_CTL_ERR)?)),
            _ => stage.argv.push(arg),
        }
    }
    if !saw_any {
        bail!("no pipeline stages given");
    }
    let index = spec.stages.len();
    spec.stages.push(stage.build(index)?);
    Ok(spec)
}
