use anyhow::{Context, Result};
use clap::Parser;
use cmr::cli::parse_or_exit;
use cmr::constants::{DEFAULT_MERGE_BUFFER_BYTES, ENV_MERGE_BUFFER_BYTES};
use cmr::io::expand_globs;
use cmr::merge_paths;
use cmr::utils::{delimiter_value, env_or};
use std::io::{self, BufWriter, Write};
use tracing::info;

/// Merges key-sorted files into one stream on stdout, keeping equal keys together.
#[derive(Parser, Debug)]
#[command(name = "cmr-merge", version, about)]
struct Args {
    /// Key delimiter: a literal byte or an escape such as \t or \x02
    #[arg(short = 'x', long, value_parser = delimiter_value, default_value = "\\x02")]
    delimiter: u8,
    /// Input file globs, read in the order given
    #[arg(required = true)]
    globs: Vec<String>,
}

fn main() -> Result<()> {
    let args: Args = parse_or_exit();
    cmr::logging::init("info");

    let paths = expand_globs(&args.globs);
    if paths.is_empty() {
        info!(globs = ?args.globs, "no input files matched");
        return Ok(());
    }

    let buffer_bytes = env_or(ENV_MERGE_BUFFER_BYTES, DEFAULT_MERGE_BUFFER_BYTES);
    let stdout = io::stdout();
    let mut out = BufWriter::with_capacity(buffer_bytes, stdout.lock());
    merge_paths(&paths, args.delimiter, buffer_bytes, &mut out)?;
    out.flush().context("flush merged output")?;
    Ok(())
}
