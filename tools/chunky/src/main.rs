use anyhow::{Context, Result};
use clap::Parser;
use cmr::chunky::{chunk_bytes_from_mb, rechunk_files, rechunk_stream};
use cmr::cli::parse_or_exit;
use cmr::io::expand_globs;
use std::fs::File;
use std::io;
use std::os::fd::AsFd;
use tracing::debug;

/// Copies stdin (or the given files) to stdout in large writes.
#[derive(Parser, Debug)]
#[command(name = "chunky", version, about)]
struct Args {
    /// Chunk size in MiB
    #[arg(short = 's', long = "size", value_parser = clap::value_parser!(i64).range(1..))]
    size_mb: i64,
    /// Files to concatenate instead of reading stdin
    globs: Vec<String>,
}

fn main() -> Result<()> {
    let args: Args = parse_or_exit();
    cmr::logging::init("warn");
    let chunk_bytes = chunk_bytes_from_mb(args.size_mb)?;

    // raw descriptor: the line buffering of io::Stdout would split chunks
    let out = File::from(io::stdout().as_fd().try_clone_to_owned().context("duplicate stdout")?);
    let stats = if args.globs.is_empty() {
        rechunk_stream(io::stdin().lock(), chunk_bytes, out)?
    } else {
        rechunk_files(&expand_globs(&args.globs), chunk_bytes, out)?
    };
    debug!(inputs = stats.inputs, bytes = stats.bytes, writes = stats.writes, "chunky done");
    Ok(())
}
