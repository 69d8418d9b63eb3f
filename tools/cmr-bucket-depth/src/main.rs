use anyhow::Result;
use clap::Parser;
use cmr::cli::{parse_or_exit, BucketArgs};
use cmr::constants::DEFAULT_GROUP_DELIMITER;
use cmr::{Delimiters, KeyStrategy, Partitioner};
use std::io;
use tracing::error;

/// Depth-aware partitioner: like cmr-bucket, with multi-field keys and a depth
/// component in the partition file names.
#[derive(Parser, Debug)]
#[command(name = "cmr-bucket-depth", version, about)]
struct Args {
    #[command(flatten)]
    bucket: BucketArgs,
    /// Adds `-{depth}` to partition file names
    #[arg(short = 'D', long)]
    depth: Option<u64>,
    /// Key is the first N fields
    #[arg(short = 'k', long, value_parser = clap::value_parser!(u64).range(1..))]
    num_key_fields: Option<u64>,
    /// Key is everything but the last N fields
    #[arg(short = 'a', long, conflicts_with = "num_key_fields")]
    num_aggregates: Option<u64>,
}

fn main() -> Result<()> {
    let args: Args = parse_or_exit();
    cmr::logging::init("info");

    let strategy = KeyStrategy::from_flags(
        args.bucket.join,
        args.bucket.strip_joinkey,
        args.num_aggregates.map(|n| n as usize),
        args.num_key_fields.map(|n| n as usize),
    )?;
    let delimiters = Delimiters { field: args.bucket.delimiter, group: DEFAULT_GROUP_DELIMITER };
    let config = args.bucket.config(strategy, delimiters, args.depth);

    let stats = Partitioner::new(config)?.run(io::stdin().lock())?;
    if stats.failed_children > 0 {
        error!(failed = stats.failed_children, "partition filters failed");
        std::process::exit(1);
    }
    Ok(())
}
