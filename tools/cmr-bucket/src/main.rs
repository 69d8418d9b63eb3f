use anyhow::Result;
use clap::Parser;
use cmr::cli::{parse_or_exit, BucketArgs};
use cmr::{Delimiters, KeyStrategy, Partitioner};
use std::io;
use tracing::error;

/// Hash-partitions records from stdin into one `[sort |] chunky > file`
/// pipeline per partition.
#[derive(Parser, Debug)]
#[command(name = "cmr-bucket", version, about)]
struct Args {
    #[command(flatten)]
    bucket: BucketArgs,
}

fn main() -> Result<()> {
    let args: Args = parse_or_exit();
    cmr::logging::init("info");

    let strategy = KeyStrategy::from_flags(args.bucket.join, args.bucket.strip_joinkey, None, None)?;
    let config = args.bucket.config(strategy, Delimiters::uniform(args.bucket.delimiter), None);

    let stats = Partitioner::new(config)?.run(io::stdin().lock())?;
    if stats.failed_children > 0 {
        error!(failed = stats.failed_children, "partition filters failed");
        std::process::exit(1);
    }
    Ok(())
}
