//! Command-line pieces shared by the tool binaries.

use crate::bucket::BucketConfig;
use crate::constants::{DEFAULT_DESTINATION, DEFAULT_PREFIX};
use crate::keys::{Delimiters, KeyStrategy};
use crate::utils::delimiter_value;
use clap::{Args, Parser};
use std::path::PathBuf;

/// Parses the process arguments. Usage errors exit with status 1;
/// `--help` and `--version` exit 0.
pub fn parse_or_exit<T: Parser>() -> T {
    match T::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            std::process::exit(if err.use_stderr() { 1 } else { 0 })
        }
    }
}

/// Options common to both bucket tools.
#[derive(Args, Debug, Clone)]
pub struct BucketArgs {
    /// Directory the partition files are written to
    #[arg(short = 'd', long, default_value = DEFAULT_DESTINATION)]
    pub destination: PathBuf,
    /// Field delimiter: a literal byte or an escape such as \t or \x01
    #[arg(short = 'x', long, value_parser = delimiter_value, default_value = "\\x01")]
    pub delimiter: u8,
    /// Partition file name prefix
    #[arg(short = 'p', long, default_value = DEFAULT_PREFIX)]
    pub prefix: String,
    #[arg(short = 'n', long, value_parser = clap::value_parser!(u64).range(1..))]
    pub num_partitions: u64,
    #[arg(short = 'm', long)]
    pub map_id: u64,
    /// Sort every partition before it is written
    #[arg(short = 'S', long)]
    pub sort: bool,
    /// Drop the leading join key, hash on the field after it
    #[arg(short = 's', long, conflicts_with = "join")]
    pub strip_joinkey: bool,
    /// Hash on the join key in front of the group delimiter
    #[arg(short = 'j', long)]
    pub join: bool,
}

impl BucketArgs {
    pub fn config(&self, strategy: KeyStrategy, delimiters: Delimiters, depth: Option<u64>) -> BucketConfig {
        let mut config = BucketConfig::new(&self.destination, self.num_partitions as usize, self.map_id);
        config.prefix = self.prefix.clone();
        config.depth = depth;
        config.strategy = strategy;
        config.delimiters = delimiters;
        config.sort = self.sort;
        config
    }
}
