pub mod bucket;
pub mod chunky;
pub mod cli;
pub mod constants;
pub mod io;
pub mod keys;
pub mod logging;
pub mod merge;
pub mod partition;
pub mod pipe;
pub mod stats;
pub mod utils;

pub use bucket::{BucketConfig, FilterCommand, Partitioner};
pub use keys::{Delimiters, KeyStrategy};
pub use merge::{merge_paths, KWayMerge};
pub use stats::{BucketStats, MergeStats};
