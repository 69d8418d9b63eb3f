//! Tunables shared by the cmr tools: `CMR_*` overrides and their fallbacks.

// Overrides read from the environment
pub const ENV_CHUNKY_BIN: &str = "CMR_CHUNKY_BIN";
pub const ENV_CHUNKY_SIZE_MB: &str = "CMR_CHUNKY_SIZE_MB";
pub const ENV_SORT_BIN: &str = "CMR_SORT_BIN";
pub const ENV_SORT_BUFFER: &str = "CMR_SORT_BUFFER";
pub const ENV_PARTITION_BUFFER_BYTES: &str = "CMR_PARTITION_BUFFER_BYTES";
pub const ENV_MERGE_BUFFER_BYTES: &str = "CMR_MERGE_BUFFER_BYTES";
pub const ENV_PIPE_POLL_MS: &str = "CMR_PIPE_POLL_MS";

// Delimiters
pub const DEFAULT_FIELD_DELIMITER: u8 = 0x01;
pub const DEFAULT_GROUP_DELIMITER: u8 = 0x02;
/// Merge splits the key off at the group delimiter unless told otherwise.
pub const DEFAULT_MERGE_DELIMITER: u8 = DEFAULT_GROUP_DELIMITER;

// Partitioner
pub const DEFAULT_DESTINATION: &str = ".";
pub const DEFAULT_PREFIX: &str = "part";
pub const DEFAULT_CHUNKY_BIN: &str = "chunky";
pub const DEFAULT_CHUNKY_SIZE_MB: &str = "4";
pub const DEFAULT_SORT_BIN: &str = "sort";
pub const DEFAULT_SORT_BUFFER: &str = "16M";
pub const DEFAULT_PARTITION_BUFFER_BYTES: usize = 64 * 1024;
/// rwxr-xr-x, the mode partition and redirect files are created with.
pub const OUTPUT_FILE_MODE: u32 = 0o755;

// Merge
pub const DEFAULT_MERGE_BUFFER_BYTES: usize = 64 * 1024;

// Supervisor
pub const DEFAULT_PIPE_POLL_MS: u64 = 10;
pub const PIPE_STAGE_SEPARATOR: &str = ":";
pub const PIPE_CTL_UID: &str = "--CMR_PIPE_UID";
pub const PIPE_CTL_GID: &str = "--CMR_PIPE_GID";
pub const PIPE_CTL_NAME: &str = "--CMR_NAME";
pub const PIPE_CTL_OUT: &str = "--CMR_PIPE_OUT";
pub const PIPE_CTL_ERR: &str = "--CMR_PIPE_ERR";
/// How long stage output may keep draining once every stage has exited.
pub const EXIT_GRACE_MS: u64 = 200;

// Re-chunking filter
/// Once less than this much buffer space is left, chunky writes what it holds.
pub const CHUNKY_MIN_AVAIL_BYTES: usize = 1024 * 1024;
