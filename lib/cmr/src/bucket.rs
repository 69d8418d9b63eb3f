//! Partitioner/Spawner: routes records into one lazily spawned process
//! pipeline per partition.
//!
//! Every partition gets `[sort] | chunky > {destination}/{prefix}-{map}[-{depth}]-{id}`.
//! The partitioner keeps only the write end feeding the first stage; everything
//! else is handed to the children and closed here right after the spawn.

use crate::constants::{
    DEFAULT_CHUNKY_BIN, DEFAULT_CHUNKY_SIZE_MB, DEFAULT_FIELD_DELIMITER, DEFAULT_PARTITION_BUFFER_BYTES, DEFAULT_PREFIX,
    DEFAULT_SORT_BIN, DEFAULT_SORT_BUFFER, ENV_CHUNKY_BIN, ENV_CHUNKY_SIZE_MB, ENV_PARTITION_BUFFER_BYTES, ENV_SORT_BIN,
    ENV_SORT_BUFFER,
};
use crate::io::{ensure_dir, open_file_limit, open_output_file, read_record};
use crate::keys::{extract_key, Delimiters, KeyStrategy};
use crate::partition::{partition_path, HashRange};
use crate::stats::BucketStats;
use crate::utils::{env_or, env_string_or};
use anyhow::{bail, Context, Result};
use std::io::{BufRead, BufWriter, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// An opaque filter process: reads stdin, writes stdout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilterCommand {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
}

impl FilterCommand {
    pub fn new<S: Into<String>>(program: impl Into<String>, args: impl IntoIterator<Item = S>) -> Self {
        Self { program: program.into(), args: args.into_iter().map(Into::into).collect(), envs: Vec::new() }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// `chunky -s <MiB>`, overridable through `CMR_CHUNKY_BIN` / `CMR_CHUNKY_SIZE_MB`.
    pub fn chunky_from_env() -> Self {
        let bin = env_string_or(ENV_CHUNKY_BIN, DEFAULT_CHUNKY_BIN);
        let size = env_string_or(ENV_CHUNKY_SIZE_MB, DEFAULT_CHUNKY_SIZE_MB);
        Self::new(bin, ["-s".to_string(), size])
    }

    /// `sort --buffer-size=<hint>` in the C locale, so partitions come out in
    /// plain byte order.
    pub fn sort_from_env() -> Self {
        let bin = env_string_or(ENV_SORT_BIN, DEFAULT_SORT_BIN);
        let buffer = env_string_or(ENV_SORT_BUFFER, DEFAULT_SORT_BUFFER);
        Self::new(bin, [format!("--buffer-size={}", buffer)]).with_env("LC_ALL", "C")
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        cmd
    }
}

#[derive(Clone, Debug)]
pub struct BucketConfig {
    pub destination: PathBuf,
    pub prefix: String,
    pub map_id: u64,
    /// Adds a `-{depth}` component to partition file names.
    pub depth: Option<u64>,
    pub num_partitions: usize,
    pub strategy: KeyStrategy,
    pub delimiters: Delimiters,
    /// Put a sort filter in front of the output filter.
    pub sort: bool,
    pub sort_filter: FilterCommand,
    pub output_filter: FilterCommand,
    pub write_buffer_bytes: usize,
}

impl BucketConfig {
    pub fn new(destination: impl Into<PathBuf>, num_partitions: usize, map_id: u64) -> Self {
        Self {
            destination: destination.into(),
            prefix: DEFAULT_PREFIX.to_string(),
            map_id,
            depth: None,
            num_partitions,
            strategy: KeyStrategy::FirstField,
            delimiters: Delimiters::uniform(DEFAULT_FIELD_DELIMITER),
            sort: false,
            sort_filter: FilterCommand::sort_from_env(),
            output_filter: FilterCommand::chunky_from_env(),
            write_buffer_bytes: env_or(ENV_PARTITION_BUFFER_BYTES, DEFAULT_PARTITION_BUFFER_BYTES),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_partitions == 0 {
            bail!("number of partitions must be at least 1");
        }
        if self.prefix.contains('/') {
            bail!("prefix {:?} must not contain a path separator", self.prefix);
        }
        if let KeyStrategy::NumKeyFields(0) = self.strategy {
            bail!("number of key fields must be at least 1");
        }
        Ok(())
    }
}

struct PartitionPipeline {
    writer: BufWriter<ChildStdin>,
    path: PathBuf,
}

struct SpawnedChild {
    partition: usize,
    program: String,
    child: Child,
}

pub struct Partitioner {
    config: BucketConfig,
    range: HashRange,
    pipelines: Vec<Option<PartitionPipeline>>,
    /// In spawn order; reaped in the same order.
    children: Vec<SpawnedChild>,
    stats: BucketStats,
    started: Instant,
}

impl Partitioner {
    pub fn new(config: BucketConfig) -> Result<Self> {
        config.validate()?;
        ensure_dir(&config.destination)?;
        let fd_limit = open_file_limit();
        info!(
            destination = %config.destination.display(), map_id = config.map_id, num_partitions = config.num_partitions,
            strategy = ?config.strategy, sort = config.sort, open_file_limit = fd_limit.unwrap_or(0),
            "Bucket starting"
        );
        if let Some(limit) = fd_limit {
            // one retained write end per partition, plus stdio and transient spawn pipes
            if config.num_partitions as u64 + 16 > limit {
                warn!(num_partitions = config.num_partitions, open_file_limit = limit, "partition count may exceed the open file limit");
            }
        }
        let range = HashRange::new(config.num_partitions);
        let pipelines = (0..config.num_partitions).map(|_| None).collect();
        Ok(Self { config, range, pipelines, children: Vec::new(), stats: BucketStats::default(), started: Instant::now() })
    }

    /// Routes all of `reader`, then closes and reaps every partition pipeline.
    /// On a routing error the pipelines are still closed and reaped before
    /// the error is returned.
    pub fn run<R: BufRead>(mut self, reader: R) -> Result<BucketStats> {
        match self.consume(reader) {
            Ok(()) => self.finish(),
            Err(e) => {
                error!("routing failed, closing partitions: {:#}", e);
                if let Err(close_err) = self.finish() {
                    warn!("closing partitions after routing failure: {:#}", close_err);
                }
                Err(e)
            }
        }
    }

    /// Routes every record of `reader` until end of input.
    pub fn consume<R: BufRead>(&mut self, mut reader: R) -> Result<()> {
        let mut record = Vec::with_capacity(64 * 1024);
        loop {
            let rd = read_record(&mut reader, &mut record).context("read input record")?;
            if rd == 0 {
                break;
            }
            self.route(&record)?;
        }
        Ok(())
    }

    /// Writes one record into its partition. Returns `false` when the record
    /// lacks the delimiters its key needs and was dropped.
    pub fn route(&mut self, record: &[u8]) -> Result<bool> {
        self.stats.lines_in += 1;
        let span = match extract_key(record, self.config.strategy, self.config.delimiters) {
            Some(span) => span,
            None => {
                self.stats.lines_dropped += 1;
                return Ok(false);
            }
        };
        let partition = self.range.partition_of(&record[span.key]);
        let payload = &record[span.payload_start..];

        if self.pipelines[partition].is_none() {
            let pipeline = self.spawn_pipeline(partition)?;
            self.pipelines[partition] = Some(pipeline);
            self.stats.partitions += 1;
        }
        let pipeline = self.pipelines[partition].as_mut().context("partition pipeline missing")?;
        pipeline
            .writer
            .write_all(payload)
            .with_context(|| format!("write to partition {} ({})", partition, pipeline.path.display()))?;
        self.stats.bytes_out += payload.len() as u64;
        Ok(true)
    }

    fn spawn_pipeline(&mut self, partition: usize) -> Result<PartitionPipeline> {
        let cfg = &self.config;
        let path = partition_path(&cfg.destination, &cfg.prefix, cfg.map_id, cfg.depth, partition);
        let out = open_output_file(&path)?;

        // std creates every pipe and file with O_CLOEXEC, so the write end kept
        // below is never inherited by pipelines spawned for later partitions.
        let mut output_cmd = cfg.output_filter.command();
        output_cmd.stdout(Stdio::from(out));

        let stdin = if cfg.sort {
            let mut sort_cmd = cfg.sort_filter.command();
            sort_cmd.stdin(Stdio::piped()).stdout(Stdio::piped());
            let mut sort_child = sort_cmd
                .spawn()
                .with_context(|| format!("spawn sort filter {:?} for partition {}", cfg.sort_filter.program, partition))?;
            let sort_in = sort_child.stdin.take().context("sort filter stdin")?;
            let sort_out = sort_child.stdout.take().context("sort filter stdout")?;
            self.children.push(SpawnedChild { partition, program: cfg.sort_filter.program.clone(), child: sort_child });

            output_cmd.stdin(Stdio::from(sort_out));
            let output_child = output_cmd
                .spawn()
                .with_context(|| format!("spawn output filter {:?} for partition {}", cfg.output_filter.program, partition))?;
            self.children.push(SpawnedChild { partition, program: cfg.output_filter.program.clone(), child: output_child });
            sort_in
        } else {
            output_cmd.stdin(Stdio::piped());
            let mut output_child = output_cmd
                .spawn()
                .with_context(|| format!("spawn output filter {:?} for partition {}", cfg.output_filter.program, partition))?;
            let output_in = output_child.stdin.take().context("output filter stdin")?;
            self.children.push(SpawnedChild { partition, program: cfg.output_filter.program.clone(), child: output_child });
            output_in
        };
        // `output_cmd` drops here, closing the parent's copies of the file and
        // of the sort -> output pipe.
        drop(output_cmd);

        debug!(partition, path = %path.display(), "spawned partition pipeline");
        Ok(PartitionPipeline { writer: BufWriter::with_capacity(self.config.write_buffer_bytes, stdin), path })
    }

    /// Closes every partition's write end, then waits for every child in spawn
    /// order.
    pub fn finish(self) -> Result<BucketStats> {
        let Partitioner { pipelines, children, mut stats, started, .. } = self;

        let mut first_err = None;
        for (partition, slot) in pipelines.into_iter().enumerate() {
            let Some(pipeline) = slot else { continue };
            let path = pipeline.path;
            // into_inner flushes; dropping the ChildStdin signals EOF downstream
            if let Err(e) = pipeline.writer.into_inner() {
                error!(partition, path = %path.display(), "flush partition: {}", e.error());
                first_err.get_or_insert_with(|| anyhow::anyhow!("flush partition {} ({}): {}", partition, path.display(), e.error()));
            }
        }

        stats.children = children.len();
        for mut spawned in children {
            match spawned.child.wait() {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    warn!(partition = spawned.partition, program = %spawned.program, %status, "partition filter failed");
                    stats.failed_children += 1;
                }
                Err(e) => {
                    warn!(partition = spawned.partition, program = %spawned.program, "wait for partition filter: {}", e);
                    stats.failed_children += 1;
                }
            }
        }

        stats.finish(started.elapsed());
        stats.log();
        match first_err {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::hash_key;
    use std::fs;
    use std::io::Cursor;
    use std::path::Path;

    fn test_config(dest: &Path, num_partitions: usize) -> BucketConfig {
        let mut cfg = BucketConfig::new(dest, num_partitions, 7);
        cfg.output_filter = FilterCommand::new("cat", Vec::<String>::new());
        cfg.sort_filter = FilterCommand::new("sort", ["--buffer-size=1M"]).with_env("LC_ALL", "C");
        cfg
    }

    fn run(cfg: BucketConfig, input: &[u8]) -> BucketStats {
        let mut partitioner = Partitioner::new(cfg).unwrap();
        partitioner.consume(Cursor::new(input.to_vec())).unwrap();
        partitioner.finish().unwrap()
    }

    fn read_partitions(dest: &Path) -> Vec<(String, Vec<u8>)> {
        let mut files: Vec<_> = fs::read_dir(dest)
            .unwrap()
            .map(|e| e.unwrap().path())
            .map(|p| (p.file_name().unwrap().to_string_lossy().into_owned(), fs::read(&p).unwrap()))
            .collect();
        files.sort();
        files
    }

    fn lines(bytes: &[u8]) -> Vec<Vec<u8>> {
        bytes.split_inclusive(|b| *b == b'\n').map(|l| l.to_vec()).collect()
    }

    #[test]
    fn strip_joinkey_forwards_only_the_remainder() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path(), 4);
        cfg.strategy = KeyStrategy::StripJoinKey;
        cfg.delimiters = Delimiters { field: 0x01, group: 0x02 };
        let stats = run(cfg, b"G\x02K\x01V\n");

        let expected = HashRange::new(4).partition_of(b"K");
        let files = read_partitions(dir.path());
        assert_eq!(files, vec![(format!("part-7-{}", expected), b"K\x01V\n".to_vec())]);
        assert_eq!(stats.lines_in, 1);
        assert_eq!(stats.bytes_out, 4);
        assert_eq!(stats.children, 1);
    }

    #[test]
    fn every_record_lands_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut input = Vec::new();
        for i in 0..300 {
            input.extend_from_slice(format!("k{}\x01v{}\n", i % 17, i).as_bytes());
        }
        input.extend_from_slice(b"no delimiter here\n");
        let stats = run(test_config(dir.path(), 5), &input);

        assert_eq!(stats.lines_in, 301);
        assert_eq!(stats.lines_dropped, 1);
        assert_eq!(stats.failed_children, 0);

        let range = HashRange::new(5);
        let mut seen = Vec::new();
        for (name, contents) in read_partitions(dir.path()) {
            let partition: usize = name.rsplit('-').next().unwrap().parse().unwrap();
            for line in lines(&contents) {
                let key_end = line.iter().position(|b| *b == 0x01).unwrap();
                assert_eq!(range.partition_of(&line[..key_end]), partition);
                seen.push(line);
            }
        }
        let mut expected = lines(&input);
        expected.pop();
        // cat keeps arrival order within a partition
        let per_key = |key: &[u8], all: &[Vec<u8>]| all.iter().filter(|l| l.starts_with(key)).cloned().collect::<Vec<_>>();
        assert_eq!(per_key(b"k3\x01", &seen), per_key(b"k3\x01", &expected));
        seen.sort();
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[test]
    fn sort_stage_orders_each_partition() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path(), 3);
        cfg.sort = true;
        let input = b"c\x011\nb\x012\na\x013\nc\x014\nb\x015\n";
        let stats = run(cfg, input);
        assert_eq!(stats.children, stats.partitions * 2);

        let mut total = 0;
        for (_, contents) in read_partitions(dir.path()) {
            let got = lines(&contents);
            let mut sorted = got.clone();
            sorted.sort();
            assert_eq!(got, sorted);
            total += got.len();
        }
        assert_eq!(total, 5);
    }

    #[test]
    fn depth_and_prefix_shape_file_names() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path(), 1);
        cfg.prefix = "bucket".into();
        cfg.depth = Some(2);
        run(cfg, b"k\x01v\n");
        let files = read_partitions(dir.path());
        assert_eq!(files[0].0, "bucket-7-2-0");
    }

    #[test]
    fn child_failures_are_counted_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path(), 1);
        cfg.output_filter = FilterCommand::new("sh", ["-c", "cat >/dev/null; exit 3"]);
        let stats = run(cfg, b"k\x01v\nk2\x01v\n");
        assert_eq!(stats.children, 1);
        assert_eq!(stats.failed_children, 1);
    }

    #[test]
    fn empty_input_spawns_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let stats = run(test_config(dir.path(), 8), b"");
        assert_eq!(stats.children, 0);
        assert!(read_partitions(dir.path()).is_empty());
    }

    #[test]
    fn dead_filter_fails_the_run_but_other_partitions_are_closed() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path(), 2);
        // forwards one line, then stops reading
        cfg.output_filter = FilterCommand::new("sh", ["-c", "read -r line; echo \"$line\""]);

        let range = HashRange::new(2);
        let key_in = |p: usize| (0..).map(|i| format!("k{}", i)).find(|k| range.partition_of(k.as_bytes()) == p).unwrap();
        let (quiet, noisy) = (key_in(0), key_in(1));

        let mut input = format!("{}\x01only\n", quiet).into_bytes();
        for i in 0..100_000 {
            input.extend_from_slice(format!("{}\x01{}\n", noisy, i).as_bytes());
        }
        let err = Partitioner::new(cfg).unwrap().run(Cursor::new(input)).unwrap_err();
        assert!(format!("{:#}", err).contains("partition 1"), "{:#}", err);

        // the buffered record of the healthy partition was flushed and its filter reaped
        let quiet_file = partition_path(dir.path(), "part", 7, None, 0);
        assert_eq!(fs::read_to_string(quiet_file).unwrap(), format!("{}\x01only\n", quiet));
    }

    #[test]
    fn zero_partitions_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Partitioner::new(test_config(dir.path(), 0)).is_err());
    }

    #[test]
    fn missing_filter_binary_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path(), 2);
        cfg.output_filter = FilterCommand::new("/nonexistent/cmr-filter", Vec::<String>::new());
        let mut partitioner = Partitioner::new(cfg).unwrap();
        assert!(partitioner.route(b"k\x01v\n").is_err());
    }

    #[test]
    fn same_key_same_partition_across_runs() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        run(test_config(a.path(), 16), b"stable-key\x01one\n");
        run(test_config(b.path(), 16), b"stable-key\x01two\n");
        assert_eq!(read_partitions(a.path())[0].0, read_partitions(b.path())[0].0);
        let expected = HashRange::new(16).partition_of_hash(hash_key(b"stable-key"));
        assert_eq!(read_partitions(a.path())[0].0, format!("part-7-{}", expected));
    }
}
