use std::time::Duration;
use tracing::info;

/// Counters for one Partitioner run.
#[derive(Default, Clone, Debug)]
pub struct BucketStats {
    pub lines_in: u64,
    pub lines_dropped: u64,
    pub bytes_out: u64,
    pub partitions: usize,
    pub children: usize,
    pub failed_children: usize,
    pub wall_ms: u64,
}

impl BucketStats {
    pub fn finish(&mut self, wall: Duration) {
        self.wall_ms = wall.as_millis() as u64;
    }

    pub fn log(&self) {
        info!(phase = "bucket",
              lines_in = self.lines_in, lines_dropped = self.lines_dropped, bytes_out = self.bytes_out,
              partitions = self.partitions, children = self.children, failed_children = self.failed_children,
              wall_ms = self.wall_ms,
              "Bucket phase complete");
    }
}

/// Counters for one Merge run.
#[derive(Default, Clone, Debug)]
pub struct MergeStats {
    pub sources: usize,
    pub lines_out: u64,
    pub groups: u64,
    pub bytes_out: u64,
    pub wall_ms: u64,
}

impl MergeStats {
    pub fn finish(&mut self, wall: Duration) {
        self.wall_ms = wall.as_millis() as u64;
    }

    pub fn log(&self) {
        info!(phase = "merge",
              sources = self.sources, lines_out = self.lines_out, groups = self.groups, bytes_out = self.bytes_out,
              wall_ms = self.wall_ms,
              "Merge complete");
    }
}
