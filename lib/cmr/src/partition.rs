//! 128-bit hash-range partitioning.

use std::path::{Path, PathBuf};
use xxhash_rust::xxh3::xxh3_128_with_seed;

pub const HASH_SEED: u64 = 0;

pub fn hash_key(key: &[u8]) -> u128 {
    xxh3_128_with_seed(key, HASH_SEED)
}

/// Splits the full `u128` range into `num_partitions` equal-width buckets.
#[derive(Clone, Copy, Debug)]
pub struct HashRange {
    num_partitions: usize,
    bucket_width: u128,
}

impl HashRange {
    pub fn new(num_partitions: usize) -> Self {
        let num_partitions = num_partitions.max(1);
        Self { num_partitions, bucket_width: u128::MAX / num_partitions as u128 }
    }

    pub fn partition_of_hash(&self, hash: u128) -> usize {
        // the last bucket absorbs the division remainder
        ((hash / self.bucket_width) as usize).min(self.num_partitions - 1)
    }

    pub fn partition_of(&self, key: &[u8]) -> usize {
        self.partition_of_hash(hash_key(key))
    }
}

/// `{destination}/{prefix}-{map_id}[-{depth}]-{partition}`
pub fn partition_path(destination: &Path, prefix: &str, map_id: u64, depth: Option<u64>, partition: usize) -> PathBuf {
    let name = match depth {
        Some(depth) => format!("{}-{}-{}-{}", prefix, map_id, depth, partition),
        None => format!("{}-{}-{}", prefix, map_id, partition),
    };
    destination.join(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_is_deterministic() {
        assert_eq!(hash_key(b"some key"), hash_key(b"some key"));
        assert_ne!(hash_key(b"some key"), hash_key(b"some kez"));
        let range = HashRange::new(13);
        assert_eq!(range.partition_of(b"abc"), range.partition_of(&b"xabc"[1..]));
    }

    #[test]
    fn partitions_stay_in_range() {
        for n in [1usize, 2, 3, 7, 10, 64, 1000] {
            let range = HashRange::new(n);
            assert_eq!(range.partition_of_hash(0), 0);
            assert_eq!(range.partition_of_hash(u128::MAX), n - 1);
            for i in 0..500u32 {
                assert!(range.partition_of(&i.to_le_bytes()) < n);
            }
        }
    }

    #[test]
    fn single_partition_takes_everything() {
        let range = HashRange::new(1);
        assert_eq!(range.partition_of(b"a"), 0);
        assert_eq!(range.partition_of(b""), 0);
    }

    #[test]
    fn keys_spread_over_buckets() {
        let range = HashRange::new(8);
        let mut counts = [0usize; 8];
        for i in 0..8000u32 {
            counts[range.partition_of(format!("key-{}", i).as_bytes())] += 1;
        }
        for c in counts {
            assert!(c > 700 && c < 1300, "skewed bucket counts {:?}", counts);
        }
    }

    #[test]
    fn paths_follow_naming_scheme() {
        let dest = Path::new("/tmp/out");
        assert_eq!(partition_path(dest, "part", 3, None, 17), PathBuf::from("/tmp/out/part-3-17"));
        assert_eq!(partition_path(dest, "p", 3, Some(2), 0), PathBuf::from("/tmp/out/p-3-2-0"));
    }
}
