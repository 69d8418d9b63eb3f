//! Key extraction: which bytes of a record are hashed, and which are forwarded.

use crate::io::content_len;
use anyhow::{bail, Result};
use memchr::{memchr, memchr_iter, memrchr_iter};
use std::ops::Range;

/// The one-byte separators a record is split on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Delimiters {
    /// Separates ordinary fields.
    pub field: u8,
    /// Separates an outer join key from the rest of the record.
    pub group: u8,
}

impl Delimiters {
    pub fn uniform(delimiter: u8) -> Self {
        Self { field: delimiter, group: delimiter }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyStrategy {
    /// Key is everything before the first field delimiter.
    FirstField,
    /// Key is everything before the first group delimiter.
    Join,
    /// Peel off `joinkey<group>`; key is the remainder up to its first field
    /// delimiter, and only the remainder is forwarded.
    StripJoinKey,
    /// Key excludes the last `n` fields of the record.
    NumAggregates(usize),
    /// Key is the first `n` fields of the record.
    NumKeyFields(usize),
}

impl KeyStrategy {
    /// Resolves the mode flags of the bucket tools; at most one may be set.
    pub fn from_flags(join: bool, strip_joinkey: bool, num_aggregates: Option<usize>, num_key_fields: Option<usize>) -> Result<Self> {
        let selected = [join, strip_joinkey, num_aggregates.is_some(), num_key_fields.is_some()]
            .iter()
            .filter(|s| **s)
            .count();
        if selected > 1 {
            bail!("--join, --strip-joinkey, --num-aggregates and --num-key-fields are mutually exclusive");
        }
        if num_key_fields == Some(0) {
            bail!("--num-key-fields must be at least 1");
        }
        Ok(if join {
            KeyStrategy::Join
        } else if strip_joinkey {
            KeyStrategy::StripJoinKey
        } else if let Some(n) = num_aggregates {
            KeyStrategy::NumAggregates(n)
        } else if let Some(n) = num_key_fields {
            KeyStrategy::NumKeyFields(n)
        } else {
            KeyStrategy::FirstField
        })
    }
}

/// Where the key and the forwarded payload sit inside one record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeySpan {
    pub key: Range<usize>,
    /// The record is forwarded from this offset to its end.
    pub payload_start: usize,
}

/// Locates the key of `record` (newline included or not).
///
/// Returns `None` when a delimiter the strategy needs is missing; such records
/// are dropped by the caller.
pub fn extract_key(record: &[u8], strategy: KeyStrategy, delims: Delimiters) -> Option<KeySpan> {
    let line = &record[..content_len(record)];
    match strategy {
        KeyStrategy::FirstField => memchr(delims.field, line).map(|end| KeySpan { key: 0..end, payload_start: 0 }),
        KeyStrategy::Join => memchr(delims.group, line).map(|end| KeySpan { key: 0..end, payload_start: 0 }),
        KeyStrategy::StripJoinKey => {
            let start = memchr(delims.group, line)? + 1;
            let len = memchr(delims.field, &line[start..])?;
            Some(KeySpan { key: start..start + len, payload_start: start })
        }
        KeyStrategy::NumAggregates(0) => Some(KeySpan { key: 0..line.len(), payload_start: 0 }),
        KeyStrategy::NumAggregates(n) => {
            memrchr_iter(delims.field, line).nth(n - 1).map(|end| KeySpan { key: 0..end, payload_start: 0 })
        }
        KeyStrategy::NumKeyFields(n) => {
            memchr_iter(delims.field, line).nth(n.checked_sub(1)?).map(|end| KeySpan { key: 0..end, payload_start: 0 })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: Delimiters = Delimiters { field: 0x01, group: 0x02 };

    fn key<'a>(record: &'a [u8], strategy: KeyStrategy) -> Option<&'a [u8]> {
        extract_key(record, strategy, A).map(|span| &record[span.key])
    }

    #[test]
    fn first_field_and_join() {
        assert_eq!(key(b"k\x01v\x01w\n", KeyStrategy::FirstField), Some(&b"k"[..]));
        assert_eq!(key(b"g\x02k\x01v\n", KeyStrategy::Join), Some(&b"g"[..]));
        assert_eq!(key(b"\x01v\n", KeyStrategy::FirstField), Some(&b""[..]));
        assert_eq!(key(b"novalue\n", KeyStrategy::FirstField), None);
        assert_eq!(key(b"k\x01v\n", KeyStrategy::Join), None);
    }

    #[test]
    fn strip_joinkey_hashes_only_the_remainder() {
        let record = b"G\x02K\x01V\n";
        let span = extract_key(record, KeyStrategy::StripJoinKey, A).unwrap();
        assert_eq!(&record[span.key.clone()], b"K");
        assert_eq!(&record[span.payload_start..], b"K\x01V\n");
    }

    #[test]
    fn strip_joinkey_needs_both_delimiters() {
        assert_eq!(key(b"K\x01V\n", KeyStrategy::StripJoinKey), None);
        assert_eq!(key(b"G\x02KV\n", KeyStrategy::StripJoinKey), None);
    }

    #[test]
    fn num_aggregates_scans_from_the_end() {
        let record = b"a\x01b\x01c\x01d\n";
        assert_eq!(key(record, KeyStrategy::NumAggregates(1)), Some(&b"a\x01b\x01c"[..]));
        assert_eq!(key(record, KeyStrategy::NumAggregates(2)), Some(&b"a\x01b"[..]));
        assert_eq!(key(record, KeyStrategy::NumAggregates(3)), Some(&b"a"[..]));
        assert_eq!(key(record, KeyStrategy::NumAggregates(4)), None);
        assert_eq!(key(record, KeyStrategy::NumAggregates(0)), Some(&b"a\x01b\x01c\x01d"[..]));
    }

    #[test]
    fn num_key_fields_scans_from_the_start() {
        let record = b"a\x01b\x01c\x01d\n";
        assert_eq!(key(record, KeyStrategy::NumKeyFields(1)), Some(&b"a"[..]));
        assert_eq!(key(record, KeyStrategy::NumKeyFields(3)), Some(&b"a\x01b\x01c"[..]));
        assert_eq!(key(record, KeyStrategy::NumKeyFields(4)), None);
    }

    #[test]
    fn trailing_newline_never_counts_as_a_field() {
        assert_eq!(key(b"a\x01b", KeyStrategy::NumAggregates(1)), Some(&b"a"[..]));
        assert_eq!(key(b"a\x01\n", KeyStrategy::NumAggregates(1)), Some(&b"a"[..]));
    }

    #[test]
    fn conflicting_flags_are_rejected() {
        assert!(KeyStrategy::from_flags(true, true, None, None).is_err());
        assert!(KeyStrategy::from_flags(false, false, Some(1), Some(1)).is_err());
        assert!(KeyStrategy::from_flags(true, false, Some(1), None).is_err());
        assert!(KeyStrategy::from_flags(false, false, None, Some(0)).is_err());
    }

    #[test]
    fn flags_select_a_strategy() {
        assert_eq!(KeyStrategy::from_flags(false, false, None, None).unwrap(), KeyStrategy::FirstField);
        assert_eq!(KeyStrategy::from_flags(true, false, None, None).unwrap(), KeyStrategy::Join);
        assert_eq!(KeyStrategy::from_flags(false, true, None, None).unwrap(), KeyStrategy::StripJoinKey);
        assert_eq!(KeyStrategy::from_flags(false, false, Some(2), None).unwrap(), KeyStrategy::NumAggregates(2));
        assert_eq!(KeyStrategy::from_flags(false, false, None, Some(3)).unwrap(), KeyStrategy::NumKeyFields(3));
    }
}
