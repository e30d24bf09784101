//! Core type definitions for the fact store.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Physical partition of a snapshot's fact files.
///
/// Snapshot and network partitions are directories; record validity splits the
/// files inside `validation_records/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FactPartition {
    Valid,
    Invalid,
}

impl FactPartition {
    pub fn of(record_is_valid: bool) -> Self {
        if record_is_valid {
            Self::Valid
        } else {
            Self::Invalid
        }
    }

    pub fn record_is_valid(self) -> bool {
        matches!(self, Self::Valid)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Invalid => "invalid",
        }
    }

    /// `part-{valid|invalid}-{seq:05}.parquet`
    pub fn file_name(self, seq: u32) -> String {
        format!("part-{}-{seq:05}.parquet", self.as_str())
    }

    /// Partition encoded in a fact file name, if any.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let rest = name.strip_prefix("part-")?;
        if rest.starts_with("valid-") {
            Some(Self::Valid)
        } else if rest.starts_with("invalid-") {
            Some(Self::Invalid)
        } else {
            None
        }
    }
}

impl fmt::Display for FactPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters reported when a writer is finalized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteStats {
    pub records: u64,
    pub rows: u64,
    pub files: u64,
}

/// Min/max statistics of one column in one row group.
///
/// Values are the raw Parquet statistic bytes: little-endian integers, one byte
/// per boolean, UTF-8 for strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnStats {
    pub min: Option<Vec<u8>>,
    pub max: Option<Vec<u8>>,
    pub null_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_file_names() {
        assert_eq!(FactPartition::Valid.file_name(3), "part-valid-00003.parquet");
        assert_eq!(
            FactPartition::from_file_name("part-invalid-00012.parquet"),
            Some(FactPartition::Invalid)
        );
        assert_eq!(FactPartition::from_file_name("part-00012.parquet"), None);
    }
}
