//! Identifiers shared across the harvest crates.
//!
//! Record, fact and catalog ids are hex-encoded xxh3 digests so the same input
//! always maps to the same id across runs and processes.

use serde::{Deserialize, Serialize};
use std::fmt;
use xxhash_rust::xxh3::{xxh3_64, Xxh3};

/// Unique identifier for a harvesting run.
///
/// This is a simple wrapper around `i64` to prevent mixing snapshot ids up with
/// rule ids or record counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(pub i64);

impl From<i64> for SnapshotId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<SnapshotId> for i64 {
    fn from(id: SnapshotId) -> Self {
        id.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a validation rule within a validator.
pub type RuleId = i32;

/// Stable id of a harvested record, derived from its OAI identifier.
///
/// Also used as the catalog primary key, so a record keeps the same id in the
/// fact table and in the inventory.
pub fn record_id(identifier: &str) -> String {
    format!("{:016x}", xxh3_64(identifier.as_bytes()))
}

/// Stable id of one fact row: the record identifier, the rule, the occurrence
/// value and its validity.
///
/// Fields are separated by a byte that never appears in UTF-8 text so that
/// `("ab", 1)` and `("a", 11)` hash differently.
pub fn fact_id(identifier: &str, rule_id: RuleId, value: Option<&str>, is_valid: bool) -> String {
    let mut hasher = Xxh3::new();
    hasher.update(identifier.as_bytes());
    hasher.update(&[0xff]);
    hasher.update(&rule_id.to_le_bytes());
    hasher.update(&[0xff]);
    if let Some(value) = value {
        hasher.update(value.as_bytes());
    }
    hasher.update(&[0xff, is_valid as u8]);
    format!("{:016x}", hasher.digest())
}
