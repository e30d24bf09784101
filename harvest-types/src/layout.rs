//! On-disk layout of the harvest store.
//!
//! Every component resolves its paths through these functions so the directory
//! structure is defined in exactly one place:
//!
//! ```text
//! {base}/{NETWORK}/metadata/{hash[0]}/{hash}.xml.gz
//! {base}/{NETWORK}/snapshots/snapshot_{id}/metadata.json
//! {base}/{NETWORK}/snapshots/snapshot_{id}/validation_stats.json
//! {base}/{NETWORK}/snapshots/snapshot_{id}/oai_records/*.parquet
//! {base}/{NETWORK}/snapshots/snapshot_{id}/validation_records/part-*.parquet
//! {base}/{NETWORK}/snapshots/snapshot_{id}/validation_records/validation_index.parquet
//! {base}/{NETWORK}/snapshots/snapshot_{id}/catalog/catalog.db
//! ```
//!
//! All functions are pure: none of them touch the filesystem.

use crate::ids::SnapshotId;
use harvest_result::{Error, Result};
use std::path::{Path, PathBuf};

pub const METADATA_DIR: &str = "metadata";
pub const SNAPSHOTS_DIR: &str = "snapshots";
pub const OAI_RECORDS_DIR: &str = "oai_records";
pub const VALIDATION_RECORDS_DIR: &str = "validation_records";
pub const CATALOG_DIR: &str = "catalog";
pub const CATALOG_DB_FILE: &str = "catalog.db";
pub const SNAPSHOT_METADATA_FILE: &str = "metadata.json";
pub const VALIDATION_STATS_FILE: &str = "validation_stats.json";
/// One row per record, written next to the fact files at finalize.
pub const VALIDATION_INDEX_FILE: &str = "validation_index.parquet";

/// Prefix of committed fact files inside `validation_records/`.
pub const FACT_FILE_PREFIX: &str = "part-";
/// Suffix of fact files that are still being written.
pub const IN_PROGRESS_SUFFIX: &str = ".inprogress";
/// Prefix of legacy columnar catalog batches inside `catalog/`.
pub const LEGACY_CATALOG_PREFIX: &str = "oai_records_batch_";

const UNKNOWN_NETWORK: &str = "UNKNOWN";

/// Map a network acronym to a filesystem-safe directory name.
///
/// The acronym is uppercased and every character outside `[A-Z0-9_-]` becomes
/// `_`. Blank input maps to `UNKNOWN`.
///
/// ```
/// use harvest_types::layout::sanitize_network_acronym;
///
/// assert_eq!(sanitize_network_acronym("LA Referencia"), "LA_REFERENCIA");
/// assert_eq!(sanitize_network_acronym("  "), "UNKNOWN");
/// ```
pub fn sanitize_network_acronym(acronym: &str) -> String {
    if acronym.trim().is_empty() {
        return UNKNOWN_NETWORK.to_string();
    }
    acronym
        .to_uppercase()
        .chars()
        .map(|c| match c {
            'A'..='Z' | '0'..='9' | '_' | '-' => c,
            _ => '_',
        })
        .collect()
}

/// `{base}/{NETWORK}`
pub fn network_path(base: &Path, network: &str) -> PathBuf {
    base.join(sanitize_network_acronym(network))
}

/// `{base}/{NETWORK}/metadata/{hash[0]}/{hash}.xml.gz`
///
/// The partition directory is the first character of the hash, uppercased.
pub fn metadata_path(base: &Path, network: &str, hash: &str) -> Result<PathBuf> {
    let first = hash.chars().next().ok_or_else(|| {
        Error::InvalidArgumentError("metadata hash must not be empty".to_string())
    })?;
    Ok(network_path(base, network)
        .join(METADATA_DIR)
        .join(first.to_uppercase().to_string())
        .join(format!("{hash}.xml.gz")))
}

/// `{base}/{NETWORK}/snapshots`
pub fn snapshots_path(base: &Path, network: &str) -> PathBuf {
    network_path(base, network).join(SNAPSHOTS_DIR)
}

/// `{base}/{NETWORK}/snapshots/snapshot_{id}`
pub fn snapshot_path(base: &Path, network: &str, snapshot_id: SnapshotId) -> PathBuf {
    snapshots_path(base, network).join(format!("snapshot_{}", snapshot_id.0))
}

pub fn oai_records_path(base: &Path, network: &str, snapshot_id: SnapshotId) -> PathBuf {
    snapshot_path(base, network, snapshot_id).join(OAI_RECORDS_DIR)
}

pub fn validation_records_path(base: &Path, network: &str, snapshot_id: SnapshotId) -> PathBuf {
    snapshot_path(base, network, snapshot_id).join(VALIDATION_RECORDS_DIR)
}

pub fn validation_index_path(base: &Path, network: &str, snapshot_id: SnapshotId) -> PathBuf {
    validation_records_path(base, network, snapshot_id).join(VALIDATION_INDEX_FILE)
}

pub fn validation_stats_path(base: &Path, network: &str, snapshot_id: SnapshotId) -> PathBuf {
    snapshot_path(base, network, snapshot_id).join(VALIDATION_STATS_FILE)
}

pub fn snapshot_metadata_path(base: &Path, network: &str, snapshot_id: SnapshotId) -> PathBuf {
    snapshot_path(base, network, snapshot_id).join(SNAPSHOT_METADATA_FILE)
}

pub fn catalog_dir_path(base: &Path, network: &str, snapshot_id: SnapshotId) -> PathBuf {
    snapshot_path(base, network, snapshot_id).join(CATALOG_DIR)
}

/// `{base}/{NETWORK}/snapshots/snapshot_{id}/catalog/catalog.db`
pub fn catalog_db_path(base: &Path, network: &str, snapshot_id: SnapshotId) -> PathBuf {
    catalog_dir_path(base, network, snapshot_id).join(CATALOG_DB_FILE)
}

/// Flat per-snapshot observation file of the oldest storage generation.
pub fn legacy_stats_file(legacy_base: &Path, snapshot_id: SnapshotId) -> PathBuf {
    legacy_base.join(format!("snapshot_{}.parquet", snapshot_id.0))
}

/// Whether `file_name` is a committed fact file (`part-*.parquet`).
pub fn is_fact_file(file_name: &str) -> bool {
    file_name.starts_with(FACT_FILE_PREFIX) && file_name.ends_with(".parquet")
}

/// Batch number of a legacy catalog file name, e.g. `oai_records_batch_12.parquet` -> 12.
pub fn legacy_catalog_batch_number(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix(LEGACY_CATALOG_PREFIX)?
        .strip_suffix(".parquet")?
        .parse()
        .ok()
}
