//! Storage generations a snapshot's validation data may live in.

use harvest_result::{Error, Result};
use harvest_types::{layout, SnapshotKey, StoreConfig};
use std::path::PathBuf;

/// Layout a snapshot was written with, resolved once from on-disk markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageGeneration {
    /// One flat `snapshot_{id}.parquet` with one row per record.
    Legacy { file: PathBuf },
    /// Network-partitioned `validation_records/part-*.parquet`.
    FactTable { dir: PathBuf },
}

impl StorageGeneration {
    /// Resolve the generation of `key`.
    ///
    /// A `validation_records/` directory wins over a legacy file; neither
    /// present is `NotFound`.
    pub fn resolve(config: &StoreConfig, key: &SnapshotKey) -> Result<Self> {
        let dir = layout::validation_records_path(&config.base_path, &key.network, key.snapshot_id);
        if dir.is_dir() {
            return Ok(Self::FactTable { dir });
        }
        if let Some(legacy_base) = &config.legacy_stats_path {
            let file = layout::legacy_stats_file(legacy_base, key.snapshot_id);
            if file.is_file() {
                return Ok(Self::Legacy { file });
            }
        }
        Err(Error::NotFound(format!("validation data for snapshot {key}")))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Legacy { .. } => "legacy",
            Self::FactTable { .. } => "fact-table",
        }
    }
}
