//! Store configuration.
//!
//! Every option except `base_path` has a default, so a minimal JSON document
//! only needs the base path:
//!
//! ```
//! use harvest_types::StoreConfig;
//!
//! let config: StoreConfig = serde_json::from_str(r#"{ "base_path": "/data" }"#).unwrap();
//! assert_eq!(config.flush_threshold, 10_000);
//! ```

use harvest_result::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_RECORDS_PER_FILE: u64 = 100_000;
pub const DEFAULT_FLUSH_THRESHOLD: usize = 10_000;
pub const DEFAULT_ROW_GROUP_SIZE_BYTES: usize = 128 * 1024 * 1024;
pub const DEFAULT_PAGE_SIZE_BYTES: usize = 1024 * 1024;
pub const DEFAULT_CATALOG_BATCH_SIZE: usize = 5_000;

/// Compression codec for fact files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionCodec {
    #[default]
    Zstd,
    Snappy,
    Gzip,
    Lz4,
    Uncompressed,
}

/// SQLite journal mode for catalog databases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalMode {
    #[default]
    Wal,
    Delete,
}

impl JournalMode {
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Wal => "WAL",
            Self::Delete => "DELETE",
        }
    }
}

/// Catalog store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Rows per insert transaction during migration and bulk upserts.
    pub batch_size: usize,
    pub journal_mode: JournalMode,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_CATALOG_BATCH_SIZE,
            journal_mode: JournalMode::default(),
        }
    }
}

/// Fact-table and catalog storage settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub base_path: PathBuf,
    /// Directory holding flat `snapshot_{id}.parquet` files of the oldest generation.
    #[serde(default)]
    pub legacy_stats_path: Option<PathBuf>,
    /// Records per file when the snapshot size is unknown or dynamic sizing is off.
    #[serde(default = "default_records_per_file")]
    pub records_per_file: u64,
    #[serde(default = "default_true")]
    pub dynamic_sizing: bool,
    #[serde(default)]
    pub compression: CompressionCodec,
    #[serde(default = "default_true")]
    pub dictionary_encoding: bool,
    #[serde(default = "default_row_group_size_bytes")]
    pub row_group_size_bytes: usize,
    #[serde(default = "default_page_size_bytes")]
    pub page_size_bytes: usize,
    /// Buffered records per partition before a flush.
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,
    /// Populate `value` with one row per distinct occurrence.
    #[serde(default)]
    pub detailed_diagnostics: bool,
    #[serde(default)]
    pub catalog: CatalogConfig,
}

fn default_records_per_file() -> u64 {
    DEFAULT_RECORDS_PER_FILE
}

fn default_true() -> bool {
    true
}

fn default_row_group_size_bytes() -> usize {
    DEFAULT_ROW_GROUP_SIZE_BYTES
}

fn default_page_size_bytes() -> usize {
    DEFAULT_PAGE_SIZE_BYTES
}

fn default_flush_threshold() -> usize {
    DEFAULT_FLUSH_THRESHOLD
}

impl StoreConfig {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            legacy_stats_path: None,
            records_per_file: DEFAULT_RECORDS_PER_FILE,
            dynamic_sizing: true,
            compression: CompressionCodec::default(),
            dictionary_encoding: true,
            row_group_size_bytes: DEFAULT_ROW_GROUP_SIZE_BYTES,
            page_size_bytes: DEFAULT_PAGE_SIZE_BYTES,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            detailed_diagnostics: false,
            catalog: CatalogConfig::default(),
        }
    }

    /// Load and validate a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|e| Error::io_at(path, e))?;
        let config: Self = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.records_per_file == 0, "records_per_file"),
            (self.flush_threshold == 0, "flush_threshold"),
            (self.row_group_size_bytes == 0, "row_group_size_bytes"),
            (self.page_size_bytes == 0, "page_size_bytes"),
            (self.catalog.batch_size == 0, "catalog.batch_size"),
        ];
        if let Some((_, name)) = checks.iter().find(|(zero, _)| *zero) {
            return Err(Error::InvalidArgumentError(format!(
                "{name} must be greater than zero"
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn with_legacy_stats_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.legacy_stats_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_records_per_file(mut self, records: u64) -> Self {
        self.records_per_file = records;
        self
    }

    #[must_use]
    pub fn with_dynamic_sizing(mut self, enabled: bool) -> Self {
        self.dynamic_sizing = enabled;
        self
    }

    #[must_use]
    pub fn with_compression(mut self, codec: CompressionCodec) -> Self {
        self.compression = codec;
        self
    }

    #[must_use]
    pub fn with_dictionary_encoding(mut self, enabled: bool) -> Self {
        self.dictionary_encoding = enabled;
        self
    }

    #[must_use]
    pub fn with_row_group_size_bytes(mut self, bytes: usize) -> Self {
        self.row_group_size_bytes = bytes;
        self
    }

    #[must_use]
    pub fn with_page_size_bytes(mut self, bytes: usize) -> Self {
        self.page_size_bytes = bytes;
        self
    }

    #[must_use]
    pub fn with_flush_threshold(mut self, records: usize) -> Self {
        self.flush_threshold = records;
        self
    }

    #[must_use]
    pub fn with_detailed_diagnostics(mut self, enabled: bool) -> Self {
        self.detailed_diagnostics = enabled;
        self
    }

    #[must_use]
    pub fn with_catalog(mut self, catalog: CatalogConfig) -> Self {
        self.catalog = catalog;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_json() {
        let config: StoreConfig = serde_json::from_str(r#"{"base_path": "/data"}"#).unwrap();
        assert_eq!(config, StoreConfig::new("/data"));
        assert_eq!(config.compression, CompressionCodec::Zstd);
        assert_eq!(config.row_group_size_bytes, 128 * 1024 * 1024);
        assert_eq!(config.catalog.journal_mode.pragma_value(), "WAL");
    }

    #[test]
    fn test_overrides_from_json() {
        let config: StoreConfig = serde_json::from_str(
            r#"{
                "base_path": "/data",
                "compression": "snappy",
                "dynamic_sizing": false,
                "catalog": { "journal_mode": "delete" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.compression, CompressionCodec::Snappy);
        assert!(!config.dynamic_sizing);
        assert_eq!(config.catalog.journal_mode, JournalMode::Delete);
        assert_eq!(config.catalog.batch_size, DEFAULT_CATALOG_BATCH_SIZE);
    }

    #[test]
    fn test_validate_rejects_zero() {
        let err = StoreConfig::new("/data")
            .with_flush_threshold(0)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("flush_threshold"));
    }
}
