//! Conversion of columnar catalog batches into a SQLite catalog.
//!
//! Older snapshots kept their record inventory as
//! `catalog/oai_records_batch_{n}.parquet` files. Migration reads them in batch
//! order and writes one `catalog.db` next to them. The batch files are left
//! in place.

use crate::store::{remove_db_files, CatalogRecord, CatalogStore};
use arrow::array::{Array, ArrayRef, AsArray, RecordBatch, StringArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Int64Type};
use chrono::{DateTime, NaiveDateTime};
use harvest_result::{Error, Result};
use harvest_types::layout::{catalog_db_path, catalog_dir_path, legacy_catalog_batch_number};
use harvest_types::{record_id, CatalogConfig, SnapshotKey};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// Outcome of a catalog migration.
///
/// Refusals (nothing to migrate, destination present) come back with
/// `success == false` and a message rather than an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Distinct identifiers in the new catalog; restated records count once.
    pub records_migrated: u64,
    pub records_skipped: u64,
    pub batches_processed: u64,
    pub success: bool,
    pub message: String,
}

impl MigrationReport {
    fn refused(message: String) -> Self {
        tracing::warn!("[MIGRATION] {}", message);
        Self {
            message,
            ..Self::default()
        }
    }
}

/// Columnar batch files under `dir`, in batch-number order.
pub fn list_legacy_catalog_batches(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::io_at(dir, e)),
    };
    let mut batches = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::io_at(dir, e))?;
        let name = entry.file_name();
        if let Some(n) = legacy_catalog_batch_number(&name.to_string_lossy()) {
            batches.push((n, entry.path()));
        }
    }
    batches.sort_by_key(|(n, _)| *n);
    Ok(batches.into_iter().map(|(_, path)| path).collect())
}

/// Migrate the columnar catalog of `key` into `catalog.db`.
///
/// With `dry_run` the batches are only counted.
pub fn migrate_legacy_catalog(
    base: &Path,
    key: &SnapshotKey,
    config: &CatalogConfig,
    dry_run: bool,
) -> Result<MigrationReport> {
    let dir = catalog_dir_path(base, &key.network, key.snapshot_id);
    let batches = list_legacy_catalog_batches(&dir)?;
    if batches.is_empty() {
        return Ok(MigrationReport::refused(format!(
            "no legacy catalog batches found in {}",
            dir.display()
        )));
    }
    let target = catalog_db_path(base, &key.network, key.snapshot_id);
    if target.exists() {
        return Ok(MigrationReport::refused(format!(
            "catalog database already exists at {}",
            target.display()
        )));
    }

    if dry_run {
        return dry_run_report(&batches);
    }

    tracing::info!(
        "[MIGRATION] migrating {} catalog batches of snapshot {}",
        batches.len(),
        key
    );
    match write_catalog(&target, &batches, config) {
        Ok(report) => {
            tracing::info!(
                "[MIGRATION] snapshot {}: {} records migrated, {} skipped",
                key,
                report.records_migrated,
                report.records_skipped
            );
            Ok(report)
        }
        Err(e) => {
            // Leave no half-written database behind so the migration can be retried.
            if let Err(cleanup) = remove_db_files(&target) {
                tracing::warn!("[MIGRATION] cleanup of {} failed: {}", target.display(), cleanup);
            }
            Err(e)
        }
    }
}

fn dry_run_report(batches: &[PathBuf]) -> Result<MigrationReport> {
    let mut rows = 0u64;
    for path in batches {
        let file = File::open(path).map_err(|e| Error::io_at(path, e))?;
        let builder =
            ParquetRecordBatchReaderBuilder::try_new(file).map_err(|e| Error::corrupt(path, e))?;
        rows += builder.metadata().file_metadata().num_rows().max(0) as u64;
    }
    Ok(MigrationReport {
        records_migrated: 0,
        records_skipped: 0,
        batches_processed: batches.len() as u64,
        success: true,
        message: format!("dry run: {rows} records in {} batches", batches.len()),
    })
}

fn write_catalog(
    target: &Path,
    batches: &[PathBuf],
    config: &CatalogConfig,
) -> Result<MigrationReport> {
    let store = CatalogStore::open(target, config)?;
    let chunk_size = config.batch_size.max(1);
    let mut pending = Vec::with_capacity(chunk_size);
    let mut report = MigrationReport::default();

    for path in batches {
        let file = File::open(path).map_err(|e| Error::io_at(path, e))?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .and_then(|b| b.build())
            .map_err(|e| Error::corrupt(path, e))?;
        for batch in reader {
            let batch = batch.map_err(|e| Error::corrupt(path, e))?;
            let (records, skipped) = batch_to_catalog_records(&batch, path)?;
            report.records_skipped += skipped;
            for record in records {
                pending.push(record);
                if pending.len() >= chunk_size {
                    store.upsert_batch(&pending)?;
                    pending.clear();
                }
            }
        }
        report.batches_processed += 1;
        tracing::debug!("[MIGRATION] processed {}", path.display());
    }
    store.upsert_batch(&pending)?;
    report.records_migrated = store.count()?;
    store.close()?;

    report.success = true;
    report.message = format!(
        "migrated {} records from {} batches",
        report.records_migrated, report.batches_processed
    );
    Ok(report)
}

fn column<'a>(batch: &'a RecordBatch, path: &Path, name: &str) -> Result<&'a ArrayRef> {
    batch
        .column_by_name(name)
        .ok_or_else(|| Error::corrupt(path, format!("missing column '{name}'")))
}

fn strings<'a>(batch: &'a RecordBatch, path: &Path, name: &str) -> Result<&'a StringArray> {
    column(batch, path, name)?
        .as_string_opt::<i32>()
        .ok_or_else(|| Error::corrupt(path, format!("column '{name}' is not a string")))
}

/// Decode one columnar catalog batch. Rows without an identifier are
/// counted as skipped.
fn batch_to_catalog_records(batch: &RecordBatch, path: &Path) -> Result<(Vec<CatalogRecord>, u64)> {
    let identifiers = strings(batch, path, "identifier")?;
    let ids = strings(batch, path, "id").ok();
    let hashes = strings(batch, path, "original_metadata_hash").ok();
    let deleted = column(batch, path, "deleted")
        .ok()
        .and_then(|c| c.as_boolean_opt());
    let datestamps = cast(column(batch, path, "datestamp")?, &DataType::Int64)?;
    let datestamps = datestamps.as_primitive::<Int64Type>();

    let mut records = Vec::with_capacity(batch.num_rows());
    let mut skipped = 0;
    for row in 0..batch.num_rows() {
        if identifiers.is_null(row) || identifiers.value(row).is_empty() {
            skipped += 1;
            continue;
        }
        let identifier = identifiers.value(row);
        if datestamps.is_null(row) {
            return Err(Error::corrupt(path, format!("row {row} has no datestamp")));
        }
        let datestamp = millis_to_datetime(datestamps.value(row))
            .ok_or_else(|| Error::corrupt(path, format!("row {row} datestamp out of range")))?;

        let id = match ids {
            Some(ids) if !ids.is_null(row) && !ids.value(row).is_empty() => ids.value(row).to_string(),
            _ => record_id(identifier),
        };
        records.push(CatalogRecord {
            id,
            identifier: identifier.to_string(),
            datestamp,
            original_metadata_hash: hashes
                .filter(|h| !h.is_null(row))
                .map(|h| h.value(row).to_string()),
            deleted: deleted
                .map(|d| !d.is_null(row) && d.value(row))
                .unwrap_or(false),
        });
    }
    Ok((records, skipped))
}

fn millis_to_datetime(millis: i64) -> Option<NaiveDateTime> {
    DateTime::from_timestamp_millis(millis).map(|dt| dt.naive_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_to_datetime() {
        let dt = millis_to_datetime(1_700_000_000_123).unwrap();
        assert_eq!(dt.and_utc().timestamp_millis(), 1_700_000_000_123);
        assert!(millis_to_datetime(i64::MAX).is_none());
    }

    #[test]
    fn test_batches_listed_numerically() {
        let dir = tempfile::TempDir::new().unwrap();
        for name in [
            "oai_records_batch_10.parquet",
            "oai_records_batch_2.parquet",
            "oai_records_batch_1.parquet",
            "catalog.db",
            "oai_records_batch_x.parquet",
        ] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        let names: Vec<_> = list_legacy_catalog_batches(dir.path())
            .unwrap()
            .into_iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            [
                "oai_records_batch_1.parquet",
                "oai_records_batch_2.parquet",
                "oai_records_batch_10.parquet"
            ]
        );
        assert!(list_legacy_catalog_batches(&dir.path().join("missing"))
            .unwrap()
            .is_empty());
    }
}
