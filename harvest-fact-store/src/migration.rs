//! Re-emit a legacy flat observation file as fact files.

use crate::legacy;
use crate::reader::{list_fact_files, FactReader, SCAN_BATCH_SIZE};
use crate::summary::SummaryCache;
use crate::types::WriteStats;
use crate::writer::FactWriter;
use harvest_result::{Error, Result};
use harvest_types::layout::{legacy_stats_file, validation_records_path};
use harvest_types::{SnapshotMetadata, StoreConfig};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use std::fs::File;

/// Migrate the legacy file of `metadata`'s snapshot into the fact layout.
///
/// Occurrences are kept, so the fact files are written with detailed
/// diagnostics regardless of the configured flag. Missing origin and metadata
/// prefix are taken from the legacy rows. Rows without any rule result are
/// skipped. The legacy file is left in place.
pub fn migrate_legacy_snapshot(config: &StoreConfig, metadata: &SnapshotMetadata) -> Result<WriteStats> {
    let legacy_base = config.legacy_stats_path.as_ref().ok_or_else(|| {
        Error::InvalidArgumentError("legacy_stats_path is not configured".to_string())
    })?;
    let source = legacy_stats_file(legacy_base, metadata.snapshot_id);
    if !source.is_file() {
        return Err(Error::NotFound(format!(
            "legacy observations {}",
            source.display()
        )));
    }
    let key = metadata.key();
    let target = validation_records_path(&config.base_path, &key.network, key.snapshot_id);
    if !list_fact_files(&target)?.is_empty() {
        return Err(Error::AlreadyExists(target));
    }

    tracing::info!(
        "[MIGRATION] migrating {} into {}",
        source.display(),
        target.display()
    );

    let file = File::open(&source).map_err(|e| Error::io_at(&source, e))?;
    let mut batches = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(|e| Error::corrupt(&source, e))?
        .with_batch_size(SCAN_BATCH_SIZE)
        .build()
        .map_err(|e| Error::corrupt(&source, e))?;

    let mut metadata = metadata.clone();
    let mut writer: Option<FactWriter> = None;
    let mut skipped = 0u64;
    let detailed = config.clone().with_detailed_diagnostics(true);
    for batch in &mut batches {
        let batch = batch.map_err(|e| Error::corrupt(&source, e))?;
        let records = legacy::batch_to_records(&batch, &source, &key.network)?;
        for (columns, record) in records {
            if record.rules.is_empty() {
                skipped += 1;
                continue;
            }
            let mut active = match writer.take() {
                Some(active) => active,
                None => {
                    if metadata.origin.is_empty() {
                        metadata.origin = columns.origin;
                    }
                    if metadata.metadata_prefix.is_none() {
                        metadata.metadata_prefix = columns.metadata_prefix;
                    }
                    FactWriter::create(&detailed, &metadata)?
                }
            };
            active.append(&record)?;
            writer = Some(active);
        }
    }

    let writer = match writer {
        Some(writer) => writer,
        None => FactWriter::create(&detailed, &metadata)?,
    };
    let stats = writer.finalize()?;
    if skipped > 0 {
        tracing::warn!("[MIGRATION] {} skipped {} records without rule results", key, skipped);
    }

    let cache = SummaryCache::new(FactReader::new(config.clone()));
    let summary = cache.compute(&metadata)?;
    cache.store(&key, &summary)?;

    tracing::info!(
        "[MIGRATION] snapshot {} migrated: {} records, {} rows, {} files",
        key,
        stats.records,
        stats.rows,
        stats.files
    );
    Ok(stats)
}
