//! Lazy scans over a snapshot's fact rows.
//!
//! Opening a scan reads every candidate footer in parallel and prunes row
//! groups against the filter's predicates. Decoding then proceeds one file and
//! one batch at a time, so memory use is bounded by the batch size regardless
//! of snapshot size.

use crate::filter::{FilterSet, IdentifierMatch};
use crate::generation::StorageGeneration;
use crate::index::{read_index, IndexEntry};
use crate::legacy::{self, legacy_predicates};
use crate::record::RecordFacts;
use crate::schema::{self, FactRow};
use crate::statistics::{row_group_may_match, ColumnPredicate};
use crate::types::FactPartition;
use crate::writer::FOOTER_NETWORK;
use harvest_result::{Error, Result};
use harvest_types::layout::{is_fact_file, VALIDATION_INDEX_FILE};
use harvest_types::{SnapshotKey, StoreConfig};
use parquet::arrow::arrow_reader::{
    ArrowReaderMetadata, ArrowReaderOptions, ParquetRecordBatchReader,
    ParquetRecordBatchReaderBuilder,
};
use rayon::prelude::*;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// Rows decoded per Arrow batch.
pub const SCAN_BATCH_SIZE: usize = 8192;

/// List committed fact files of `dir` in name order.
///
/// In-progress files never match. A missing directory lists as empty.
pub fn list_fact_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::io_at(dir, e)),
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::io_at(dir, e))?;
        let name = entry.file_name();
        if is_fact_file(&name.to_string_lossy()) {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// How decoded batches turn into fact rows.
#[derive(Debug, Clone)]
enum RowSource {
    Facts,
    Legacy { fallback_network: String },
}

/// Footer and surviving row groups of one file.
struct PlannedFile {
    path: PathBuf,
    metadata: ArrowReaderMetadata,
    row_groups: Vec<usize>,
}

fn plan_file(
    path: &Path,
    predicates: &[ColumnPredicate],
    expected_network: Option<&str>,
) -> Result<PlannedFile> {
    let file = File::open(path).map_err(|e| Error::io_at(path, e))?;
    let metadata = ArrowReaderMetadata::load(&file, ArrowReaderOptions::new())
        .map_err(|e| Error::corrupt(path, e))?;

    if let Some(expected) = expected_network {
        let stored = metadata
            .metadata()
            .file_metadata()
            .key_value_metadata()
            .and_then(|kvs| kvs.iter().find(|kv| kv.key == FOOTER_NETWORK))
            .and_then(|kv| kv.value.as_deref());
        if let Some(stored) = stored {
            if stored != expected {
                return Err(Error::corrupt(
                    path,
                    format!("file belongs to network '{stored}', expected '{expected}'"),
                ));
            }
        }
    }

    let parquet_metadata = metadata.metadata();
    let total = parquet_metadata.num_row_groups();
    let row_groups: Vec<usize> = (0..total)
        .filter(|&i| row_group_may_match(parquet_metadata.row_group(i), predicates))
        .collect();
    tracing::trace!(
        "[FACT_READER] {}: {} of {} row groups survive pruning",
        path.display(),
        row_groups.len(),
        total
    );

    Ok(PlannedFile {
        path: path.to_path_buf(),
        metadata,
        row_groups,
    })
}

/// Read-side entry point over the snapshots of one store.
#[derive(Debug, Clone)]
pub struct FactReader {
    config: StoreConfig,
}

impl FactReader {
    pub fn new(config: StoreConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn generation(&self, key: &SnapshotKey) -> Result<StorageGeneration> {
        StorageGeneration::resolve(&self.config, key)
    }

    /// Every fact row of the snapshot, in file order.
    pub fn iterate(&self, key: &SnapshotKey) -> Result<FactRowIter> {
        self.scan(key, &FilterSet::default())
    }

    /// Fact rows of the row groups that may hold records matching `filters`.
    ///
    /// Pruning is coarse: the rows still need record-level filtering, which
    /// [`FactReader::iterate_records`] applies.
    pub fn scan(&self, key: &SnapshotKey, filters: &FilterSet) -> Result<FactRowIter> {
        let generation = self.generation(key)?;
        let predicates = filters.predicates();

        let (paths, predicates, expected_network, source) = match &generation {
            StorageGeneration::FactTable { dir } => {
                let mut files = list_fact_files(dir)?;
                if let Some(partition) = filters.partition() {
                    files.retain(|path| {
                        let name = path.file_name().map(|n| n.to_string_lossy());
                        match name.as_deref().and_then(FactPartition::from_file_name) {
                            Some(file_partition) => file_partition == partition,
                            None => true,
                        }
                    });
                }
                (files, predicates, Some(key.network.as_str()), RowSource::Facts)
            }
            StorageGeneration::Legacy { file } => (
                vec![file.clone()],
                legacy_predicates(&predicates),
                None,
                RowSource::Legacy {
                    fallback_network: key.network.clone(),
                },
            ),
        };

        let planned = paths
            .par_iter()
            .map(|path| plan_file(path, &predicates, expected_network))
            .collect::<Result<Vec<_>>>()?;
        let planned: Vec<PlannedFile> = planned
            .into_iter()
            .filter(|file| !file.row_groups.is_empty())
            .collect();

        tracing::debug!(
            "[FACT_READER] scan of {} ({}) opens {} of {} files",
            key,
            generation.name(),
            planned.len(),
            paths.len()
        );

        Ok(FactRowIter {
            files: planned.into_iter(),
            source,
            current: None,
            pending: Vec::new().into_iter(),
            failed: false,
        })
    }

    /// Records matching `filters`, each with all of its fact rows.
    pub fn iterate_records(&self, key: &SnapshotKey, filters: &FilterSet) -> Result<RecordIter> {
        Ok(RecordIter {
            rows: self.scan(key, filters)?,
            filters: filters.clone(),
            lookahead: None,
            failed: false,
        })
    }

    /// Index entries of every record, or only of valid (`Some(true)`) or
    /// invalid (`Some(false)`) ones.
    pub fn iterate_by_status(
        &self,
        key: &SnapshotKey,
        is_valid: Option<bool>,
    ) -> Result<std::vec::IntoIter<IndexEntry>> {
        let filters = FilterSet {
            record_is_valid: is_valid,
            ..FilterSet::default()
        };
        let entries = self.index_entries(key, &filters, |entry| {
            is_valid.map_or(true, |v| entry.record_is_valid == v)
        })?;
        Ok(entries.into_iter())
    }

    /// Index entry of the record with exactly this identifier.
    pub fn get_by_identifier(&self, key: &SnapshotKey, identifier: &str) -> Result<Option<IndexEntry>> {
        let filters = FilterSet {
            identifier: Some(IdentifierMatch::Exact(identifier.to_string())),
            ..FilterSet::default()
        };
        let entries = self.index_entries(key, &filters, |entry| entry.identifier == identifier)?;
        Ok(entries.into_iter().next())
    }

    /// Entries accepted by `keep`, read from the snapshot's index.
    ///
    /// Legacy snapshots and fact files written without an index are answered
    /// from the fact rows matching `filters`; those entries carry neither
    /// datestamp nor metadata hash.
    fn index_entries(
        &self,
        key: &SnapshotKey,
        filters: &FilterSet,
        keep: impl Fn(&IndexEntry) -> bool,
    ) -> Result<Vec<IndexEntry>> {
        if let StorageGeneration::FactTable { dir } = self.generation(key)? {
            if let Some(entries) = read_index(&dir.join(VALIDATION_INDEX_FILE))? {
                return Ok(entries.into_iter().filter(|e| keep(e)).collect());
            }
        }
        tracing::debug!("[FACT_READER] no validation index for {}; scanning fact rows", key);
        self.iterate_records(key, filters)?
            .map(|record| record.map(|r| IndexEntry::from_record_facts(&r)))
            .filter(|entry| entry.as_ref().map_or(true, |e| keep(e)))
            .collect()
    }
}

/// Lazy iterator over fact rows. Stops after the first error.
pub struct FactRowIter {
    files: std::vec::IntoIter<PlannedFile>,
    source: RowSource,
    current: Option<(PathBuf, ParquetRecordBatchReader)>,
    pending: std::vec::IntoIter<FactRow>,
    failed: bool,
}

impl FactRowIter {
    fn open(file: PlannedFile) -> Result<(PathBuf, ParquetRecordBatchReader)> {
        let handle = File::open(&file.path).map_err(|e| Error::io_at(&file.path, e))?;
        let reader = ParquetRecordBatchReaderBuilder::new_with_metadata(handle, file.metadata)
            .with_row_groups(file.row_groups)
            .with_batch_size(SCAN_BATCH_SIZE)
            .build()
            .map_err(|e| Error::corrupt(&file.path, e))?;
        Ok((file.path, reader))
    }

    fn fail(&mut self, err: Error) -> Option<Result<FactRow>> {
        self.failed = true;
        self.current = None;
        Some(Err(err))
    }
}

impl Iterator for FactRowIter {
    type Item = Result<FactRow>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.failed {
                return None;
            }
            if let Some(row) = self.pending.next() {
                return Some(Ok(row));
            }

            let Some((path, reader)) = self.current.as_mut() else {
                let file = self.files.next()?;
                match Self::open(file) {
                    Ok(opened) => self.current = Some(opened),
                    Err(e) => return self.fail(e),
                }
                continue;
            };

            let decoded = match reader.next() {
                None => {
                    self.current = None;
                    continue;
                }
                Some(Err(e)) => Err(Error::corrupt(&*path, e)),
                Some(Ok(batch)) => match &self.source {
                    RowSource::Facts => {
                        schema::batch_to_rows(&batch).map_err(|e| Error::corrupt(&*path, e))
                    }
                    RowSource::Legacy { fallback_network } => {
                        legacy::batch_to_rows(&batch, &*path, fallback_network)
                    }
                },
            };
            match decoded {
                Ok(rows) => self.pending = rows.into_iter(),
                Err(e) => return self.fail(e),
            }
        }
    }
}

/// Groups contiguous rows by identifier and keeps records matching a filter.
pub struct RecordIter {
    rows: FactRowIter,
    filters: FilterSet,
    lookahead: Option<FactRow>,
    failed: bool,
}

impl RecordIter {
    fn next_row(&mut self) -> Option<Result<FactRow>> {
        match self.lookahead.take() {
            Some(row) => Some(Ok(row)),
            None => self.rows.next(),
        }
    }
}

impl Iterator for RecordIter {
    type Item = Result<RecordFacts>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            let first = match self.next_row()? {
                Ok(row) => row,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            };
            let mut record = RecordFacts::from_first_row(first);
            loop {
                match self.rows.next() {
                    Some(Ok(row)) if record.owns(&row) => record.rows.push(row),
                    Some(Ok(row)) => {
                        self.lookahead = Some(row);
                        break;
                    }
                    Some(Err(e)) => {
                        self.failed = true;
                        return Some(Err(e));
                    }
                    None => break,
                }
            }
            if self.filters.matches(&record) {
                return Some(Ok(record));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::FactWriter;
    use harvest_types::layout::validation_records_path;
    use harvest_types::{RecordValidation, RuleFact, SnapshotMetadata};
    use tempfile::TempDir;

    fn write(config: &StoreConfig, metadata: &SnapshotMetadata, records: &[RecordValidation]) {
        let mut writer = FactWriter::create(config, metadata).unwrap();
        for record in records {
            writer.append(record).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn record(i: usize, valid: bool) -> RecordValidation {
        RecordValidation::new(format!("oai:test:{i}"), valid, false)
            .with_rule(RuleFact::new(1, valid))
            .with_rule(RuleFact::new(2, true))
    }

    #[test]
    fn test_iterate_returns_all_rows_and_restarts() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::new(dir.path());
        let metadata = SnapshotMetadata::new(3, "BR");
        let records: Vec<_> = (0..20).map(|i| record(i, i % 3 != 0)).collect();
        write(&config, &metadata, &records);

        let reader = FactReader::new(config);
        let key = metadata.key();
        let first: Vec<_> = reader.iterate(&key).unwrap().collect::<Result<_>>().unwrap();
        let second: Vec<_> = reader.iterate(&key).unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(first.len(), 40);
        assert_eq!(first, second);
    }

    #[test]
    fn test_records_group_contiguous_rows() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::new(dir.path());
        let metadata = SnapshotMetadata::new(4, "BR");
        let records: Vec<_> = (0..10).map(|i| record(i, i % 2 == 0)).collect();
        write(&config, &metadata, &records);

        let reader = FactReader::new(config);
        let filters = FilterSet::parse(&["isValid:false"]).unwrap();
        let invalid: Vec<_> = reader
            .iterate_records(&metadata.key(), &filters)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(invalid.len(), 5);
        assert!(invalid.iter().all(|r| !r.record_is_valid && r.rows.len() == 2));
    }

    #[test]
    fn test_in_progress_files_are_not_listed() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("part-valid-00000.parquet.inprogress"), b"").unwrap();
        fs::write(dir.path().join("part-valid-00001.parquet"), b"").unwrap();
        fs::write(dir.path().join("notes.txt"), b"").unwrap();
        let files = list_fact_files(dir.path()).unwrap();
        assert_eq!(files, vec![dir.path().join("part-valid-00001.parquet")]);
    }

    #[test]
    fn test_unreadable_file_is_corrupt_data() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::new(dir.path());
        let key = SnapshotKey::new("BR", 5);
        let records_dir = validation_records_path(dir.path(), "BR", key.snapshot_id);
        fs::create_dir_all(&records_dir).unwrap();
        fs::write(records_dir.join("part-valid-00000.parquet"), b"not parquet").unwrap();

        let err = FactReader::new(config).iterate(&key).err().unwrap();
        assert!(matches!(err, Error::CorruptData { .. }), "{err}");
    }

    #[test]
    fn test_foreign_network_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::new(dir.path());
        let metadata = SnapshotMetadata::new(6, "BR");
        write(&config, &metadata, &[record(1, true)]);

        let foreign = TempDir::new().unwrap();
        let foreign_config = StoreConfig::new(foreign.path());
        let foreign_meta = SnapshotMetadata::new(6, "CL");
        write(&foreign_config, &foreign_meta, &[record(2, true)]);

        let src = validation_records_path(foreign.path(), "CL", foreign_meta.snapshot_id)
            .join("part-valid-00000.parquet");
        let dst = validation_records_path(dir.path(), "BR", metadata.snapshot_id)
            .join("part-valid-00099.parquet");
        fs::copy(src, dst).unwrap();

        let err = FactReader::new(config).iterate(&metadata.key()).err().unwrap();
        assert!(matches!(err, Error::CorruptData { .. }), "{err}");
    }

    #[test]
    fn test_status_and_identifier_lookups_use_the_index() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::new(dir.path());
        let metadata = SnapshotMetadata::new(7, "BR");
        let stamp = chrono::NaiveDate::from_ymd_opt(2024, 1, 15)
            .unwrap()
            .and_hms_opt(10, 30, 0)
            .unwrap();
        let records: Vec<_> = (0..6)
            .map(|i| {
                record(i, i % 3 != 0)
                    .with_datestamp(stamp)
                    .with_published_metadata_hash(format!("HASH{i}"))
            })
            .collect();
        write(&config, &metadata, &records);

        let reader = FactReader::new(config);
        let key = metadata.key();
        assert_eq!(reader.iterate_by_status(&key, None).unwrap().count(), 6);
        let invalid: Vec<_> = reader.iterate_by_status(&key, Some(false)).unwrap().collect();
        let mut ids: Vec<_> = invalid.iter().map(|e| e.identifier.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["oai:test:0", "oai:test:3"]);

        let entry = reader.get_by_identifier(&key, "oai:test:4").unwrap().unwrap();
        assert!(entry.record_is_valid);
        assert_eq!(entry.datestamp, Some(stamp));
        assert_eq!(entry.published_metadata_hash.as_deref(), Some("HASH4"));
        assert_eq!(reader.get_by_identifier(&key, "oai:test:40").unwrap(), None);
    }

    #[test]
    fn test_lookups_fall_back_to_fact_rows_without_index() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::new(dir.path());
        let metadata = SnapshotMetadata::new(8, "BR");
        let records: Vec<_> = (0..5).map(|i| record(i, i % 2 == 0)).collect();
        write(&config, &metadata, &records);
        let records_dir = validation_records_path(dir.path(), "BR", metadata.snapshot_id);
        fs::remove_file(records_dir.join(VALIDATION_INDEX_FILE)).unwrap();

        let reader = FactReader::new(config);
        let key = metadata.key();
        assert_eq!(reader.iterate_by_status(&key, Some(true)).unwrap().count(), 3);
        let entry = reader.get_by_identifier(&key, "oai:test:1").unwrap().unwrap();
        assert!(!entry.record_is_valid);
        assert_eq!(entry.datestamp, None);
        assert!(reader.get_by_identifier(&key, "oai:test").unwrap().is_none());
    }
}
