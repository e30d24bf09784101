//! Fact file writing.
//!
//! A [`FactWriter`] owns every open file handle of one snapshot. Records are
//! buffered per [`FactPartition`] and flushed into Parquet files sized by the
//! dynamic records-per-file policy. Files are written under an `.inprogress`
//! name and renamed into place only after a successful close, so readers never
//! observe a partially written file. Finalizing also writes the per-record
//! validation index covering every committed record.

use crate::index::{write_index, IndexEntry};
use crate::schema::{expand_record, fact_schema, rows_to_batch, FactRow, SnapshotColumns, DICTIONARY_COLUMNS};
use crate::sizing::records_per_file;
use crate::types::{FactPartition, WriteStats};
use harvest_result::{Error, Result};
use harvest_types::layout::{self, IN_PROGRESS_SUFFIX, VALIDATION_INDEX_FILE};
use harvest_types::{CompressionCodec, RecordValidation, SnapshotId, SnapshotMetadata, StoreConfig};
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, GzipLevel, ZstdLevel};
use parquet::file::properties::{EnabledStatistics, WriterProperties, WriterVersion};
use parquet::format::KeyValue;
use parquet::schema::types::ColumnPath;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

pub const FOOTER_SNAPSHOT_ID: &str = "harvest.snapshot_id";
pub const FOOTER_NETWORK: &str = "harvest.network";
pub const FOOTER_RECORD_IS_VALID: &str = "harvest.record_is_valid";
pub const FOOTER_FORMAT_VERSION: &str = "harvest.format_version";
pub const FACT_FORMAT_VERSION: &str = "1";

/// Row groups are cut by encoded size; this only bounds the row count so that
/// the writer never splits a record's rows across row groups on its own.
const MAX_ROW_GROUP_ROWS: usize = i32::MAX as usize;
const ZSTD_LEVEL: i32 = 3;

pub(crate) fn compression(codec: CompressionCodec) -> Result<Compression> {
    Ok(match codec {
        CompressionCodec::Zstd => Compression::ZSTD(ZstdLevel::try_new(ZSTD_LEVEL)?),
        CompressionCodec::Snappy => Compression::SNAPPY,
        CompressionCodec::Gzip => Compression::GZIP(GzipLevel::default()),
        CompressionCodec::Lz4 => Compression::LZ4_RAW,
        CompressionCodec::Uncompressed => Compression::UNCOMPRESSED,
    })
}

/// Build Parquet writer properties for one partition of a snapshot.
pub fn writer_properties(
    config: &StoreConfig,
    columns: &SnapshotColumns,
    partition: FactPartition,
) -> Result<WriterProperties> {
    let footer = vec![
        KeyValue::new(FOOTER_SNAPSHOT_ID.to_string(), columns.snapshot_id.to_string()),
        KeyValue::new(FOOTER_NETWORK.to_string(), columns.network.clone()),
        KeyValue::new(
            FOOTER_RECORD_IS_VALID.to_string(),
            partition.record_is_valid().to_string(),
        ),
        KeyValue::new(FOOTER_FORMAT_VERSION.to_string(), FACT_FORMAT_VERSION.to_string()),
    ];

    let mut builder = WriterProperties::builder()
        .set_writer_version(WriterVersion::PARQUET_2_0)
        .set_compression(compression(config.compression)?)
        .set_data_page_size_limit(config.page_size_bytes)
        .set_max_row_group_size(MAX_ROW_GROUP_ROWS)
        .set_statistics_enabled(EnabledStatistics::Chunk)
        .set_dictionary_enabled(false)
        .set_key_value_metadata(Some(footer));

    if config.dictionary_encoding {
        for name in DICTIONARY_COLUMNS {
            builder = builder.set_column_dictionary_enabled(ColumnPath::from(name), true);
        }
    }

    Ok(builder.build())
}

/// Settings shared by both partitions of a writer.
struct FileSettings {
    dir: PathBuf,
    config: StoreConfig,
    columns: SnapshotColumns,
    records_per_file: u64,
}

struct OpenFile {
    writer: ArrowWriter<File>,
    tmp_path: PathBuf,
    final_path: PathBuf,
    entries: Vec<IndexEntry>,
    rows: u64,
}

impl OpenFile {
    fn create(settings: &FileSettings, partition: FactPartition, seq: u32) -> Result<Self> {
        let final_path = settings.dir.join(partition.file_name(seq));
        let tmp_path = in_progress_path(&final_path);
        let file = File::create(&tmp_path).map_err(|e| Error::io_at(&tmp_path, e))?;
        let props = writer_properties(&settings.config, &settings.columns, partition)?;
        let writer = ArrowWriter::try_new(file, fact_schema(), Some(props))
            .map_err(|e| Error::io_at(&tmp_path, io::Error::other(e)))?;
        Ok(Self {
            writer,
            tmp_path,
            final_path,
            entries: Vec::new(),
            rows: 0,
        })
    }

    fn records(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Close and rename into place, handing back the index entries of the
    /// committed records. Nothing is left behind on failure.
    fn close(self) -> Result<(PathBuf, Vec<IndexEntry>)> {
        let OpenFile {
            writer,
            tmp_path,
            final_path,
            entries,
            ..
        } = self;
        if let Err(e) = writer.close() {
            let _ = fs::remove_file(&tmp_path);
            return Err(Error::io_at(&tmp_path, io::Error::other(e)));
        }
        if let Err(e) = fs::rename(&tmp_path, &final_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(Error::io_at(&final_path, e));
        }
        Ok((final_path, entries))
    }

    fn discard(self) {
        let OpenFile {
            writer, tmp_path, ..
        } = self;
        drop(writer);
        if let Err(e) = fs::remove_file(&tmp_path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!("[FACT_WRITER] could not remove {}: {}", tmp_path.display(), e);
            }
        }
    }
}

fn in_progress_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(IN_PROGRESS_SUFFIX);
    PathBuf::from(name)
}

/// Buffer and open file of one partition.
///
/// A record moves from `buffered` to the open file to `committed`; the
/// counters in [`WriteStats`] only ever cover records that are buffered, open
/// or committed.
struct PartitionWriter {
    partition: FactPartition,
    buffer: Vec<FactRow>,
    buffered: Vec<IndexEntry>,
    open: Option<OpenFile>,
    committed: Vec<IndexEntry>,
    next_seq: u32,
}

impl PartitionWriter {
    fn new(partition: FactPartition) -> Self {
        Self {
            partition,
            buffer: Vec::new(),
            buffered: Vec::new(),
            open: None,
            committed: Vec::new(),
            next_seq: 0,
        }
    }

    fn buffered_records(&self) -> u64 {
        self.buffered.len() as u64
    }

    fn should_flush(&self, settings: &FileSettings) -> bool {
        let in_file = self.open.as_ref().map_or(0, OpenFile::records);
        self.buffered_records() >= settings.config.flush_threshold as u64
            || in_file + self.buffered_records() >= settings.records_per_file
    }

    /// Write the buffer into the current file, rolling the file when it
    /// reaches its record target.
    ///
    /// On failure the buffer and the current file are dropped and their
    /// records and rows are taken back out of `stats`.
    fn flush(&mut self, settings: &FileSettings, stats: &mut WriteStats) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.write_buffer(settings, stats) {
            stats.records -= self.buffered_records();
            self.buffer.clear();
            self.buffered.clear();
            if let Some(open) = self.open.take() {
                tracing::warn!(
                    "[FACT_WRITER] aborting {} after failed flush, dropping {} records",
                    open.tmp_path.display(),
                    open.records()
                );
                stats.records -= open.records();
                stats.rows -= open.rows;
                open.discard();
            }
            return Err(e);
        }
        Ok(())
    }

    fn write_buffer(&mut self, settings: &FileSettings, stats: &mut WriteStats) -> Result<()> {
        if self.open.is_none() {
            self.open = Some(OpenFile::create(settings, self.partition, self.next_seq)?);
            self.next_seq += 1;
        }
        let batch = rows_to_batch(&self.buffer)?;
        let Some(open) = self.open.as_mut() else {
            return Err(Error::Internal("fact file vanished during flush".into()));
        };
        open.writer
            .write(&batch)
            .map_err(|e| Error::io_at(&open.tmp_path, io::Error::other(e)))?;
        if open.writer.in_progress_size() >= settings.config.row_group_size_bytes {
            open.writer
                .flush()
                .map_err(|e| Error::io_at(&open.tmp_path, io::Error::other(e)))?;
        }
        let rows = self.buffer.len() as u64;
        tracing::debug!(
            "[FACT_WRITER] flushed {} records ({} rows) into {}",
            self.buffered.len(),
            rows,
            open.final_path.display()
        );
        open.rows += rows;
        stats.rows += rows;
        open.entries.append(&mut self.buffered);
        self.buffer.clear();

        if open.records() >= settings.records_per_file {
            self.close_current(stats)?;
        }
        Ok(())
    }

    fn close_current(&mut self, stats: &mut WriteStats) -> Result<()> {
        let Some(open) = self.open.take() else {
            return Ok(());
        };
        let (records, rows) = (open.records(), open.rows);
        match open.close() {
            Ok((path, entries)) => {
                stats.files += 1;
                self.committed.extend(entries);
                tracing::debug!("[FACT_WRITER] committed {}", path.display());
                Ok(())
            }
            Err(e) => {
                tracing::warn!("[FACT_WRITER] dropping {records} records after failed commit: {e}");
                stats.records -= records;
                stats.rows -= rows;
                Err(e)
            }
        }
    }

    fn discard(&mut self) {
        self.buffer.clear();
        self.buffered.clear();
        if let Some(open) = self.open.take() {
            open.discard();
        }
    }
}

/// Writer for one snapshot's fact files.
///
/// Not shared between threads: the lifecycle manager hands out exactly one
/// writer per snapshot and serializes calls into it.
pub struct FactWriter {
    snapshot_id: SnapshotId,
    detailed: bool,
    settings: FileSettings,
    partitions: [PartitionWriter; 2],
    stats: WriteStats,
}

impl FactWriter {
    /// Prepare `validation_records/` for `metadata` and return a writer.
    ///
    /// Existing fact files and stale in-progress files are removed.
    pub fn create(config: &StoreConfig, metadata: &SnapshotMetadata) -> Result<Self> {
        let dir = layout::validation_records_path(
            &config.base_path,
            &metadata.network_acronym,
            metadata.snapshot_id,
        );
        fs::create_dir_all(&dir).map_err(|e| Error::io_at(&dir, e))?;
        let removed = truncate_fact_dir(&dir)?;
        if removed > 0 {
            tracing::info!(
                "[FACT_WRITER] truncated {} existing files in {}",
                removed,
                dir.display()
            );
        }

        let target = records_per_file(config, metadata.estimated_record_count);
        tracing::debug!(
            "[FACT_WRITER] snapshot {} writes {} records per file",
            metadata.snapshot_id,
            target
        );

        Ok(Self {
            snapshot_id: metadata.snapshot_id,
            detailed: config.detailed_diagnostics,
            settings: FileSettings {
                dir,
                config: config.clone(),
                columns: SnapshotColumns::from_metadata(metadata),
                records_per_file: target,
            },
            partitions: [
                PartitionWriter::new(FactPartition::Valid),
                PartitionWriter::new(FactPartition::Invalid),
            ],
            stats: WriteStats::default(),
        })
    }

    pub fn snapshot_id(&self) -> SnapshotId {
        self.snapshot_id
    }

    pub fn dir(&self) -> &Path {
        &self.settings.dir
    }

    pub fn records_per_file(&self) -> u64 {
        self.settings.records_per_file
    }

    pub fn stats(&self) -> WriteStats {
        self.stats
    }

    fn slot(partition: FactPartition) -> usize {
        match partition {
            FactPartition::Valid => 0,
            FactPartition::Invalid => 1,
        }
    }

    /// Expand `record` into fact rows and buffer them.
    ///
    /// A record without rule results has no fact rows to carry it and is
    /// rejected.
    pub fn append(&mut self, record: &RecordValidation) -> Result<()> {
        if record.rules.is_empty() {
            return Err(Error::InvalidArgumentError(format!(
                "record {} has no rule results",
                record.identifier
            )));
        }
        let rows = expand_record(&self.settings.columns, record, self.detailed);
        let slot = &mut self.partitions[Self::slot(FactPartition::of(record.record_is_valid))];
        slot.buffer.extend(rows);
        slot.buffered.push(IndexEntry::of(record));
        self.stats.records += 1;

        if slot.should_flush(&self.settings) {
            slot.flush(&self.settings, &mut self.stats)?;
        }
        Ok(())
    }

    /// Flush buffered rows of every partition without closing files.
    pub fn flush(&mut self) -> Result<()> {
        for slot in &mut self.partitions {
            slot.flush(&self.settings, &mut self.stats)?;
        }
        Ok(())
    }

    /// Flush remaining rows, close every open file and write the index.
    pub fn finalize(mut self) -> Result<WriteStats> {
        for slot in &mut self.partitions {
            slot.flush(&self.settings, &mut self.stats)?;
            slot.close_current(&mut self.stats)?;
        }
        let entries: Vec<IndexEntry> = self
            .partitions
            .iter_mut()
            .flat_map(|slot| std::mem::take(&mut slot.committed))
            .collect();
        write_index(
            &self.settings.config,
            &self.settings.dir.join(VALIDATION_INDEX_FILE),
            &entries,
        )?;
        tracing::info!(
            "[FACT_WRITER] snapshot {} finalized: {} records, {} rows, {} files",
            self.snapshot_id,
            self.stats.records,
            self.stats.rows,
            self.stats.files
        );
        Ok(self.stats)
    }

    /// Drop buffered rows and remove in-progress files.
    pub fn abort(mut self) {
        self.discard_all();
    }

    fn discard_all(&mut self) {
        for slot in &mut self.partitions {
            slot.discard();
        }
    }
}

impl Drop for FactWriter {
    fn drop(&mut self) {
        self.discard_all();
    }
}

/// Remove committed and in-progress fact files and the index from `dir`.
fn truncate_fact_dir(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir).map_err(|e| Error::io_at(dir, e))? {
        let entry = entry.map_err(|e| Error::io_at(dir, e))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if layout::is_fact_file(&name)
            || name == VALIDATION_INDEX_FILE
            || name.ends_with(IN_PROGRESS_SUFFIX)
        {
            let path = entry.path();
            fs::remove_file(&path).map_err(|e| Error::io_at(&path, e))?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::read_index;
    use harvest_types::RuleFact;
    use tempfile::TempDir;

    fn record(i: usize, valid: bool) -> RecordValidation {
        RecordValidation::new(format!("oai:test:{i}"), valid, false)
            .with_rule(RuleFact::new(1, valid))
            .with_rule(RuleFact::new(2, true))
    }

    fn list_dir(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_rolls_files_at_record_target() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::new(dir.path())
            .with_dynamic_sizing(false)
            .with_records_per_file(4)
            .with_flush_threshold(3);
        let metadata = SnapshotMetadata::new(1, "test");
        let mut writer = FactWriter::create(&config, &metadata).unwrap();
        let out = writer.dir().to_path_buf();

        for i in 0..10 {
            writer.append(&record(i, true)).unwrap();
        }
        let stats = writer.finalize().unwrap();

        assert_eq!(stats.records, 10);
        assert_eq!(stats.rows, 20);
        assert_eq!(stats.files, 3);
        assert_eq!(
            list_dir(&out),
            vec![
                "part-valid-00000.parquet",
                "part-valid-00001.parquet",
                "part-valid-00002.parquet",
                "validation_index.parquet"
            ]
        );
    }

    #[test]
    fn test_splits_partitions_by_record_validity() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::new(dir.path());
        let metadata = SnapshotMetadata::new(2, "test");
        let mut writer = FactWriter::create(&config, &metadata).unwrap();
        let out = writer.dir().to_path_buf();
        writer.append(&record(0, true)).unwrap();
        writer.append(&record(1, false)).unwrap();
        writer.finalize().unwrap();

        assert_eq!(
            list_dir(&out),
            vec![
                "part-invalid-00000.parquet",
                "part-valid-00000.parquet",
                "validation_index.parquet"
            ]
        );
    }

    #[test]
    fn test_abort_leaves_no_in_progress_files() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::new(dir.path()).with_flush_threshold(1);
        let metadata = SnapshotMetadata::new(3, "test");
        let mut writer = FactWriter::create(&config, &metadata).unwrap();
        let out = writer.dir().to_path_buf();
        writer.append(&record(0, true)).unwrap();
        assert_eq!(list_dir(&out), vec!["part-valid-00000.parquet.inprogress"]);

        writer.abort();
        assert!(list_dir(&out).is_empty());
    }

    #[test]
    fn test_create_truncates_previous_output() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::new(dir.path());
        let metadata = SnapshotMetadata::new(4, "test");

        let mut writer = FactWriter::create(&config, &metadata).unwrap();
        writer.append(&record(0, true)).unwrap();
        writer.finalize().unwrap();

        let stale = layout::validation_records_path(dir.path(), "test", SnapshotId(4))
            .join("part-valid-00009.parquet.inprogress");
        fs::write(&stale, b"partial").unwrap();

        let writer = FactWriter::create(&config, &metadata).unwrap();
        assert!(list_dir(writer.dir()).is_empty());
    }

    #[test]
    fn test_rejects_record_without_rules() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::new(dir.path());
        let metadata = SnapshotMetadata::new(5, "test");
        let mut writer = FactWriter::create(&config, &metadata).unwrap();
        writer.append(&record(0, true)).unwrap();

        let err = writer
            .append(&RecordValidation::new("oai:test:bare", true, false))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgumentError(_)), "{err}");
        assert_eq!(writer.stats().records, 1);

        let stats = writer.finalize().unwrap();
        assert_eq!(stats, WriteStats { records: 1, rows: 2, files: 1 });
    }

    #[test]
    fn test_failed_commit_takes_records_back_out_of_stats() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::new(dir.path())
            .with_dynamic_sizing(false)
            .with_records_per_file(2)
            .with_flush_threshold(1);
        let metadata = SnapshotMetadata::new(6, "test");
        let mut writer = FactWriter::create(&config, &metadata).unwrap();
        let out = writer.dir().to_path_buf();
        writer.append(&record(0, true)).unwrap();
        assert_eq!(writer.stats(), WriteStats { records: 1, rows: 2, files: 0 });

        // The open file can still be written, but not renamed into place.
        fs::remove_dir_all(&out).unwrap();
        assert!(writer.append(&record(1, true)).is_err());
        assert_eq!(writer.stats(), WriteStats::default());

        fs::create_dir_all(&out).unwrap();
        writer.append(&record(2, true)).unwrap();
        let stats = writer.finalize().unwrap();
        assert_eq!(stats, WriteStats { records: 1, rows: 2, files: 1 });

        let index = read_index(&out.join(VALIDATION_INDEX_FILE)).unwrap().unwrap();
        let ids: Vec<_> = index.iter().map(|e| e.identifier.as_str()).collect();
        assert_eq!(ids, vec!["oai:test:2"]);
    }

    #[test]
    fn test_finalize_indexes_committed_records() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::new(dir.path());
        let metadata = SnapshotMetadata::new(7, "test");
        let stamp = chrono::NaiveDate::from_ymd_opt(2023, 11, 2)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        let mut writer = FactWriter::create(&config, &metadata).unwrap();
        let out = writer.dir().to_path_buf();
        writer
            .append(
                &record(0, false)
                    .with_datestamp(stamp)
                    .with_published_metadata_hash("ABC123"),
            )
            .unwrap();
        writer.append(&record(1, true)).unwrap();
        writer.finalize().unwrap();

        let index = read_index(&out.join(VALIDATION_INDEX_FILE)).unwrap().unwrap();
        assert_eq!(index.len(), 2);
        let invalid = index.iter().find(|e| !e.record_is_valid).unwrap();
        assert_eq!(invalid.identifier, "oai:test:0");
        assert_eq!(invalid.datestamp, Some(stamp));
        assert_eq!(invalid.published_metadata_hash.as_deref(), Some("ABC123"));
        let valid = index.iter().find(|e| e.record_is_valid).unwrap();
        assert_eq!(valid.datestamp, None);
    }
}
