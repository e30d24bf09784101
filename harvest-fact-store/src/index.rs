//! Per-record validation index.
//!
//! `validation_index.parquet` sits next to the fact files and holds one row per
//! committed record: the record-level outcome plus the OAI datestamp and the
//! hash of the published metadata. Status and identifier lookups read it
//! instead of decoding fact rows.

use crate::record::RecordFacts;
use crate::schema::{
    column, normalize_optional, opt_str, COL_IDENTIFIER, COL_IS_TRANSFORMED, COL_RECORD_IS_VALID,
};
use crate::writer::compression;
use arrow::array::{
    Array, ArrayRef, BooleanArray, BooleanBuilder, StringArray, StringBuilder,
    TimestampMillisecondArray, TimestampMillisecondBuilder,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, NaiveDateTime};
use harvest_result::{Error, Result};
use harvest_types::layout::IN_PROGRESS_SUFFIX;
use harvest_types::{RecordValidation, StoreConfig};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::{EnabledStatistics, WriterProperties};
use serde::Serialize;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

pub const COL_DATESTAMP: &str = "datestamp";
pub const COL_PUBLISHED_METADATA_HASH: &str = "published_metadata_hash";

/// Entries encoded per Arrow batch when writing or reading the index.
const INDEX_BATCH_SIZE: usize = 65_536;

pub fn index_schema() -> SchemaRef {
    static SCHEMA: OnceLock<SchemaRef> = OnceLock::new();
    SCHEMA
        .get_or_init(|| {
            Arc::new(Schema::new(vec![
                Field::new(COL_IDENTIFIER, DataType::Utf8, false),
                Field::new(
                    COL_DATESTAMP,
                    DataType::Timestamp(TimeUnit::Millisecond, None),
                    true,
                ),
                Field::new(COL_RECORD_IS_VALID, DataType::Boolean, false),
                Field::new(COL_IS_TRANSFORMED, DataType::Boolean, false),
                Field::new(COL_PUBLISHED_METADATA_HASH, DataType::Utf8, true),
            ]))
        })
        .clone()
}

/// Record-level view of one validated record, without its rule results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexEntry {
    pub identifier: String,
    pub datestamp: Option<NaiveDateTime>,
    pub record_is_valid: bool,
    pub is_transformed: bool,
    pub published_metadata_hash: Option<String>,
}

impl IndexEntry {
    pub fn of(record: &RecordValidation) -> Self {
        Self {
            identifier: record.identifier.clone(),
            datestamp: record.datestamp,
            record_is_valid: record.record_is_valid,
            is_transformed: record.is_transformed,
            published_metadata_hash: normalize_optional(record.published_metadata_hash.as_deref()),
        }
    }

    /// Entry rebuilt from fact rows. Fact rows carry neither datestamp nor hash.
    pub fn from_record_facts(record: &RecordFacts) -> Self {
        Self {
            identifier: record.identifier.clone(),
            datestamp: None,
            record_is_valid: record.record_is_valid,
            is_transformed: record.is_transformed,
            published_metadata_hash: None,
        }
    }
}

fn entries_to_batch(entries: &[IndexEntry]) -> Result<RecordBatch> {
    let len = entries.len();
    let mut identifier = StringBuilder::with_capacity(len, len * 32);
    let mut datestamp = TimestampMillisecondBuilder::with_capacity(len);
    let mut record_is_valid = BooleanBuilder::with_capacity(len);
    let mut is_transformed = BooleanBuilder::with_capacity(len);
    let mut hash = StringBuilder::with_capacity(len, len * 32);

    for entry in entries {
        identifier.append_value(&entry.identifier);
        datestamp.append_option(entry.datestamp.map(|d| d.and_utc().timestamp_millis()));
        record_is_valid.append_value(entry.record_is_valid);
        is_transformed.append_value(entry.is_transformed);
        hash.append_option(entry.published_metadata_hash.as_deref());
    }

    let columns: Vec<ArrayRef> = vec![
        Arc::new(identifier.finish()),
        Arc::new(datestamp.finish()),
        Arc::new(record_is_valid.finish()),
        Arc::new(is_transformed.finish()),
        Arc::new(hash.finish()),
    ];
    Ok(RecordBatch::try_new(index_schema(), columns)?)
}

fn batch_to_entries(batch: &RecordBatch) -> Result<Vec<IndexEntry>> {
    let identifier = column::<StringArray>(batch, COL_IDENTIFIER)?;
    let datestamp = column::<TimestampMillisecondArray>(batch, COL_DATESTAMP)?;
    let record_is_valid = column::<BooleanArray>(batch, COL_RECORD_IS_VALID)?;
    let is_transformed = column::<BooleanArray>(batch, COL_IS_TRANSFORMED)?;
    let hash = column::<StringArray>(batch, COL_PUBLISHED_METADATA_HASH)?;

    (0..batch.num_rows())
        .map(|i| {
            let datestamp = if datestamp.is_valid(i) {
                let millis = datestamp.value(i);
                let parsed = DateTime::from_timestamp_millis(millis).ok_or_else(|| {
                    Error::InvalidArgumentError(format!("datestamp {millis} is out of range"))
                })?;
                Some(parsed.naive_utc())
            } else {
                None
            };
            Ok(IndexEntry {
                identifier: identifier.value(i).to_string(),
                datestamp,
                record_is_valid: record_is_valid.value(i),
                is_transformed: is_transformed.value(i),
                published_metadata_hash: opt_str(hash, i),
            })
        })
        .collect()
}

/// Write `entries` to `path`, replacing any previous index.
///
/// The file is written under an in-progress name and renamed once closed.
pub fn write_index(config: &StoreConfig, path: &Path, entries: &[IndexEntry]) -> Result<()> {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(IN_PROGRESS_SUFFIX);
    let tmp = PathBuf::from(tmp);

    let props = WriterProperties::builder()
        .set_compression(compression(config.compression)?)
        .set_statistics_enabled(EnabledStatistics::Chunk)
        .build();
    let file = File::create(&tmp).map_err(|e| Error::io_at(&tmp, e))?;
    let result = (|| {
        let mut writer = ArrowWriter::try_new(file, index_schema(), Some(props))?;
        for chunk in entries.chunks(INDEX_BATCH_SIZE) {
            writer.write(&entries_to_batch(chunk)?)?;
        }
        writer.close()?;
        Ok::<_, Error>(())
    })();
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(match e {
            Error::Parquet(e) => Error::io_at(&tmp, io::Error::other(e)),
            other => other,
        });
    }
    fs::rename(&tmp, path).map_err(|e| Error::io_at(path, e))?;
    tracing::debug!(
        "[FACT_WRITER] wrote index of {} records to {}",
        entries.len(),
        path.display()
    );
    Ok(())
}

/// Load every entry of the index at `path`. A missing index is `None`.
pub fn read_index(path: &Path) -> Result<Option<Vec<IndexEntry>>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::io_at(path, e)),
    };
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(|e| Error::corrupt(path, e))?
        .with_batch_size(INDEX_BATCH_SIZE)
        .build()
        .map_err(|e| Error::corrupt(path, e))?;

    let mut entries = Vec::new();
    for batch in reader {
        let batch = batch.map_err(|e| Error::corrupt(path, e))?;
        entries.extend(batch_to_entries(&batch).map_err(|e| Error::corrupt(path, e))?);
    }
    tracing::trace!("[FACT_READER] loaded {} index entries from {}", entries.len(), path.display());
    Ok(Some(entries))
}
