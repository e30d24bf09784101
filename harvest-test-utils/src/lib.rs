//! Test helpers shared by the harvest crates.
//!
//! Besides tracing setup this crate builds fixtures: snapshot metadata, record
//! results, and files in the older storage generations that only exist on
//! disk today (flat observation files and columnar catalog batches).

use arrow::array::{
    ArrayRef, BooleanBuilder, Int64Builder, ListBuilder, MapBuilder, StringBuilder,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::NaiveDateTime;
use harvest_types::{
    Quantifier, RecordValidation, RuleDefinition, RuleFact, RuleId, SnapshotMetadata,
};
use parquet::arrow::ArrowWriter;
use std::fs::{self, File};
use std::path::Path;
use std::sync::{Arc, Once};

static INIT: Once = Once::new();

/// Initialize tracing for test binaries. Safe to call multiple times.
pub fn init_tracing_for_tests() {
    INIT.call_once(|| {
        use tracing_subscriber::filter::EnvFilter;
        use tracing_subscriber::fmt;
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_test_writer()
            .try_init();
    });
}

#[cfg(feature = "auto-init")]
mod auto {
    use ctor::ctor;

    #[ctor]
    fn init() {
        super::init_tracing_for_tests();
    }
}

/// Metadata with three labelled rules: 1 (mandatory title), 2 (rights), 3 (type).
pub fn sample_metadata(snapshot_id: i64, network: &str) -> SnapshotMetadata {
    SnapshotMetadata::new(snapshot_id, network)
        .with_origin("https://oai.example.org/request")
        .with_metadata_prefix("oai_dc")
        .with_rule(
            1,
            RuleDefinition::new("dc:title", Quantifier::OneOrMore, true)
                .with_description("Title is present"),
        )
        .with_rule(2, RuleDefinition::new("dc:rights", Quantifier::OneOnly, false))
        .with_rule(3, RuleDefinition::new("dc:type", Quantifier::ZeroOrMore, false))
}

pub fn record(identifier: &str, is_valid: bool, is_transformed: bool) -> RecordValidation {
    RecordValidation::new(identifier, is_valid, is_transformed)
}

pub fn rule_fact(rule_id: RuleId, is_valid: bool) -> RuleFact {
    RuleFact::new(rule_id, is_valid)
}

/// Legacy observation columns and whether each is nullable.
const LEGACY_SNAPSHOT_COLUMNS: [(&str, bool); 14] = [
    ("identifier", false),
    ("snapshotID", false),
    ("origin", true),
    ("setSpec", true),
    ("metadataPrefix", true),
    ("networkAcronym", true),
    ("repositoryName", true),
    ("institutionName", true),
    ("isValid", false),
    ("isTransformed", false),
    ("validOccurrencesByRuleID", true),
    ("invalidOccurrencesByRuleID", true),
    ("validRulesIDList", true),
    ("invalidRulesIDList", true),
];

fn append_occurrences<'a>(
    builder: &mut MapBuilder<StringBuilder, ListBuilder<StringBuilder>>,
    facts: impl Iterator<Item = (RuleId, &'a [String])>,
) -> parquet::errors::Result<()> {
    for (rule_id, values) in facts {
        if values.is_empty() {
            continue;
        }
        builder.keys().append_value(rule_id.to_string());
        for value in values {
            builder.values().values().append_value(value);
        }
        builder.values().append(true);
    }
    builder.append(true)?;
    Ok(())
}

/// Write `records` as a flat observation file, one row per record.
pub fn write_legacy_snapshot_file(
    path: &Path,
    metadata: &SnapshotMetadata,
    records: &[RecordValidation],
) -> parquet::errors::Result<()> {
    let mut identifier = StringBuilder::new();
    let mut snapshot_id = Int64Builder::new();
    let mut origin = StringBuilder::new();
    let mut set_spec = StringBuilder::new();
    let mut metadata_prefix = StringBuilder::new();
    let mut network = StringBuilder::new();
    let mut repository = StringBuilder::new();
    let mut institution = StringBuilder::new();
    let mut is_valid = BooleanBuilder::new();
    let mut is_transformed = BooleanBuilder::new();
    let mut valid_occ = MapBuilder::new(None, StringBuilder::new(), ListBuilder::new(StringBuilder::new()));
    let mut invalid_occ = MapBuilder::new(None, StringBuilder::new(), ListBuilder::new(StringBuilder::new()));
    let mut valid_rules = ListBuilder::new(StringBuilder::new());
    let mut invalid_rules = ListBuilder::new(StringBuilder::new());

    for r in records {
        identifier.append_value(&r.identifier);
        snapshot_id.append_value(metadata.snapshot_id.0);
        origin.append_value(&metadata.origin);
        set_spec.append_option(r.set_spec.as_deref());
        metadata_prefix.append_option(metadata.metadata_prefix.as_deref());
        network.append_value(&metadata.network_acronym);
        repository.append_option(r.repository.as_deref());
        institution.append_option(r.institution.as_deref());
        is_valid.append_value(r.record_is_valid);
        is_transformed.append_value(r.is_transformed);

        append_occurrences(
            &mut valid_occ,
            r.rules.iter().map(|f| (f.rule_id, f.valid_occurrences.as_slice())),
        )?;
        append_occurrences(
            &mut invalid_occ,
            r.rules.iter().map(|f| (f.rule_id, f.invalid_occurrences.as_slice())),
        )?;
        for id in r.valid_rule_ids() {
            valid_rules.values().append_value(id.to_string());
        }
        valid_rules.append(true);
        for id in r.invalid_rule_ids() {
            invalid_rules.values().append_value(id.to_string());
        }
        invalid_rules.append(true);
    }

    let columns: Vec<ArrayRef> = vec![
        Arc::new(identifier.finish()),
        Arc::new(snapshot_id.finish()),
        Arc::new(origin.finish()),
        Arc::new(set_spec.finish()),
        Arc::new(metadata_prefix.finish()),
        Arc::new(network.finish()),
        Arc::new(repository.finish()),
        Arc::new(institution.finish()),
        Arc::new(is_valid.finish()),
        Arc::new(is_transformed.finish()),
        Arc::new(valid_occ.finish()),
        Arc::new(invalid_occ.finish()),
        Arc::new(valid_rules.finish()),
        Arc::new(invalid_rules.finish()),
    ];
    // Nested types come from the builders.
    let fields: Vec<Field> = LEGACY_SNAPSHOT_COLUMNS
        .iter()
        .zip(&columns)
        .map(|((name, nullable), array)| Field::new(*name, array.data_type().clone(), *nullable))
        .collect();
    let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?;
    write_batch(path, &batch)
}

/// One row of a columnar catalog batch.
#[derive(Debug, Clone)]
pub struct LegacyCatalogRow {
    pub id: String,
    pub identifier: Option<String>,
    pub datestamp: NaiveDateTime,
    pub original_metadata_hash: Option<String>,
    pub deleted: bool,
}

impl LegacyCatalogRow {
    pub fn new(identifier: &str, datestamp: NaiveDateTime) -> Self {
        Self {
            id: harvest_types::record_id(identifier),
            identifier: Some(identifier.to_string()),
            datestamp,
            original_metadata_hash: None,
            deleted: false,
        }
    }
}

/// Write `catalog_dir/oai_records_batch_{batch}.parquet`.
pub fn write_legacy_catalog_batch(
    catalog_dir: &Path,
    batch: u64,
    rows: &[LegacyCatalogRow],
) -> parquet::errors::Result<()> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("identifier", DataType::Utf8, true),
        Field::new("datestamp", DataType::Int64, false),
        Field::new("original_metadata_hash", DataType::Utf8, true),
        Field::new("deleted", DataType::Boolean, false),
    ]));
    let mut id = StringBuilder::new();
    let mut identifier = StringBuilder::new();
    let mut datestamp = Int64Builder::new();
    let mut hash = StringBuilder::new();
    let mut deleted = BooleanBuilder::new();
    for row in rows {
        id.append_value(&row.id);
        identifier.append_option(row.identifier.as_deref());
        datestamp.append_value(row.datestamp.and_utc().timestamp_millis());
        hash.append_option(row.original_metadata_hash.as_deref());
        deleted.append_value(row.deleted);
    }
    let batch_data = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(id.finish()),
            Arc::new(identifier.finish()),
            Arc::new(datestamp.finish()),
            Arc::new(hash.finish()),
            Arc::new(deleted.finish()),
        ],
    )?;
    fs::create_dir_all(catalog_dir)?;
    write_batch(
        &catalog_dir.join(format!("oai_records_batch_{batch}.parquet")),
        &batch_data,
    )
}

fn write_batch(path: &Path, batch: &RecordBatch) -> parquet::errors::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)?;
    writer.write(batch)?;
    writer.close()?;
    Ok(())
}
