//! Fixed schema of the validation fact table and conversions between
//! [`FactRow`]s and Arrow record batches.

use arrow::array::{
    Array, ArrayRef, BooleanArray, BooleanBuilder, Int32Array, Int32Builder, Int64Array,
    Int64Builder, StringArray, StringBuilder,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use harvest_result::{Error, Result};
use harvest_types::{fact_id, RecordValidation, RuleId, SnapshotMetadata};
use rustc_hash::FxHashSet;
use serde::Serialize;
use std::sync::{Arc, OnceLock};

pub const COL_ID: &str = "id";
pub const COL_IDENTIFIER: &str = "identifier";
pub const COL_SNAPSHOT_ID: &str = "snapshot_id";
pub const COL_ORIGIN: &str = "origin";
pub const COL_NETWORK: &str = "network";
pub const COL_REPOSITORY: &str = "repository";
pub const COL_INSTITUTION: &str = "institution";
pub const COL_RULE_ID: &str = "rule_id";
pub const COL_VALUE: &str = "value";
pub const COL_IS_VALID: &str = "is_valid";
pub const COL_RECORD_IS_VALID: &str = "record_is_valid";
pub const COL_IS_TRANSFORMED: &str = "is_transformed";
pub const COL_METADATA_PREFIX: &str = "metadata_prefix";
pub const COL_SET_SPEC: &str = "set_spec";

/// Low-cardinality columns that get dictionary encoding.
pub const DICTIONARY_COLUMNS: [&str; 4] = [COL_NETWORK, COL_REPOSITORY, COL_INSTITUTION, COL_RULE_ID];

/// The 14-column fact schema shared by every fact file.
pub fn fact_schema() -> SchemaRef {
    static SCHEMA: OnceLock<SchemaRef> = OnceLock::new();
    SCHEMA
        .get_or_init(|| {
            Arc::new(Schema::new(vec![
                Field::new(COL_ID, DataType::Utf8, false),
                Field::new(COL_IDENTIFIER, DataType::Utf8, false),
                Field::new(COL_SNAPSHOT_ID, DataType::Int64, false),
                Field::new(COL_ORIGIN, DataType::Utf8, false),
                Field::new(COL_NETWORK, DataType::Utf8, false),
                Field::new(COL_REPOSITORY, DataType::Utf8, true),
                Field::new(COL_INSTITUTION, DataType::Utf8, true),
                Field::new(COL_RULE_ID, DataType::Int32, false),
                Field::new(COL_VALUE, DataType::Utf8, true),
                Field::new(COL_IS_VALID, DataType::Boolean, false),
                Field::new(COL_RECORD_IS_VALID, DataType::Boolean, false),
                Field::new(COL_IS_TRANSFORMED, DataType::Boolean, false),
                Field::new(COL_METADATA_PREFIX, DataType::Utf8, true),
                Field::new(COL_SET_SPEC, DataType::Utf8, true),
            ]))
        })
        .clone()
}

/// One rule application (or one occurrence of it) on one record.
///
/// Rows with `value == None` carry the rule-level outcome; rows with a value
/// carry one occurrence found while evaluating the rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FactRow {
    pub id: String,
    pub identifier: String,
    pub snapshot_id: i64,
    pub origin: String,
    pub network: String,
    pub repository: Option<String>,
    pub institution: Option<String>,
    pub rule_id: RuleId,
    pub value: Option<String>,
    pub is_valid: bool,
    pub record_is_valid: bool,
    pub is_transformed: bool,
    pub metadata_prefix: Option<String>,
    pub set_spec: Option<String>,
}

impl FactRow {
    pub fn is_rule_row(&self) -> bool {
        self.value.is_none()
    }
}

/// Trim an optional string and map blank values to `None`.
pub fn normalize_optional(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Snapshot-level columns copied onto every row written for a snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotColumns {
    pub snapshot_id: i64,
    pub origin: String,
    pub network: String,
    pub metadata_prefix: Option<String>,
}

impl SnapshotColumns {
    pub fn from_metadata(metadata: &SnapshotMetadata) -> Self {
        Self {
            snapshot_id: metadata.snapshot_id.0,
            origin: metadata.origin.clone(),
            network: metadata.network(),
            metadata_prefix: normalize_optional(metadata.metadata_prefix.as_deref()),
        }
    }

    fn row(
        &self,
        record: &RecordValidation,
        rule_id: RuleId,
        value: Option<String>,
        is_valid: bool,
    ) -> FactRow {
        FactRow {
            id: fact_id(&record.identifier, rule_id, value.as_deref(), is_valid),
            identifier: record.identifier.clone(),
            snapshot_id: self.snapshot_id,
            origin: self.origin.clone(),
            network: self.network.clone(),
            repository: normalize_optional(record.repository.as_deref()),
            institution: normalize_optional(record.institution.as_deref()),
            rule_id,
            value,
            is_valid,
            record_is_valid: record.record_is_valid,
            is_transformed: record.is_transformed,
            metadata_prefix: self.metadata_prefix.clone(),
            set_spec: normalize_optional(record.set_spec.as_deref()),
        }
    }
}

/// Expand one record result into fact rows.
///
/// Every rule yields one rule row (`value = None`). With `detailed` set, each
/// distinct non-blank occurrence additionally yields an occurrence row whose
/// validity is that of the list it came from; repeated
/// `(rule_id, value, is_valid)` triples within the record are dropped.
pub fn expand_record(
    columns: &SnapshotColumns,
    record: &RecordValidation,
    detailed: bool,
) -> Vec<FactRow> {
    let mut rows = Vec::with_capacity(record.rules.len());
    let mut seen: FxHashSet<(RuleId, String, bool)> = FxHashSet::default();

    for fact in &record.rules {
        rows.push(columns.row(record, fact.rule_id, None, fact.is_valid));
        if !detailed {
            continue;
        }
        let occurrences = fact
            .valid_occurrences
            .iter()
            .map(|v| (v, true))
            .chain(fact.invalid_occurrences.iter().map(|v| (v, false)));
        for (raw, valid) in occurrences {
            let Some(value) = normalize_optional(Some(raw)) else {
                continue;
            };
            if seen.insert((fact.rule_id, value.clone(), valid)) {
                rows.push(columns.row(record, fact.rule_id, Some(value), valid));
            }
        }
    }
    rows
}

/// Build a record batch in [`fact_schema`] order.
pub fn rows_to_batch(rows: &[FactRow]) -> Result<RecordBatch> {
    let len = rows.len();
    let mut id = StringBuilder::with_capacity(len, len * 16);
    let mut identifier = StringBuilder::with_capacity(len, len * 32);
    let mut snapshot_id = Int64Builder::with_capacity(len);
    let mut origin = StringBuilder::with_capacity(len, len * 32);
    let mut network = StringBuilder::with_capacity(len, len * 8);
    let mut repository = StringBuilder::with_capacity(len, len * 16);
    let mut institution = StringBuilder::with_capacity(len, len * 16);
    let mut rule_id = Int32Builder::with_capacity(len);
    let mut value = StringBuilder::with_capacity(len, len * 8);
    let mut is_valid = BooleanBuilder::with_capacity(len);
    let mut record_is_valid = BooleanBuilder::with_capacity(len);
    let mut is_transformed = BooleanBuilder::with_capacity(len);
    let mut metadata_prefix = StringBuilder::with_capacity(len, len * 8);
    let mut set_spec = StringBuilder::with_capacity(len, len * 8);

    for row in rows {
        id.append_value(&row.id);
        identifier.append_value(&row.identifier);
        snapshot_id.append_value(row.snapshot_id);
        origin.append_value(&row.origin);
        network.append_value(&row.network);
        repository.append_option(row.repository.as_deref());
        institution.append_option(row.institution.as_deref());
        rule_id.append_value(row.rule_id);
        value.append_option(row.value.as_deref());
        is_valid.append_value(row.is_valid);
        record_is_valid.append_value(row.record_is_valid);
        is_transformed.append_value(row.is_transformed);
        metadata_prefix.append_option(row.metadata_prefix.as_deref());
        set_spec.append_option(row.set_spec.as_deref());
    }

    let columns: Vec<ArrayRef> = vec![
        Arc::new(id.finish()),
        Arc::new(identifier.finish()),
        Arc::new(snapshot_id.finish()),
        Arc::new(origin.finish()),
        Arc::new(network.finish()),
        Arc::new(repository.finish()),
        Arc::new(institution.finish()),
        Arc::new(rule_id.finish()),
        Arc::new(value.finish()),
        Arc::new(is_valid.finish()),
        Arc::new(record_is_valid.finish()),
        Arc::new(is_transformed.finish()),
        Arc::new(metadata_prefix.finish()),
        Arc::new(set_spec.finish()),
    ];
    Ok(RecordBatch::try_new(fact_schema(), columns)?)
}

pub(crate) fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| {
            Error::InvalidArgumentError(format!("fact batch is missing column '{name}'"))
        })
}

pub(crate) fn opt_str(array: &StringArray, i: usize) -> Option<String> {
    array.is_valid(i).then(|| array.value(i).to_string())
}

/// Decode a record batch written with [`fact_schema`] back into rows.
pub fn batch_to_rows(batch: &RecordBatch) -> Result<Vec<FactRow>> {
    let id = column::<StringArray>(batch, COL_ID)?;
    let identifier = column::<StringArray>(batch, COL_IDENTIFIER)?;
    let snapshot_id = column::<Int64Array>(batch, COL_SNAPSHOT_ID)?;
    let origin = column::<StringArray>(batch, COL_ORIGIN)?;
    let network = column::<StringArray>(batch, COL_NETWORK)?;
    let repository = column::<StringArray>(batch, COL_REPOSITORY)?;
    let institution = column::<StringArray>(batch, COL_INSTITUTION)?;
    let rule_id = column::<Int32Array>(batch, COL_RULE_ID)?;
    let value = column::<StringArray>(batch, COL_VALUE)?;
    let is_valid = column::<BooleanArray>(batch, COL_IS_VALID)?;
    let record_is_valid = column::<BooleanArray>(batch, COL_RECORD_IS_VALID)?;
    let is_transformed = column::<BooleanArray>(batch, COL_IS_TRANSFORMED)?;
    let metadata_prefix = column::<StringArray>(batch, COL_METADATA_PREFIX)?;
    let set_spec = column::<StringArray>(batch, COL_SET_SPEC)?;

    Ok((0..batch.num_rows())
        .map(|i| FactRow {
            id: id.value(i).to_string(),
            identifier: identifier.value(i).to_string(),
            snapshot_id: snapshot_id.value(i),
            origin: origin.value(i).to_string(),
            network: network.value(i).to_string(),
            repository: opt_str(repository, i),
            institution: opt_str(institution, i),
            rule_id: rule_id.value(i),
            value: opt_str(value, i),
            is_valid: is_valid.value(i),
            record_is_valid: record_is_valid.value(i),
            is_transformed: is_transformed.value(i),
            metadata_prefix: opt_str(metadata_prefix, i),
            set_spec: opt_str(set_spec, i),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_types::RuleFact;

    fn columns() -> SnapshotColumns {
        SnapshotColumns::from_metadata(
            &SnapshotMetadata::new(8, "LA Referencia")
                .with_origin("https://oai.example.org")
                .with_metadata_prefix(" oai_dc "),
        )
    }

    #[test]
    fn test_schema_has_fourteen_columns() {
        let schema = fact_schema();
        assert_eq!(schema.fields().len(), 14);
        assert!(!schema.field_with_name(COL_RULE_ID).unwrap().is_nullable());
        assert!(schema.field_with_name(COL_VALUE).unwrap().is_nullable());
    }

    #[test]
    fn test_expand_one_row_per_rule() {
        let record = RecordValidation::new("oai:x:1", false, true)
            .with_repository("  ")
            .with_rule(RuleFact::new(1, true))
            .with_rule(RuleFact::new(2, false));
        let rows = expand_record(&columns(), &record, false);

        assert_eq!(rows.len(), 2);
        for row in &rows {
            assert_eq!(row.identifier, "oai:x:1");
            assert_eq!(row.snapshot_id, 8);
            assert_eq!(row.network, "LA_REFERENCIA");
            assert!(!row.record_is_valid);
            assert!(row.is_transformed);
            assert_eq!(row.repository, None);
            assert_eq!(row.metadata_prefix.as_deref(), Some("oai_dc"));
            assert!(row.is_rule_row());
        }
        assert_ne!(rows[0].id, rows[1].id);
    }

    #[test]
    fn test_expand_detailed_dedupes_occurrences() {
        let record = RecordValidation::new("oai:x:2", true, false).with_rule(
            RuleFact::new(5, true)
                .with_valid_occurrences(["en", "en ", "es", ""])
                .with_invalid_occurrences(["xx", "en"]),
        );
        let rows = expand_record(&columns(), &record, true);

        let occurrences: Vec<_> = rows
            .iter()
            .filter(|r| !r.is_rule_row())
            .map(|r| (r.value.clone().unwrap(), r.is_valid))
            .collect();
        assert_eq!(
            occurrences,
            vec![
                ("en".to_string(), true),
                ("es".to_string(), true),
                ("xx".to_string(), false),
                ("en".to_string(), false),
            ]
        );
        assert_eq!(rows.iter().filter(|r| r.is_rule_row()).count(), 1);
    }

    #[test]
    fn test_batch_conversion_preserves_nulls() {
        let record = RecordValidation::new("oai:x:3", true, false)
            .with_institution("Universidad")
            .with_rule(RuleFact::new(1, true).with_valid_occurrences(["v"]));
        let rows = expand_record(&columns(), &record, true);
        let batch = rows_to_batch(&rows).unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch_to_rows(&batch).unwrap(), rows);
    }
}
