//! Flat observation files of the oldest storage generation.
//!
//! A legacy file holds one row per record with the rule outcomes as string
//! lists and the occurrences as `map<rule id, list<value>>`. Rows are projected
//! into fact rows on the fly so every query works on either generation, and
//! the projection is the same expansion the fact writer uses, so ids match
//! after migration.

use crate::schema::{
    expand_record, normalize_optional, FactRow, SnapshotColumns, COL_IS_TRANSFORMED,
    COL_RECORD_IS_VALID,
};
use crate::statistics::ColumnPredicate;
use arrow::array::{Array, AsArray, MapArray, StringArray};
use arrow::datatypes::Int64Type;
use arrow::record_batch::RecordBatch;
use harvest_result::{Error, Result};
use harvest_types::layout::sanitize_network_acronym;
use harvest_types::{RecordValidation, RuleFact, RuleId};
use rustc_hash::FxHashMap;
use std::path::Path;

pub const LEGACY_IDENTIFIER: &str = "identifier";
pub const LEGACY_SNAPSHOT_ID: &str = "snapshotID";
pub const LEGACY_ORIGIN: &str = "origin";
pub const LEGACY_SET_SPEC: &str = "setSpec";
pub const LEGACY_METADATA_PREFIX: &str = "metadataPrefix";
pub const LEGACY_NETWORK: &str = "networkAcronym";
pub const LEGACY_REPOSITORY: &str = "repositoryName";
pub const LEGACY_INSTITUTION: &str = "institutionName";
pub const LEGACY_IS_VALID: &str = "isValid";
pub const LEGACY_IS_TRANSFORMED: &str = "isTransformed";
pub const LEGACY_VALID_OCCURRENCES: &str = "validOccurrencesByRuleID";
pub const LEGACY_INVALID_OCCURRENCES: &str = "invalidOccurrencesByRuleID";
pub const LEGACY_VALID_RULES: &str = "validRulesIDList";
pub const LEGACY_INVALID_RULES: &str = "invalidRulesIDList";

/// Translate fact-table predicates to legacy column names.
///
/// Only the boolean record flags survive. Legacy rule ids live in list
/// columns, and network, institution and repository names are stored as
/// written while filters compare against normalized values, so their min/max
/// statistics cannot rule a row group out.
pub fn legacy_predicates(predicates: &[ColumnPredicate]) -> Vec<ColumnPredicate> {
    predicates
        .iter()
        .filter_map(|p| {
            let column = match p.column.as_str() {
                COL_RECORD_IS_VALID => LEGACY_IS_VALID,
                COL_IS_TRANSFORMED => LEGACY_IS_TRANSFORMED,
                _ => return None,
            };
            Some(ColumnPredicate::eq(column, p.value.clone()))
        })
        .collect()
}

fn required<'a>(batch: &'a RecordBatch, name: &str, path: &Path) -> Result<&'a dyn Array> {
    batch
        .column_by_name(name)
        .map(|c| c.as_ref())
        .ok_or_else(|| Error::corrupt(path, format!("legacy file is missing column '{name}'")))
}

fn strings<'a>(batch: &'a RecordBatch, name: &str, path: &Path) -> Result<&'a StringArray> {
    required(batch, name, path)?
        .as_string_opt::<i32>()
        .ok_or_else(|| Error::corrupt(path, format!("column '{name}' is not a string column")))
}

fn opt_strings<'a>(batch: &'a RecordBatch, name: &str, path: &Path) -> Result<Option<&'a StringArray>> {
    match batch.column_by_name(name) {
        Some(_) => strings(batch, name, path).map(Some),
        None => Ok(None),
    }
}

fn string_at(array: Option<&StringArray>, i: usize) -> Option<String> {
    array.and_then(|a| a.is_valid(i).then(|| a.value(i).to_string()))
}

fn parse_rule_id(raw: &str, path: &Path) -> Result<RuleId> {
    raw.trim()
        .parse()
        .map_err(|_| Error::corrupt(path, format!("rule id '{raw}' is not numeric")))
}

fn list_values(batch: &RecordBatch, name: &str, i: usize, path: &Path) -> Result<Vec<String>> {
    let Some(column) = batch.column_by_name(name) else {
        return Ok(Vec::new());
    };
    let list = column
        .as_list_opt::<i32>()
        .ok_or_else(|| Error::corrupt(path, format!("column '{name}' is not a list column")))?;
    if list.is_null(i) {
        return Ok(Vec::new());
    }
    let values = list.value(i);
    let values = values
        .as_string_opt::<i32>()
        .ok_or_else(|| Error::corrupt(path, format!("column '{name}' does not hold strings")))?;
    Ok(values.iter().flatten().map(str::to_string).collect())
}

fn occurrence_map(
    batch: &RecordBatch,
    name: &str,
    i: usize,
    path: &Path,
) -> Result<FxHashMap<RuleId, Vec<String>>> {
    let mut out = FxHashMap::default();
    let Some(column) = batch.column_by_name(name) else {
        return Ok(out);
    };
    let map: &MapArray = column
        .as_map_opt()
        .ok_or_else(|| Error::corrupt(path, format!("column '{name}' is not a map column")))?;
    if map.is_null(i) {
        return Ok(out);
    }
    let entries = map.value(i);
    let keys = entries
        .column(0)
        .as_string_opt::<i32>()
        .ok_or_else(|| Error::corrupt(path, format!("map '{name}' keys are not strings")))?;
    let values = entries
        .column(1)
        .as_list_opt::<i32>()
        .ok_or_else(|| Error::corrupt(path, format!("map '{name}' values are not lists")))?;
    for j in 0..entries.len() {
        if keys.is_null(j) || values.is_null(j) {
            continue;
        }
        let rule_id = parse_rule_id(keys.value(j), path)?;
        let list = values.value(j);
        let list = list
            .as_string_opt::<i32>()
            .ok_or_else(|| Error::corrupt(path, format!("map '{name}' lists do not hold strings")))?;
        out.entry(rule_id)
            .or_insert_with(Vec::new)
            .extend(list.iter().flatten().map(str::to_string));
    }
    Ok(out)
}

/// Decode one legacy observation batch into record results plus the snapshot
/// columns of each row.
///
/// Rows without a network acronym take `fallback_network`.
pub fn batch_to_records(
    batch: &RecordBatch,
    path: &Path,
    fallback_network: &str,
) -> Result<Vec<(SnapshotColumns, RecordValidation)>> {
    let identifier = strings(batch, LEGACY_IDENTIFIER, path)?;
    let snapshot_id = required(batch, LEGACY_SNAPSHOT_ID, path)?
        .as_primitive_opt::<Int64Type>()
        .ok_or_else(|| Error::corrupt(path, "snapshotID is not an int64 column"))?;
    let is_valid = required(batch, LEGACY_IS_VALID, path)?
        .as_boolean_opt()
        .ok_or_else(|| Error::corrupt(path, "isValid is not a boolean column"))?;
    let is_transformed = required(batch, LEGACY_IS_TRANSFORMED, path)?
        .as_boolean_opt()
        .ok_or_else(|| Error::corrupt(path, "isTransformed is not a boolean column"))?;
    let origin = opt_strings(batch, LEGACY_ORIGIN, path)?;
    let set_spec = opt_strings(batch, LEGACY_SET_SPEC, path)?;
    let metadata_prefix = opt_strings(batch, LEGACY_METADATA_PREFIX, path)?;
    let network = opt_strings(batch, LEGACY_NETWORK, path)?;
    let repository = opt_strings(batch, LEGACY_REPOSITORY, path)?;
    let institution = opt_strings(batch, LEGACY_INSTITUTION, path)?;

    let mut out = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        if identifier.is_null(i) || snapshot_id.is_null(i) {
            return Err(Error::corrupt(path, format!("row {i} has no identifier or snapshot id")));
        }
        let columns = SnapshotColumns {
            snapshot_id: snapshot_id.value(i),
            origin: string_at(origin, i).unwrap_or_default(),
            network: match string_at(network, i) {
                Some(acronym) if !acronym.trim().is_empty() => sanitize_network_acronym(&acronym),
                _ => sanitize_network_acronym(fallback_network),
            },
            metadata_prefix: normalize_optional(string_at(metadata_prefix, i).as_deref()),
        };

        let mut record = RecordValidation::new(
            identifier.value(i),
            is_valid.is_valid(i) && is_valid.value(i),
            is_transformed.is_valid(i) && is_transformed.value(i),
        );
        record.repository = string_at(repository, i);
        record.institution = string_at(institution, i);
        record.set_spec = string_at(set_spec, i);

        let mut valid_occurrences = occurrence_map(batch, LEGACY_VALID_OCCURRENCES, i, path)?;
        let mut invalid_occurrences = occurrence_map(batch, LEGACY_INVALID_OCCURRENCES, i, path)?;
        let rules = list_values(batch, LEGACY_VALID_RULES, i, path)?
            .into_iter()
            .map(|r| (r, true))
            .chain(
                list_values(batch, LEGACY_INVALID_RULES, i, path)?
                    .into_iter()
                    .map(|r| (r, false)),
            );
        for (raw, valid) in rules {
            let rule_id = parse_rule_id(&raw, path)?;
            let mut fact = RuleFact::new(rule_id, valid);
            fact.valid_occurrences = valid_occurrences.remove(&rule_id).unwrap_or_default();
            fact.invalid_occurrences = invalid_occurrences.remove(&rule_id).unwrap_or_default();
            record.rules.push(fact);
        }
        out.push((columns, record));
    }
    Ok(out)
}

/// Decode one legacy observation batch straight into fact rows.
pub fn batch_to_rows(batch: &RecordBatch, path: &Path, fallback_network: &str) -> Result<Vec<FactRow>> {
    Ok(batch_to_records(batch, path, fallback_network)?
        .iter()
        .flat_map(|(columns, record)| expand_record(columns, record, true))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statistics::StatValue;

    #[test]
    fn test_legacy_predicates_keep_only_record_flags() {
        let preds = vec![
            ColumnPredicate::eq(COL_RECORD_IS_VALID, StatValue::Bool(true)),
            ColumnPredicate::eq(crate::schema::COL_RULE_ID, StatValue::Int32(3)),
            ColumnPredicate::eq(crate::schema::COL_INSTITUTION, StatValue::Utf8("X".into())),
            ColumnPredicate::eq(crate::schema::COL_REPOSITORY, StatValue::Utf8("R".into())),
            ColumnPredicate::eq(COL_IS_TRANSFORMED, StatValue::Bool(false)),
        ];
        let mapped = legacy_predicates(&preds);
        assert_eq!(
            mapped,
            vec![
                ColumnPredicate::eq(LEGACY_IS_VALID, StatValue::Bool(true)),
                ColumnPredicate::eq(LEGACY_IS_TRANSFORMED, StatValue::Bool(false)),
            ]
        );
    }
}
