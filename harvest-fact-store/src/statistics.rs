//! Row-group statistics and predicate pruning.
//!
//! Equality predicates derived from filters are evaluated against the min/max
//! statistics Parquet keeps per column chunk. A row group is skipped only when
//! its statistics prove that no row can match; missing or undecodable
//! statistics always keep the row group.

use crate::types::ColumnStats;
use parquet::file::metadata::RowGroupMetaData;
use rustc_hash::FxHashMap;
use std::cmp::Ordering;

/// Literal value a column is compared against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatValue {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Utf8(String),
}

/// `column = value`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnPredicate {
    pub column: String,
    pub value: StatValue,
}

impl ColumnPredicate {
    pub fn eq(column: impl Into<String>, value: StatValue) -> Self {
        Self {
            column: column.into(),
            value,
        }
    }
}

/// Collect min/max statistics of every top-level column in a row group.
pub fn row_group_stats(row_group: &RowGroupMetaData) -> FxHashMap<String, ColumnStats> {
    let mut stats = FxHashMap::default();
    for column in row_group.columns() {
        let Some(statistics) = column.statistics() else {
            continue;
        };
        stats.insert(
            column.column_path().string(),
            ColumnStats {
                min: statistics.min_bytes_opt().map(<[u8]>::to_vec),
                max: statistics.max_bytes_opt().map(<[u8]>::to_vec),
                null_count: statistics.null_count_opt().unwrap_or(0),
            },
        );
    }
    stats
}

/// Whether a row group may contain rows satisfying every predicate.
pub fn row_group_may_match(row_group: &RowGroupMetaData, predicates: &[ColumnPredicate]) -> bool {
    if predicates.is_empty() {
        return true;
    }
    let stats = row_group_stats(row_group);
    predicates.iter().all(|predicate| match stats.get(&predicate.column) {
        Some(column_stats) => evaluate_eq(column_stats, &predicate.value),
        None => true,
    })
}

/// Evaluate: col = value. Matches if `min <= value <= max`.
fn evaluate_eq(stats: &ColumnStats, value: &StatValue) -> bool {
    let min_lte = compare_stat_to_value(stats.min.as_deref(), value, |cmp| cmp != Ordering::Greater);
    let max_gte = compare_stat_to_value(stats.max.as_deref(), value, |cmp| cmp != Ordering::Less);
    min_lte && max_gte
}

/// Compare raw statistic bytes to a literal, type-aware.
fn compare_stat_to_value<F>(stat_bytes: Option<&[u8]>, value: &StatValue, cmp_fn: F) -> bool
where
    F: Fn(Ordering) -> bool,
{
    let Some(bytes) = stat_bytes else {
        return true;
    };
    match value {
        StatValue::Bool(v) => match bytes {
            [b] => cmp_fn((*b != 0).cmp(v)),
            _ => true,
        },
        StatValue::Int32(v) => match <[u8; 4]>::try_from(bytes) {
            Ok(raw) => cmp_fn(i32::from_le_bytes(raw).cmp(v)),
            Err(_) => true,
        },
        StatValue::Int64(v) => match <[u8; 8]>::try_from(bytes) {
            Ok(raw) => cmp_fn(i64::from_le_bytes(raw).cmp(v)),
            Err(_) => true,
        },
        // Byte-wise order equals Parquet's unsigned order for UTF-8.
        StatValue::Utf8(v) => cmp_fn(bytes.cmp(v.as_bytes())),
    }
}
