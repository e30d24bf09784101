//! Paginated and aggregate queries over a snapshot.

use crate::filter::FilterSet;
use crate::generation::StorageGeneration;
use crate::reader::{list_fact_files, FactReader};
use crate::record::RecordFacts;
use crate::schema::FactRow;
use crate::summary::{FacetEntry, SnapshotSummary, SummaryBuilder};
use harvest_result::Result;
use harvest_types::{RuleId, SnapshotKey, SnapshotMetadata};
use rustc_hash::FxHashMap;
use serde::Serialize;

/// One page of query results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub offset: usize,
    pub limit: usize,
    /// Exact number of matches, or `None` when the scan stopped early.
    pub total: Option<u64>,
    pub has_next: bool,
}

impl<T> Page<T> {
    pub fn empty(offset: usize, limit: usize) -> Self {
        Self {
            items: Vec::new(),
            offset,
            limit,
            total: Some(0),
            has_next: false,
        }
    }
}

/// Fact rows of the records matching a filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FactPage {
    pub rows: Vec<FactRow>,
    pub total_filtered: u64,
}

/// Cumulative pagination: skip `offset`, keep `limit`, count everything.
pub fn paginate<T, I>(iter: I, offset: usize, limit: usize) -> Result<Page<T>>
where
    I: IntoIterator<Item = Result<T>>,
{
    let mut items = Vec::with_capacity(limit.min(1024));
    let mut total = 0u64;
    for item in iter {
        let item = item?;
        if total as usize >= offset && items.len() < limit {
            items.push(item);
        }
        total += 1;
    }
    Ok(Page {
        has_next: (offset as u64).saturating_add(items.len() as u64) < total,
        items,
        offset,
        limit,
        total: Some(total),
    })
}

/// Like [`paginate`], but stops after `offset + limit + 1` matches.
pub fn paginate_until_limit<T, I>(iter: I, offset: usize, limit: usize) -> Result<Page<T>>
where
    I: IntoIterator<Item = Result<T>>,
{
    let mut items = Vec::with_capacity(limit.min(1024));
    let mut seen = 0usize;
    let mut has_next = false;
    for item in iter {
        let item = item?;
        if seen >= offset {
            if items.len() == limit {
                has_next = true;
                break;
            }
            items.push(item);
        }
        seen += 1;
    }
    Ok(Page {
        items,
        offset,
        limit,
        total: None,
        has_next,
    })
}

/// Occurrence values of one rule and how often each was seen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RuleOccurrenceCounts {
    pub valid: Vec<FacetEntry>,
    pub invalid: Vec<FacetEntry>,
}

fn sorted_counts(counts: FxHashMap<String, u64>) -> Vec<FacetEntry> {
    let mut entries: Vec<FacetEntry> = counts
        .into_iter()
        .map(|(value, count)| FacetEntry { value, count })
        .collect();
    entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
    entries
}

impl FactReader {
    /// Page of fact rows belonging to records that match `filters`.
    pub fn query_with_filters(
        &self,
        key: &SnapshotKey,
        filters: &FilterSet,
        offset: usize,
        limit: usize,
    ) -> Result<FactPage> {
        let mut rows = Vec::with_capacity(limit.min(1024));
        let mut total = 0u64;
        for record in self.iterate_records(key, filters)? {
            for row in record?.rows {
                if total as usize >= offset && rows.len() < limit {
                    rows.push(row);
                }
                total += 1;
            }
        }
        Ok(FactPage {
            rows,
            total_filtered: total,
        })
    }

    /// Page of records matching `filters`.
    pub fn query_observations(
        &self,
        key: &SnapshotKey,
        filters: &FilterSet,
        offset: usize,
        limit: usize,
    ) -> Result<Page<RecordFacts>> {
        paginate(self.iterate_records(key, filters)?, offset, limit)
    }

    /// Summary of the records matching `filters`, computed in one pass.
    pub fn aggregate(&self, metadata: &SnapshotMetadata, filters: &FilterSet) -> Result<SnapshotSummary> {
        let key = metadata.key();
        let partition_count = match self.generation(&key)? {
            StorageGeneration::FactTable { dir } => list_fact_files(&dir)?.len() as u64,
            StorageGeneration::Legacy { .. } => 1,
        };
        let mut builder = SummaryBuilder::new(metadata);
        for record in self.iterate_records(&key, filters)? {
            builder.add(&record?);
        }
        let summary = builder.finish(partition_count);
        tracing::debug!(
            "[FACT_READER] aggregated {}: {} records, {} rows",
            key,
            summary.total_records,
            summary.total_fact_rows
        );
        Ok(summary)
    }

    /// Count occurrence values of `rule_id` over the records matching
    /// `filters`, split by the validity each occurrence was recorded with.
    pub fn count_rule_occurrences(
        &self,
        key: &SnapshotKey,
        rule_id: RuleId,
        filters: &FilterSet,
    ) -> Result<RuleOccurrenceCounts> {
        let mut scoped = filters.clone();
        if !scoped.any_rules.contains(&rule_id) {
            scoped.any_rules.push(rule_id);
        }

        let mut valid: FxHashMap<String, u64> = FxHashMap::default();
        let mut invalid: FxHashMap<String, u64> = FxHashMap::default();
        for record in self.iterate_records(key, &scoped)? {
            for row in record?.rows {
                if row.rule_id != rule_id {
                    continue;
                }
                let Some(value) = row.value else {
                    continue;
                };
                let side = if row.is_valid { &mut valid } else { &mut invalid };
                *side.entry(value).or_insert(0) += 1;
            }
        }
        Ok(RuleOccurrenceCounts {
            valid: sorted_counts(valid),
            invalid: sorted_counts(invalid),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_result::Error;

    fn numbers(n: u64) -> impl Iterator<Item = Result<u64>> {
        (0..n).map(Ok)
    }

    #[test]
    fn test_paginate_counts_everything() {
        let page = paginate(numbers(25), 10, 10).unwrap();
        assert_eq!(page.items, (10..20).collect::<Vec<_>>());
        assert_eq!(page.total, Some(25));
        assert!(page.has_next);

        let last = paginate(numbers(25), 20, 10).unwrap();
        assert_eq!(last.items.len(), 5);
        assert!(!last.has_next);

        let beyond = paginate(numbers(25), 40, 10).unwrap();
        assert!(beyond.items.is_empty());
        assert_eq!(beyond.total, Some(25));
    }

    #[test]
    fn test_paginate_until_limit_stops_early() {
        let mut pulled = 0;
        let iter = (0..1_000u64).map(|i| {
            pulled += 1;
            Ok(i)
        });
        let page = paginate_until_limit(iter, 5, 3).unwrap();
        assert_eq!(page.items, vec![5, 6, 7]);
        assert!(page.has_next);
        assert_eq!(page.total, None);
        assert_eq!(pulled, 9);

        let tail = paginate_until_limit(numbers(8), 5, 3).unwrap();
        assert!(!tail.has_next);
    }

    #[test]
    fn test_paginate_propagates_errors() {
        let iter = vec![Ok(1u64), Err(Error::Internal("boom".into()))];
        assert!(paginate(iter, 0, 10).is_err());
    }

    #[test]
    fn test_sorted_counts_tie_break() {
        let mut counts = FxHashMap::default();
        counts.insert("b".to_string(), 2);
        counts.insert("a".to_string(), 2);
        counts.insert("c".to_string(), 5);
        let values: Vec<_> = sorted_counts(counts).into_iter().map(|e| e.value).collect();
        assert_eq!(values, vec!["c", "a", "b"]);
    }
}
