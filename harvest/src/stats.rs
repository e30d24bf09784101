//! Result shapes returned by [`crate::ValidationStatsService`].

use harvest_fact_store::{Facets, Page, RecordFacts, RuleStats, SnapshotSummary};
use harvest_types::RuleId;
use serde::Serialize;
use std::collections::BTreeMap;

/// Rule statistics and facets of a snapshot, optionally restricted by filters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationStats {
    pub size: u64,
    pub transformed_size: u64,
    pub valid_size: u64,
    pub rules_by_id: BTreeMap<RuleId, RuleStats>,
    pub facets: Facets,
}

impl From<SnapshotSummary> for ValidationStats {
    fn from(summary: SnapshotSummary) -> Self {
        Self {
            size: summary.total_records,
            transformed_size: summary.transformed_records,
            valid_size: summary.valid_records,
            rules_by_id: summary.rules,
            facets: summary.facets,
        }
    }
}

/// A page of per-record observations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationPage {
    pub content: Vec<RecordFacts>,
    pub total_elements: u64,
    pub total_pages: u64,
    pub current_page: usize,
    pub page_size: usize,
    pub has_next: bool,
    pub has_previous: bool,
}

impl ObservationPage {
    pub fn empty(page: usize, size: usize) -> Self {
        Self {
            current_page: page,
            page_size: size,
            has_previous: page > 0,
            ..Self::default()
        }
    }

    pub(crate) fn from_page(records: Page<RecordFacts>, page: usize, size: usize) -> Self {
        let total = records.total.unwrap_or(records.items.len() as u64);
        Self {
            total_pages: if size == 0 { 0 } else { total.div_ceil(size as u64) },
            total_elements: total,
            content: records.items,
            current_page: page,
            page_size: size,
            has_next: records.has_next,
            has_previous: page > 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_counts() {
        let records = Page {
            items: Vec::new(),
            offset: 20,
            limit: 10,
            total: Some(41),
            has_next: true,
        };
        let page = ObservationPage::from_page(records, 2, 10);
        assert_eq!(page.total_pages, 5);
        assert!(page.has_previous);
        assert!(page.has_next);

        let empty = ObservationPage::empty(0, 10);
        assert_eq!(empty.total_elements, 0);
        assert!(!empty.has_previous);
    }
}
