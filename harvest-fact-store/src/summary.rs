//! Per-snapshot statistics and their on-disk cache.
//!
//! A [`SnapshotSummary`] is derived data: it can always be rebuilt from the
//! fact rows, and a cache file that fails to load is recomputed rather than
//! trusted.

use crate::filter::FilterSet;
use crate::reader::FactReader;
use crate::record::RecordFacts;
use chrono::{DateTime, Utc};
use harvest_result::{Error, Result};
use harvest_types::layout::validation_stats_path;
use harvest_types::metadata::write_json_atomic;
use harvest_types::{Quantifier, RuleId, SnapshotId, SnapshotKey, SnapshotMetadata};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

/// Version written into every summary; caches with another version are stale.
pub const SUMMARY_VERSION: &str = "1.0";

/// Record counts of one rule, labelled with its definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleStats {
    pub rule_id: RuleId,
    pub name: String,
    pub description: Option<String>,
    pub quantifier: Option<Quantifier>,
    pub mandatory: bool,
    pub valid_count: u64,
    pub invalid_count: u64,
}

impl RuleStats {
    fn unlabelled(rule_id: RuleId) -> Self {
        Self {
            rule_id,
            name: rule_id.to_string(),
            description: None,
            quantifier: None,
            mandatory: false,
            valid_count: 0,
            invalid_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetEntry {
    pub value: String,
    pub count: u64,
}

/// Record counts grouped by a record attribute.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Facets {
    pub record_is_valid: Vec<FacetEntry>,
    pub record_is_transformed: Vec<FacetEntry>,
    pub institution_name: Vec<FacetEntry>,
    pub repository_name: Vec<FacetEntry>,
    pub valid_rules: Vec<FacetEntry>,
    pub invalid_rules: Vec<FacetEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub snapshot_id: SnapshotId,
    pub total_records: u64,
    pub valid_records: u64,
    pub transformed_records: u64,
    pub rules: BTreeMap<RuleId, RuleStats>,
    pub facets: Facets,
    pub partition_count: u64,
    pub total_fact_rows: u64,
    pub created_at: DateTime<Utc>,
    pub version: String,
}

impl SnapshotSummary {
    pub fn invalid_records(&self) -> u64 {
        self.total_records - self.valid_records
    }
}

#[derive(Debug, Default)]
struct FacetCounter(FxHashMap<String, u64>);

impl FacetCounter {
    fn add(&mut self, value: impl Into<String>) {
        *self.0.entry(value.into()).or_insert(0) += 1;
    }

    /// Count descending, ties by value ascending.
    fn into_sorted(self) -> Vec<FacetEntry> {
        let mut entries: Vec<FacetEntry> = self
            .0
            .into_iter()
            .map(|(value, count)| FacetEntry { value, count })
            .collect();
        entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
        entries
    }
}

/// One-pass accumulator over the records of a snapshot.
#[derive(Debug)]
pub struct SummaryBuilder {
    snapshot_id: SnapshotId,
    total_records: u64,
    valid_records: u64,
    transformed_records: u64,
    total_fact_rows: u64,
    rules: BTreeMap<RuleId, RuleStats>,
    record_is_valid: FacetCounter,
    record_is_transformed: FacetCounter,
    institution_name: FacetCounter,
    repository_name: FacetCounter,
    valid_rules: FacetCounter,
    invalid_rules: FacetCounter,
}

impl SummaryBuilder {
    /// Start a summary with every rule of `metadata` at zero.
    pub fn new(metadata: &SnapshotMetadata) -> Self {
        let rules = metadata
            .rules
            .iter()
            .map(|(&rule_id, def)| {
                let stats = RuleStats {
                    rule_id,
                    name: def.name.clone(),
                    description: def.description.clone(),
                    quantifier: Some(def.quantifier),
                    mandatory: def.mandatory,
                    valid_count: 0,
                    invalid_count: 0,
                };
                (rule_id, stats)
            })
            .collect();
        Self {
            snapshot_id: metadata.snapshot_id,
            total_records: 0,
            valid_records: 0,
            transformed_records: 0,
            total_fact_rows: 0,
            rules,
            record_is_valid: FacetCounter::default(),
            record_is_transformed: FacetCounter::default(),
            institution_name: FacetCounter::default(),
            repository_name: FacetCounter::default(),
            valid_rules: FacetCounter::default(),
            invalid_rules: FacetCounter::default(),
        }
    }

    pub fn add(&mut self, record: &RecordFacts) {
        self.total_records += 1;
        self.total_fact_rows += record.rows.len() as u64;
        if record.record_is_valid {
            self.valid_records += 1;
        }
        if record.is_transformed {
            self.transformed_records += 1;
        }
        self.record_is_valid.add(record.record_is_valid.to_string());
        self.record_is_transformed.add(record.is_transformed.to_string());
        if let Some(institution) = &record.institution {
            self.institution_name.add(institution.as_str());
        }
        if let Some(repository) = &record.repository {
            self.repository_name.add(repository.as_str());
        }

        for rule_id in record.valid_rule_ids() {
            self.rule_entry(rule_id).valid_count += 1;
            self.valid_rules.add(rule_id.to_string());
        }
        for rule_id in record.invalid_rule_ids() {
            self.rule_entry(rule_id).invalid_count += 1;
            self.invalid_rules.add(rule_id.to_string());
        }
    }

    fn rule_entry(&mut self, rule_id: RuleId) -> &mut RuleStats {
        self.rules
            .entry(rule_id)
            .or_insert_with(|| RuleStats::unlabelled(rule_id))
    }

    pub fn finish(self, partition_count: u64) -> SnapshotSummary {
        SnapshotSummary {
            snapshot_id: self.snapshot_id,
            total_records: self.total_records,
            valid_records: self.valid_records,
            transformed_records: self.transformed_records,
            rules: self.rules,
            facets: Facets {
                record_is_valid: self.record_is_valid.into_sorted(),
                record_is_transformed: self.record_is_transformed.into_sorted(),
                institution_name: self.institution_name.into_sorted(),
                repository_name: self.repository_name.into_sorted(),
                valid_rules: self.valid_rules.into_sorted(),
                invalid_rules: self.invalid_rules.into_sorted(),
            },
            partition_count,
            total_fact_rows: self.total_fact_rows,
            created_at: Utc::now(),
            version: SUMMARY_VERSION.to_string(),
        }
    }
}

/// `validation_stats.json` of every snapshot in a store.
#[derive(Debug, Clone)]
pub struct SummaryCache {
    reader: FactReader,
}

impl SummaryCache {
    pub fn new(reader: FactReader) -> Self {
        Self { reader }
    }

    fn path(&self, key: &SnapshotKey) -> PathBuf {
        validation_stats_path(&self.reader.config().base_path, &key.network, key.snapshot_id)
    }

    /// Cached summary of `key`, or `None` when absent, unreadable or stale.
    pub fn get(&self, key: &SnapshotKey) -> Result<Option<SnapshotSummary>> {
        let path = self.path(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io_at(&path, e)),
        };
        let summary: SnapshotSummary = match serde_json::from_slice(&bytes) {
            Ok(summary) => summary,
            Err(e) => {
                tracing::warn!("[SUMMARY] ignoring unreadable cache {}: {}", path.display(), e);
                return Ok(None);
            }
        };
        if summary.version != SUMMARY_VERSION {
            tracing::warn!(
                "[SUMMARY] ignoring stale cache {} (version {}, expected {})",
                path.display(),
                summary.version,
                SUMMARY_VERSION
            );
            return Ok(None);
        }
        Ok(Some(summary))
    }

    pub fn store(&self, key: &SnapshotKey, summary: &SnapshotSummary) -> Result<()> {
        let path = self.path(key);
        write_json_atomic(&path, summary)?;
        tracing::debug!("[SUMMARY] stored {}", path.display());
        Ok(())
    }

    pub fn invalidate(&self, key: &SnapshotKey) -> Result<()> {
        let path = self.path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io_at(&path, e)),
        }
    }

    /// Full unfiltered pass over the snapshot's fact rows.
    pub fn compute(&self, metadata: &SnapshotMetadata) -> Result<SnapshotSummary> {
        self.reader.aggregate(metadata, &FilterSet::default())
    }

    /// Cached summary, or a fresh one computed from the fact rows. The cache
    /// file is left untouched.
    pub fn get_or_compute(&self, metadata: &SnapshotMetadata) -> Result<SnapshotSummary> {
        match self.get(&metadata.key())? {
            Some(summary) => Ok(summary),
            None => self.compute(metadata),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{expand_record, SnapshotColumns};
    use harvest_types::{RecordValidation, RuleDefinition, RuleFact, StoreConfig};
    use tempfile::TempDir;

    fn metadata() -> SnapshotMetadata {
        SnapshotMetadata::new(11, "CL")
            .with_rule(1, RuleDefinition::new("dc:title", Quantifier::OneOrMore, true))
            .with_rule(2, RuleDefinition::new("dc:rights", Quantifier::OneOnly, false))
            .with_rule(3, RuleDefinition::new("dc:type", Quantifier::ZeroOrMore, false))
    }

    fn facts(meta: &SnapshotMetadata, record: RecordValidation) -> RecordFacts {
        let columns = SnapshotColumns::from_metadata(meta);
        let mut rows = expand_record(&columns, &record, false).into_iter();
        let mut facts = RecordFacts::from_first_row(rows.next().unwrap());
        facts.rows.extend(rows);
        facts
    }

    #[test]
    fn test_builder_counts_and_facets() {
        let meta = metadata();
        let mut builder = SummaryBuilder::new(&meta);
        builder.add(&facts(
            &meta,
            RecordValidation::new("a", true, false)
                .with_institution("U1")
                .with_rule(RuleFact::new(1, true))
                .with_rule(RuleFact::new(2, true)),
        ));
        builder.add(&facts(
            &meta,
            RecordValidation::new("b", false, true)
                .with_institution("U2")
                .with_rule(RuleFact::new(1, false))
                .with_rule(RuleFact::new(2, true)),
        ));
        builder.add(&facts(
            &meta,
            RecordValidation::new("c", false, false)
                .with_institution("U2")
                .with_rule(RuleFact::new(1, false)),
        ));
        let summary = builder.finish(2);

        assert_eq!(summary.total_records, 3);
        assert_eq!(summary.valid_records, 1);
        assert_eq!(summary.invalid_records(), 2);
        assert_eq!(summary.transformed_records, 1);
        assert_eq!(summary.total_fact_rows, 5);
        assert_eq!(summary.rules[&1].valid_count, 1);
        assert_eq!(summary.rules[&1].invalid_count, 2);
        assert_eq!(summary.rules[&2].valid_count, 2);
        assert_eq!(summary.rules[&3].valid_count + summary.rules[&3].invalid_count, 0);
        assert_eq!(summary.rules[&3].name, "dc:type");
        assert_eq!(
            summary.facets.institution_name,
            vec![
                FacetEntry { value: "U2".into(), count: 2 },
                FacetEntry { value: "U1".into(), count: 1 },
            ]
        );
        assert_eq!(summary.facets.record_is_valid[0].value, "false");
        assert_eq!(summary.version, SUMMARY_VERSION);
    }

    #[test]
    fn test_cache_store_get_invalidate() {
        let dir = TempDir::new().unwrap();
        let cache = SummaryCache::new(FactReader::new(StoreConfig::new(dir.path())));
        let meta = metadata();
        let key = meta.key();
        assert!(cache.get(&key).unwrap().is_none());

        let summary = SummaryBuilder::new(&meta).finish(0);
        cache.store(&key, &summary).unwrap();
        assert_eq!(cache.get(&key).unwrap(), Some(summary.clone()));

        let mut stale = summary;
        stale.version = "0.9".into();
        cache.store(&key, &stale).unwrap();
        assert!(cache.get(&key).unwrap().is_none());

        cache.invalidate(&key).unwrap();
        cache.invalidate(&key).unwrap();
        assert!(cache.get(&key).unwrap().is_none());
    }
}
