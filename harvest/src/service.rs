//! Validation statistics facade used by the harvester and by reporting.

use crate::stats::{ObservationPage, ValidationStats};
use harvest_fact_store::{
    migrate_legacy_snapshot, FactReader, FilterSet, IndexEntry, LifecycleManager,
    RuleOccurrenceCounts, SnapshotState, WriteStats,
};
use harvest_result::{Error, Result};
use harvest_types::{RecordValidation, RuleId, SnapshotId, SnapshotMetadata, StoreConfig};

/// Entry point tying the lifecycle manager, the reader and the summary cache
/// together.
///
/// Write calls go straight to the [`LifecycleManager`]. Queries parse their
/// filters first, so a malformed filter fails before any file is opened, and
/// map a missing snapshot to an empty result.
pub struct ValidationStatsService {
    lifecycle: LifecycleManager,
    reader: FactReader,
}

impl ValidationStatsService {
    pub fn new(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            reader: FactReader::new(config.clone()),
            lifecycle: LifecycleManager::new(config),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        self.lifecycle.config()
    }

    pub fn state(&self, snapshot_id: SnapshotId) -> Result<SnapshotState> {
        self.lifecycle.state(snapshot_id)
    }

    pub fn initialize_validation_for_snapshot(&self, metadata: &SnapshotMetadata) -> Result<()> {
        self.lifecycle.initialize(metadata)
    }

    pub fn add_observation(&self, snapshot_id: SnapshotId, record: &RecordValidation) -> Result<()> {
        self.lifecycle.append(snapshot_id, record)
    }

    pub fn finalize_validation_for_snapshot(&self, snapshot_id: SnapshotId) -> Result<WriteStats> {
        self.lifecycle.finalize(snapshot_id)
    }

    /// Parse `filters` without touching storage.
    pub fn validate_filters<S: AsRef<str>>(&self, filters: &[S]) -> Result<()> {
        FilterSet::parse(filters).map(|_| ())
    }

    /// Rule statistics and facets. Unfiltered requests are answered from the
    /// summary cache, filtered ones by a scan.
    pub fn query_validator_rules_stats_by_snapshot<S: AsRef<str>>(
        &self,
        metadata: &SnapshotMetadata,
        filters: &[S],
    ) -> Result<ValidationStats> {
        let filters = FilterSet::parse(filters)?;
        let summary = if filters.is_empty() {
            self.lifecycle.cache().get_or_compute(metadata)
        } else {
            self.reader.aggregate(metadata, &filters)
        };
        empty_if_missing(metadata, summary.map(ValidationStats::from))
    }

    /// Page `page` (zero-based) of `size` records matching `filters`.
    pub fn query_validation_stats_observations_by_snapshot_id<S: AsRef<str>>(
        &self,
        metadata: &SnapshotMetadata,
        filters: &[S],
        page: usize,
        size: usize,
    ) -> Result<ObservationPage> {
        let filters = FilterSet::parse(filters)?;
        let offset = page.checked_mul(size).ok_or_else(|| {
            Error::InvalidArgumentError(format!("page {page} of size {size} overflows"))
        })?;
        let records = self
            .reader
            .query_observations(&metadata.key(), &filters, offset, size)
            .map(|records| ObservationPage::from_page(records, page, size));
        match records {
            Err(e) if e.is_not_found() => {
                warn_missing(metadata, &e);
                Ok(ObservationPage::empty(page, size))
            }
            other => other,
        }
    }

    pub fn query_valid_rule_occurrences_count_by_snapshot_id<S: AsRef<str>>(
        &self,
        metadata: &SnapshotMetadata,
        rule_id: RuleId,
        filters: &[S],
    ) -> Result<RuleOccurrenceCounts> {
        let filters = FilterSet::parse(filters)?;
        let counts = self
            .reader
            .count_rule_occurrences(&metadata.key(), rule_id, &filters);
        empty_if_missing(metadata, counts)
    }

    /// Record-level results of the snapshot, optionally only valid or invalid ones.
    pub fn query_record_validations_by_status(
        &self,
        metadata: &SnapshotMetadata,
        is_valid: Option<bool>,
    ) -> Result<Vec<IndexEntry>> {
        let entries = self
            .reader
            .iterate_by_status(&metadata.key(), is_valid)
            .map(Iterator::collect);
        empty_if_missing(metadata, entries)
    }

    pub fn get_record_validation(
        &self,
        metadata: &SnapshotMetadata,
        identifier: &str,
    ) -> Result<Option<IndexEntry>> {
        let entry = self.reader.get_by_identifier(&metadata.key(), identifier);
        empty_if_missing(metadata, entry)
    }

    /// Remove everything stored for the snapshot. Missing snapshots are fine.
    pub fn delete_validation_stats_by_snapshot_id(&self, metadata: &SnapshotMetadata) -> Result<()> {
        self.lifecycle.delete(&metadata.key())
    }

    /// Convert a legacy flat observation file into fact files.
    ///
    /// Refused while the snapshot has an open writer.
    pub fn migrate_legacy(&self, metadata: &SnapshotMetadata) -> Result<WriteStats> {
        let state = self.lifecycle.state(metadata.snapshot_id)?;
        if self.lifecycle.is_writing(metadata.snapshot_id)? {
            return Err(Error::invalid_state(metadata.snapshot_id.0, state, "migrate"));
        }
        migrate_legacy_snapshot(self.config(), metadata)
    }
}

fn warn_missing(metadata: &SnapshotMetadata, err: &Error) {
    tracing::warn!(
        "[SERVICE] no validation data for snapshot {}: {}",
        metadata.key(),
        err
    );
}

fn empty_if_missing<T: Default>(metadata: &SnapshotMetadata, result: Result<T>) -> Result<T> {
    match result {
        Err(e) if e.is_not_found() => {
            warn_missing(metadata, &e);
            Ok(T::default())
        }
        other => other,
    }
}
