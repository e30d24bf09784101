//! Harvest: validation statistics and record catalogs for OAI-PMH harvests.
//!
//! This crate is the entrypoint of the workspace. It re-exports the storage
//! crates and adds [`ValidationStatsService`], the facade the harvester and
//! the reporting layer talk to.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use harvest::{RecordValidation, RuleFact, SnapshotMetadata, StoreConfig, ValidationStatsService};
//!
//! # fn main() -> harvest::Result<()> {
//! let service = ValidationStatsService::new(StoreConfig::new("/var/lib/harvest"))?;
//! let metadata = SnapshotMetadata::new(12, "LA Referencia");
//!
//! service.initialize_validation_for_snapshot(&metadata)?;
//! service.add_observation(
//!     metadata.snapshot_id,
//!     &RecordValidation::new("oai:repo:1", false, false).with_rule(RuleFact::new(3, false)),
//! )?;
//! service.finalize_validation_for_snapshot(metadata.snapshot_id)?;
//!
//! let stats = service.query_validator_rules_stats_by_snapshot(&metadata, &["isValid:false"])?;
//! assert_eq!(stats.size, 1);
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - **Types** (`harvest-types`): ids, configuration, snapshot metadata and the on-disk layout.
//! - **Fact store** (`harvest-fact-store`): partitioned Parquet fact files, queries and summaries.
//! - **Catalog** (`harvest-catalog`): SQLite inventory of harvested records.
//! - **Service** (this crate): lifecycle calls and queries with empty-on-missing semantics.

pub mod service;
pub mod stats;

pub use service::ValidationStatsService;
pub use stats::{ObservationPage, ValidationStats};

pub mod catalog {
    //! Per-snapshot SQLite record catalog.

    pub use harvest_catalog::*;
}

pub mod fact_store {
    //! Partitioned fact files and the queries over them.

    pub use harvest_fact_store::*;
}

pub use harvest_fact_store::{
    FilterSet, IndexEntry, RuleOccurrenceCounts, SnapshotState, WriteStats,
};
pub use harvest_result::{Error, Result};
pub use harvest_types::{
    CatalogConfig, RecordValidation, RuleDefinition, RuleFact, RuleId, SnapshotId, SnapshotKey,
    SnapshotMetadata, StoreConfig,
};
