//! Validation fact table for harvested snapshots.
//!
//! Every record validated during a harvest produces one fact row per rule it
//! was checked against (plus one row per captured occurrence when detailed
//! diagnostics are on). Rows are written into Parquet files partitioned by
//! network, snapshot and record validity:
//!
//! ```text
//! {base}/{NETWORK}/snapshots/snapshot_{id}/validation_records/part-valid-00000.parquet
//! {base}/{NETWORK}/snapshots/snapshot_{id}/validation_records/part-invalid-00000.parquet
//! ```
//!
//! # Architecture
//!
//! - [`FactWriter`]: buffers whole records per partition and rolls files by
//!   record count, so a record never spans two row groups.
//! - [`FactReader`]: plans scans from file footers in parallel, prunes row
//!   groups with column statistics and streams rows lazily. Paginated and
//!   aggregate queries live on the reader as well.
//! - [`FilterSet`]: parsed `field:value` filters, turned into pruning
//!   predicates and a per-record check.
//! - [`IndexEntry`]: one row per record in `validation_index.parquet`, with
//!   the OAI datestamp and published metadata hash, for status and identifier
//!   lookups.
//! - [`SummaryCache`]: `validation_stats.json`, written at finalize so
//!   unfiltered statistics never need a scan.
//! - [`LifecycleManager`]: per-snapshot state machine owning the writers.
//!
//! Snapshots written before the fact table existed are stored as one flat
//! observation file. [`StorageGeneration`] tells the two apart and the reader
//! projects legacy rows into fact rows, so every query works on both;
//! [`migrate_legacy_snapshot`] converts them for good.
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use harvest_fact_store::{FactReader, FilterSet, LifecycleManager};
//! use harvest_types::{RecordValidation, RuleFact, SnapshotMetadata, StoreConfig};
//!
//! # fn main() -> harvest_result::Result<()> {
//! let config = StoreConfig::new("/var/lib/harvest");
//! let lifecycle = LifecycleManager::new(config.clone());
//!
//! let metadata = SnapshotMetadata::new(42, "LA Referencia");
//! lifecycle.initialize(&metadata)?;
//! lifecycle.append(
//!     metadata.snapshot_id,
//!     &RecordValidation::new("oai:repo:1", true, false).with_rule(RuleFact::new(7, true)),
//! )?;
//! lifecycle.finalize(metadata.snapshot_id)?;
//!
//! let reader = FactReader::new(config);
//! let filters = FilterSet::parse(&["isValid:true"])?;
//! let page = reader.query_observations(&metadata.key(), &filters, 0, 20)?;
//! println!("{} valid records", page.total.unwrap_or_default());
//! # Ok(())
//! # }
//! ```

pub mod filter;
pub mod generation;
pub mod index;
pub mod legacy;
pub mod lifecycle;
pub mod migration;
pub mod query;
pub mod reader;
pub mod record;
pub mod schema;
pub mod sizing;
pub mod statistics;
pub mod summary;
pub mod types;
pub mod writer;

pub use filter::{FilterSet, IdentifierMatch};
pub use generation::StorageGeneration;
pub use index::IndexEntry;
pub use lifecycle::{LifecycleManager, SnapshotState};
pub use migration::migrate_legacy_snapshot;
pub use query::{paginate, paginate_until_limit, FactPage, Page, RuleOccurrenceCounts};
pub use reader::{list_fact_files, FactReader, FactRowIter, RecordIter};
pub use record::RecordFacts;
pub use schema::{expand_record, fact_schema, FactRow};
pub use sizing::records_per_file;
pub use statistics::{ColumnPredicate, StatValue};
pub use summary::{FacetEntry, Facets, RuleStats, SnapshotSummary, SummaryBuilder, SummaryCache};
pub use types::{FactPartition, WriteStats};
pub use writer::FactWriter;
