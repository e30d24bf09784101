//! Per-snapshot catalog of harvested OAI records.
//!
//! Each snapshot owns `catalog/catalog.db`, a SQLite table keyed by record
//! identifier with the datestamp, a hash of the original metadata and a
//! deleted flag. A new snapshot starts from a copy of the previous one
//! ([`CatalogStore::initialize`]) and the harvester upserts what changed.
//!
//! Snapshots from before the SQLite catalog kept the inventory in columnar
//! batch files; [`migrate_legacy_catalog`] converts those.

pub mod migration;
pub mod store;

pub use migration::{list_legacy_catalog_batches, migrate_legacy_catalog, MigrationReport};
pub use store::{CatalogIter, CatalogRecord, CatalogStore, DATESTAMP_FORMAT};
