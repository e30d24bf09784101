//! Shared types for the harvest storage crates.
//!
//! These types live in `harvest-types` so the fact store, the catalog store and
//! the service layer can agree on paths, ids and configuration without depending
//! on each other.

pub mod config;
pub mod ids;
pub mod layout;
pub mod metadata;
pub mod validation;

pub use config::{CatalogConfig, CompressionCodec, JournalMode, StoreConfig};
pub use ids::{fact_id, record_id, RuleId, SnapshotId};
pub use metadata::{Quantifier, RuleDefinition, SnapshotKey, SnapshotMetadata};
pub use validation::{RecordValidation, RuleFact};
