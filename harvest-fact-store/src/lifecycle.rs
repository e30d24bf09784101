//! Write-side state machine of every snapshot in a store.
//!
//! ```text
//! Uninitialized -> Writing -> Finalizing -> Closed
//!        \____________\___________\__________\____> Deleting
//! ```
//!
//! Each snapshot owns a slot holding its writer. The registry lock is only
//! taken to find or insert a slot, so snapshots never contend with each other
//! once their slot exists.

use crate::reader::FactReader;
use crate::summary::SummaryCache;
use crate::types::WriteStats;
use crate::writer::FactWriter;
use harvest_result::{Error, Result};
use harvest_types::layout::{legacy_stats_file, snapshot_path};
use harvest_types::{RecordValidation, SnapshotId, SnapshotKey, SnapshotMetadata, StoreConfig};
use rustc_hash::FxHashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnapshotState {
    Uninitialized,
    Writing,
    Finalizing,
    Closed,
    Deleting,
}

impl SnapshotState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "UNINITIALIZED",
            Self::Writing => "WRITING",
            Self::Finalizing => "FINALIZING",
            Self::Closed => "CLOSED",
            Self::Deleting => "DELETING",
        }
    }
}

impl fmt::Display for SnapshotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct SnapshotSlot {
    state: SnapshotState,
    metadata: SnapshotMetadata,
    writer: Option<FactWriter>,
}

type SharedSlot = Arc<Mutex<SnapshotSlot>>;

/// Registry of snapshot writers plus the transitions between their states.
pub struct LifecycleManager {
    config: StoreConfig,
    cache: SummaryCache,
    slots: RwLock<FxHashMap<SnapshotId, SharedSlot>>,
}

impl LifecycleManager {
    pub fn new(config: StoreConfig) -> Self {
        let cache = SummaryCache::new(FactReader::new(config.clone()));
        Self {
            config,
            cache,
            slots: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn cache(&self) -> &SummaryCache {
        &self.cache
    }

    fn slot(&self, snapshot_id: SnapshotId) -> Result<Option<SharedSlot>> {
        let slots = self.slots.read().map_err(Error::poisoned)?;
        Ok(slots.get(&snapshot_id).cloned())
    }

    pub fn state(&self, snapshot_id: SnapshotId) -> Result<SnapshotState> {
        match self.slot(snapshot_id)? {
            Some(slot) => Ok(slot.lock().map_err(Error::poisoned)?.state),
            None => Ok(SnapshotState::Uninitialized),
        }
    }

    /// Whether a writer is open for `snapshot_id`.
    pub fn is_writing(&self, snapshot_id: SnapshotId) -> Result<bool> {
        Ok(matches!(
            self.state(snapshot_id)?,
            SnapshotState::Writing | SnapshotState::Finalizing
        ))
    }

    /// Open a writer for the snapshot and persist its metadata.
    ///
    /// A snapshot already `Writing` or `Closed` is left untouched.
    pub fn initialize(&self, metadata: &SnapshotMetadata) -> Result<()> {
        let snapshot_id = metadata.snapshot_id;
        let slot = {
            let mut slots = self.slots.write().map_err(Error::poisoned)?;
            slots
                .entry(snapshot_id)
                .or_insert_with(|| {
                    Arc::new(Mutex::new(SnapshotSlot {
                        state: SnapshotState::Uninitialized,
                        metadata: metadata.clone(),
                        writer: None,
                    }))
                })
                .clone()
        };

        let mut slot = slot.lock().map_err(Error::poisoned)?;
        match slot.state {
            SnapshotState::Writing | SnapshotState::Closed => {
                tracing::warn!(
                    "[LIFECYCLE] snapshot {} is already {}; initialize ignored",
                    snapshot_id,
                    slot.state
                );
                return Ok(());
            }
            SnapshotState::Finalizing | SnapshotState::Deleting => {
                return Err(Error::invalid_state(snapshot_id.0, slot.state, "initialize"));
            }
            SnapshotState::Uninitialized => {}
        }

        let writer = FactWriter::create(&self.config, metadata)?;
        metadata.save(&self.config.base_path)?;
        self.cache.invalidate(&metadata.key())?;

        slot.metadata = metadata.clone();
        slot.writer = Some(writer);
        slot.state = SnapshotState::Writing;
        tracing::info!(
            "[LIFECYCLE] snapshot {} ({}) initialized",
            snapshot_id,
            metadata.network()
        );
        Ok(())
    }

    /// Buffer one record into the snapshot's writer.
    pub fn append(&self, snapshot_id: SnapshotId, record: &RecordValidation) -> Result<()> {
        let Some(slot) = self.slot(snapshot_id)? else {
            return Err(Error::invalid_state(
                snapshot_id.0,
                SnapshotState::Uninitialized,
                "append",
            ));
        };
        let mut slot = slot.lock().map_err(Error::poisoned)?;
        if slot.state != SnapshotState::Writing {
            return Err(Error::invalid_state(snapshot_id.0, slot.state, "append"));
        }
        match slot.writer.as_mut() {
            Some(writer) => writer.append(record),
            None => Err(Error::Internal(format!(
                "snapshot {snapshot_id} is writing without a writer"
            ))),
        }
    }

    /// Close the writer, store the summary and mark the snapshot `Closed`.
    ///
    /// A writer failure leaves the snapshot `Finalizing`. A summary failure is
    /// logged and does not keep the snapshot from closing.
    pub fn finalize(&self, snapshot_id: SnapshotId) -> Result<WriteStats> {
        let Some(slot) = self.slot(snapshot_id)? else {
            return Err(Error::invalid_state(
                snapshot_id.0,
                SnapshotState::Uninitialized,
                "finalize",
            ));
        };
        let mut slot = slot.lock().map_err(Error::poisoned)?;
        if slot.state != SnapshotState::Writing {
            return Err(Error::invalid_state(snapshot_id.0, slot.state, "finalize"));
        }
        slot.state = SnapshotState::Finalizing;

        let writer = slot.writer.take().ok_or_else(|| {
            Error::Internal(format!("snapshot {snapshot_id} is writing without a writer"))
        })?;
        let stats = writer.finalize()?;

        let key = slot.metadata.key();
        match self.cache.compute(&slot.metadata) {
            Ok(summary) => {
                if let Err(e) = self.cache.store(&key, &summary) {
                    tracing::error!("[LIFECYCLE] could not store summary of {}: {}", key, e);
                }
            }
            Err(e) => tracing::error!("[LIFECYCLE] could not compute summary of {}: {}", key, e),
        }

        slot.state = SnapshotState::Closed;
        tracing::info!(
            "[LIFECYCLE] snapshot {} closed: {} records, {} rows, {} files",
            snapshot_id,
            stats.records,
            stats.rows,
            stats.files
        );
        Ok(stats)
    }

    /// Remove everything stored for the snapshot. Missing data is not an error.
    pub fn delete(&self, key: &SnapshotKey) -> Result<()> {
        let snapshot_id = key.snapshot_id;
        if let Some(slot) = self.slot(snapshot_id)? {
            let mut slot = slot.lock().map_err(Error::poisoned)?;
            slot.state = SnapshotState::Deleting;
            if let Some(writer) = slot.writer.take() {
                writer.abort();
            }
        }

        let dir = snapshot_path(&self.config.base_path, &key.network, snapshot_id);
        remove_if_exists(&dir, true)?;
        if let Some(legacy_base) = &self.config.legacy_stats_path {
            remove_if_exists(&legacy_stats_file(legacy_base, snapshot_id), false)?;
        }

        self.slots
            .write()
            .map_err(Error::poisoned)?
            .remove(&snapshot_id);
        tracing::info!("[LIFECYCLE] snapshot {} deleted", key);
        Ok(())
    }
}

fn remove_if_exists(path: &Path, dir: bool) -> Result<()> {
    let result = if dir {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io_at(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_types::layout::{snapshot_metadata_path, validation_stats_path};
    use harvest_types::RuleFact;
    use tempfile::TempDir;

    fn record(i: usize) -> RecordValidation {
        RecordValidation::new(format!("oai:x:{i}"), i % 2 == 0, false)
            .with_rule(RuleFact::new(1, i % 2 == 0))
    }

    #[test]
    fn test_full_lifecycle() {
        let dir = TempDir::new().unwrap();
        let manager = LifecycleManager::new(StoreConfig::new(dir.path()));
        let meta = SnapshotMetadata::new(1, "AR");
        let id = meta.snapshot_id;

        assert_eq!(manager.state(id).unwrap(), SnapshotState::Uninitialized);
        manager.initialize(&meta).unwrap();
        assert_eq!(manager.state(id).unwrap(), SnapshotState::Writing);
        assert!(snapshot_metadata_path(dir.path(), "AR", id).exists());

        for i in 0..5 {
            manager.append(id, &record(i)).unwrap();
        }
        let stats = manager.finalize(id).unwrap();
        assert_eq!(stats.records, 5);
        assert_eq!(manager.state(id).unwrap(), SnapshotState::Closed);
        assert!(validation_stats_path(dir.path(), "AR", id).exists());
    }

    #[test]
    fn test_append_outside_writing_is_invalid_state() {
        let dir = TempDir::new().unwrap();
        let manager = LifecycleManager::new(StoreConfig::new(dir.path()));
        let meta = SnapshotMetadata::new(2, "AR");

        let err = manager.append(meta.snapshot_id, &record(0)).unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));

        manager.initialize(&meta).unwrap();
        manager.finalize(meta.snapshot_id).unwrap();
        let err = manager.append(meta.snapshot_id, &record(1)).unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
        assert!(manager.finalize(meta.snapshot_id).is_err());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let manager = LifecycleManager::new(StoreConfig::new(dir.path()));
        let meta = SnapshotMetadata::new(3, "AR");
        manager.initialize(&meta).unwrap();
        manager.append(meta.snapshot_id, &record(0)).unwrap();

        manager.delete(&meta.key()).unwrap();
        assert_eq!(manager.state(meta.snapshot_id).unwrap(), SnapshotState::Uninitialized);
        assert!(!snapshot_path(dir.path(), "AR", meta.snapshot_id).exists());
        manager.delete(&meta.key()).unwrap();
    }
}
