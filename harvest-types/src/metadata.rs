//! Snapshot metadata supplied by the harvesting/validation collaborator.

use crate::ids::{RuleId, SnapshotId};
use crate::layout;
use harvest_result::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

/// Occurrence constraint a rule enforces on its field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Quantifier {
    ZeroOnly,
    OneOnly,
    ZeroOrMore,
    OneOrMore,
    All,
}

/// Human-readable description of one validation rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub quantifier: Quantifier,
    pub mandatory: bool,
}

impl RuleDefinition {
    pub fn new(name: impl Into<String>, quantifier: Quantifier, mandatory: bool) -> Self {
        Self {
            name: name.into(),
            description: None,
            quantifier,
            mandatory,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Address of a snapshot on disk: sanitized network plus snapshot id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotKey {
    pub network: String,
    pub snapshot_id: SnapshotId,
}

impl SnapshotKey {
    pub fn new(network: &str, snapshot_id: impl Into<SnapshotId>) -> Self {
        Self {
            network: layout::sanitize_network_acronym(network),
            snapshot_id: snapshot_id.into(),
        }
    }
}

impl std::fmt::Display for SnapshotKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/snapshot_{}", self.network, self.snapshot_id)
    }
}

/// Read-only description of a snapshot.
///
/// Needed to resolve paths (network acronym, snapshot id), to pick the output
/// file size (estimated record count) and to label statistics with rule names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub snapshot_id: SnapshotId,
    pub network_acronym: String,
    #[serde(default)]
    pub origin: String,
    #[serde(default)]
    pub metadata_prefix: Option<String>,
    #[serde(default)]
    pub estimated_record_count: Option<u64>,
    #[serde(default)]
    pub rules: BTreeMap<RuleId, RuleDefinition>,
}

impl SnapshotMetadata {
    pub fn new(snapshot_id: impl Into<SnapshotId>, network_acronym: impl Into<String>) -> Self {
        Self {
            snapshot_id: snapshot_id.into(),
            network_acronym: network_acronym.into(),
            origin: String::new(),
            metadata_prefix: None,
            estimated_record_count: None,
            rules: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    #[must_use]
    pub fn with_metadata_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.metadata_prefix = Some(prefix.into());
        self
    }

    #[must_use]
    pub fn with_estimated_record_count(mut self, count: u64) -> Self {
        self.estimated_record_count = Some(count);
        self
    }

    #[must_use]
    pub fn with_rule(mut self, rule_id: RuleId, definition: RuleDefinition) -> Self {
        self.rules.insert(rule_id, definition);
        self
    }

    /// Sanitized network directory name.
    pub fn network(&self) -> String {
        layout::sanitize_network_acronym(&self.network_acronym)
    }

    pub fn key(&self) -> SnapshotKey {
        SnapshotKey::new(&self.network_acronym, self.snapshot_id)
    }

    /// Write `metadata.json` into the snapshot directory under `base`.
    ///
    /// The file is written to a temporary name first and renamed into place.
    pub fn save(&self, base: &Path) -> Result<()> {
        let path = layout::snapshot_metadata_path(base, &self.network_acronym, self.snapshot_id);
        write_json_atomic(&path, self)
    }

    /// Read `metadata.json` for `snapshot_id` under `base`.
    pub fn load(base: &Path, network: &str, snapshot_id: SnapshotId) -> Result<Self> {
        let path = layout::snapshot_metadata_path(base, network, snapshot_id);
        let bytes = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(format!("metadata for snapshot {snapshot_id}"))
            } else {
                Error::io_at(&path, e)
            }
        })?;
        serde_json::from_slice(&bytes).map_err(|e| Error::corrupt(&path, e))
    }
}

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io_at(parent, e))?;
    }
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    let mut file = fs::File::create(&tmp).map_err(|e| Error::io_at(&tmp, e))?;
    file.write_all(&bytes).map_err(|e| Error::io_at(&tmp, e))?;
    file.sync_all().map_err(|e| Error::io_at(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| Error::io_at(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_metadata_save_and_load() {
        let dir = TempDir::new().unwrap();
        let meta = SnapshotMetadata::new(8, "LA Referencia")
            .with_origin("https://www.lareferencia.info/oai")
            .with_metadata_prefix("oai_dc")
            .with_rule(1, RuleDefinition::new("dc:title", Quantifier::OneOrMore, true));

        meta.save(dir.path()).unwrap();
        assert!(dir
            .path()
            .join("LA_REFERENCIA/snapshots/snapshot_8/metadata.json")
            .exists());

        let loaded = SnapshotMetadata::load(dir.path(), "LA Referencia", SnapshotId(8)).unwrap();
        assert_eq!(loaded, meta);
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = SnapshotMetadata::load(dir.path(), "X", SnapshotId(1)).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_quantifier_serializes_like_validator_config() {
        let json = serde_json::to_string(&Quantifier::OneOrMore).unwrap();
        assert_eq!(json, "\"ONE_OR_MORE\"");
    }
}
