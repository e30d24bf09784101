//! SQLite inventory of the OAI records known to a snapshot.

use chrono::NaiveDateTime;
use harvest_result::{Error, Result};
use harvest_types::layout::{catalog_db_path, catalog_dir_path};
use harvest_types::{record_id, CatalogConfig, SnapshotId, SnapshotKey, SnapshotMetadata};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Datestamps are stored as ISO-8601 local date-times.
pub const DATESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

const SCHEMA_SQL: &str = "
    CREATE TABLE IF NOT EXISTS oai_record (
        id TEXT PRIMARY KEY,
        identifier TEXT NOT NULL UNIQUE,
        datestamp TEXT NOT NULL,
        original_metadata_hash TEXT,
        deleted INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_deleted ON oai_record(deleted);
    CREATE INDEX IF NOT EXISTS idx_datestamp ON oai_record(datestamp);
";

const UPSERT_SQL: &str = "INSERT OR REPLACE INTO oai_record \
     (id, identifier, datestamp, original_metadata_hash, deleted) VALUES (?1, ?2, ?3, ?4, ?5)";

const SELECT_COLUMNS: &str = "rowid, id, identifier, datestamp, original_metadata_hash, deleted";

/// One harvested record as known to the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogRecord {
    /// xxh3 hex of the identifier.
    pub id: String,
    pub identifier: String,
    pub datestamp: NaiveDateTime,
    pub original_metadata_hash: Option<String>,
    pub deleted: bool,
}

impl CatalogRecord {
    pub fn new(identifier: impl Into<String>, datestamp: NaiveDateTime) -> Self {
        let identifier = identifier.into();
        Self {
            id: record_id(&identifier),
            identifier,
            datestamp,
            original_metadata_hash: None,
            deleted: false,
        }
    }

    #[must_use]
    pub fn with_metadata_hash(mut self, hash: impl Into<String>) -> Self {
        self.original_metadata_hash = Some(hash.into());
        self
    }

    #[must_use]
    pub fn with_deleted(mut self, deleted: bool) -> Self {
        self.deleted = deleted;
        self
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<(i64, Self)> {
        let raw_datestamp: String = row.get(3)?;
        let datestamp = NaiveDateTime::parse_from_str(&raw_datestamp, DATESTAMP_FORMAT)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
        Ok((
            row.get(0)?,
            Self {
                id: row.get(1)?,
                identifier: row.get(2)?,
                datestamp,
                original_metadata_hash: row.get(4)?,
                deleted: row.get::<_, i64>(5)? != 0,
            },
        ))
    }
}

/// Catalog database of one snapshot.
pub struct CatalogStore {
    path: PathBuf,
    config: CatalogConfig,
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for CatalogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogStore").field("path", &self.path).finish()
    }
}

impl CatalogStore {
    /// Open or create the database at `path` and apply the schema.
    pub fn open(path: impl Into<PathBuf>, config: &CatalogConfig) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io_at(parent, e))?;
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(&format!(
            "PRAGMA journal_mode = {};
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = 10000;
             PRAGMA temp_store = MEMORY;",
            config.journal_mode.pragma_value()
        ))?;
        conn.execute_batch(SCHEMA_SQL)?;
        tracing::debug!("[CATALOG] opened {}", path.display());
        Ok(Self {
            path,
            config: config.clone(),
            conn: Mutex::new(conn),
        })
    }

    /// Open the existing catalog of a snapshot; `NotFound` if it was never created.
    pub fn open_existing(base: &Path, key: &SnapshotKey, config: &CatalogConfig) -> Result<Self> {
        let path = catalog_db_path(base, &key.network, key.snapshot_id);
        if !path.is_file() {
            return Err(Error::NotFound(format!("catalog of snapshot {key}")));
        }
        Self::open(path, config)
    }

    /// Create the catalog of a new snapshot, seeded with a copy of the
    /// previous snapshot's catalog when there is one.
    pub fn initialize(
        base: &Path,
        metadata: &SnapshotMetadata,
        previous: Option<SnapshotId>,
        config: &CatalogConfig,
    ) -> Result<Self> {
        let network = metadata.network();
        let dir = catalog_dir_path(base, &network, metadata.snapshot_id);
        fs::create_dir_all(&dir).map_err(|e| Error::io_at(&dir, e))?;
        let target = catalog_db_path(base, &network, metadata.snapshot_id);

        if previous == Some(metadata.snapshot_id) {
            tracing::warn!(
                "[CATALOG] snapshot {} named as its own predecessor; keeping its catalog",
                metadata.snapshot_id
            );
        } else if let Some(previous) = previous {
            let source = catalog_db_path(base, &network, previous);
            if source.is_file() {
                // Fold the WAL into the main file so the copy is complete.
                Self::open(&source, config)?.checkpoint()?;
                remove_db_files(&target)?;
                let bytes = fs::copy(&source, &target).map_err(|e| Error::io_at(&target, e))?;
                tracing::info!(
                    "[CATALOG] snapshot {} seeded from snapshot {} ({} bytes)",
                    metadata.snapshot_id,
                    previous,
                    bytes
                );
            } else {
                tracing::warn!(
                    "[CATALOG] previous catalog {} not found; snapshot {} starts empty",
                    source.display(),
                    metadata.snapshot_id
                );
            }
        }

        let store = Self::open(target, config)?;
        tracing::info!("[CATALOG] snapshot {} initialized", metadata.snapshot_id);
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().map_err(Error::poisoned)?;
        Ok(f(&mut *conn)?)
    }

    pub fn upsert(&self, record: &CatalogRecord) -> Result<()> {
        self.upsert_batch(std::slice::from_ref(record)).map(|_| ())
    }

    /// Insert or replace `records` by identifier in one transaction.
    pub fn upsert_batch(&self, records: &[CatalogRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let written = self.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(UPSERT_SQL)?;
                for record in records {
                    stmt.execute(params![
                        record.id,
                        record.identifier,
                        record.datestamp.format(DATESTAMP_FORMAT).to_string(),
                        record.original_metadata_hash,
                        record.deleted as i64,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(records.len())
        })?;
        tracing::debug!("[CATALOG] committed {} records into {}", written, self.path.display());
        Ok(written)
    }

    pub fn get(&self, identifier: &str) -> Result<Option<CatalogRecord>> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM oai_record WHERE identifier = ?1");
        let found = self.with_conn(|conn| {
            conn.query_row(&sql, params![identifier], CatalogRecord::from_row)
                .optional()
        })?;
        Ok(found.map(|(_, record)| record))
    }

    /// Flag `identifiers` as deleted; returns how many rows changed.
    pub fn mark_deleted<S: AsRef<str>>(&self, identifiers: &[S]) -> Result<usize> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut changed = 0;
            {
                let mut stmt =
                    tx.prepare_cached("UPDATE oai_record SET deleted = 1 WHERE identifier = ?1")?;
                for identifier in identifiers {
                    changed += stmt.execute(params![identifier.as_ref()])?;
                }
            }
            tx.commit()?;
            Ok(changed)
        })
    }

    pub fn count(&self) -> Result<u64> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM oai_record", [], |row| row.get::<_, i64>(0))
        })
        .map(|n| n as u64)
    }

    pub fn count_not_deleted(&self) -> Result<u64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM oai_record WHERE deleted = 0",
                [],
                |row| row.get::<_, i64>(0),
            )
        })
        .map(|n| n as u64)
    }

    /// Every record in insertion order, fetched `batch_size` rows at a time.
    pub fn iterate(&self) -> CatalogIter<'_> {
        CatalogIter::new(self, false)
    }

    /// Like [`CatalogStore::iterate`], skipping deleted records.
    pub fn iterate_not_deleted(&self) -> CatalogIter<'_> {
        CatalogIter::new(self, true)
    }

    /// Move WAL content into the main database file and truncate the WAL.
    pub fn checkpoint(&self) -> Result<()> {
        self.with_conn(|conn| conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(())))?;
        tracing::debug!("[CATALOG] checkpointed {}", self.path.display());
        Ok(())
    }

    /// Checkpoint and close the connection.
    pub fn close(self) -> Result<()> {
        self.checkpoint()?;
        let conn = self.conn.into_inner().map_err(Error::poisoned)?;
        conn.close().map_err(|(_, e)| Error::Sqlite(e))?;
        Ok(())
    }

    /// Remove the catalog database of a snapshot, including WAL side files.
    pub fn delete(base: &Path, key: &SnapshotKey) -> Result<()> {
        let path = catalog_db_path(base, &key.network, key.snapshot_id);
        remove_db_files(&path)?;
        tracing::info!("[CATALOG] deleted catalog of snapshot {}", key);
        Ok(())
    }
}

fn side_file(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

pub(crate) fn remove_db_files(path: &Path) -> Result<()> {
    for file in [path.to_path_buf(), side_file(path, "-wal"), side_file(path, "-shm")] {
        match fs::remove_file(&file) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io_at(&file, e)),
        }
    }
    Ok(())
}

/// Keyset-paged iterator over a catalog. Stops after the first error.
pub struct CatalogIter<'a> {
    store: &'a CatalogStore,
    not_deleted: bool,
    last_rowid: i64,
    buffer: VecDeque<CatalogRecord>,
    done: bool,
}

impl<'a> CatalogIter<'a> {
    fn new(store: &'a CatalogStore, not_deleted: bool) -> Self {
        Self {
            store,
            not_deleted,
            last_rowid: 0,
            buffer: VecDeque::new(),
            done: false,
        }
    }

    fn fetch(&mut self) -> Result<()> {
        let filter = if self.not_deleted { "AND deleted = 0" } else { "" };
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM oai_record WHERE rowid > ?1 {filter} ORDER BY rowid LIMIT ?2"
        );
        let page_size = self.store.config.batch_size.max(1) as i64;
        let last_rowid = self.last_rowid;
        let page = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params![last_rowid, page_size], CatalogRecord::from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;

        if (page.len() as i64) < page_size {
            self.done = true;
        }
        for (rowid, record) in page {
            self.last_rowid = rowid;
            self.buffer.push_back(record);
        }
        Ok(())
    }
}

impl Iterator for CatalogIter<'_> {
    type Item = Result<CatalogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.done {
            if let Err(e) = self.fetch() {
                self.done = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Timelike};
    use tempfile::TempDir;

    fn stamp(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, day)
            .unwrap()
            .and_hms_opt(10, 30, 0)
            .unwrap()
    }

    fn store(dir: &TempDir, batch_size: usize) -> CatalogStore {
        let config = CatalogConfig {
            batch_size,
            ..CatalogConfig::default()
        };
        CatalogStore::open(dir.path().join("catalog/catalog.db"), &config).unwrap()
    }

    #[test]
    fn test_upsert_replaces_by_identifier() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 100);
        store
            .upsert_batch(&[
                CatalogRecord::new("oai:a:1", stamp(1)).with_metadata_hash("h1"),
                CatalogRecord::new("oai:a:2", stamp(2)),
            ])
            .unwrap();
        store
            .upsert(&CatalogRecord::new("oai:a:1", stamp(5)).with_metadata_hash("h2"))
            .unwrap();

        assert_eq!(store.count().unwrap(), 2);
        let record = store.get("oai:a:1").unwrap().unwrap();
        assert_eq!(record.datestamp, stamp(5));
        assert_eq!(record.original_metadata_hash.as_deref(), Some("h2"));
        assert!(store.get("oai:missing").unwrap().is_none());
    }

    #[test]
    fn test_iterate_pages_through_everything() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 3);
        let records: Vec<_> = (0..10)
            .map(|i| CatalogRecord::new(format!("oai:b:{i}"), stamp(1 + i)))
            .collect();
        store.upsert_batch(&records).unwrap();
        store.mark_deleted(&["oai:b:4", "oai:b:7", "oai:absent"]).unwrap();

        let all: Vec<_> = store.iterate().collect::<Result<_>>().unwrap();
        assert_eq!(all.len(), 10);
        assert_eq!(all[0].identifier, "oai:b:0");

        let live: Vec<_> = store.iterate_not_deleted().collect::<Result<_>>().unwrap();
        assert_eq!(live.len(), 8);
        assert_eq!(store.count_not_deleted().unwrap(), 8);
    }

    #[test]
    fn test_fractional_datestamps_survive() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 10);
        let precise = stamp(9).with_nanosecond(123_000_000).unwrap();
        store.upsert(&CatalogRecord::new("oai:c:1", precise)).unwrap();
        assert_eq!(store.get("oai:c:1").unwrap().unwrap().datestamp, precise);
    }
}
