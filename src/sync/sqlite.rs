//! SQLite-backed local storage
//!
//! One database file holds both the engine's key-value settings (queue
//! snapshot, last sync time) and the entity rows with their sync columns.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::path::Path;

use super::local_store::LocalStore;
use super::record::EntityRecord;
use super::settings::SettingsStore;
use super::types::{EntitySyncStatus, EntityType};
use crate::error::{SyncError, SyncResult};

/// Database file name inside the data directory
pub const DB_FILE_NAME: &str = "sync.db";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> SyncResult<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> SyncResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    /// Open the store inside a data directory, creating it if needed
    pub fn open_in_dir(data_dir: &Path) -> SyncResult<Self> {
        std::fs::create_dir_all(data_dir)?;
        Self::open(data_dir.join(DB_FILE_NAME))
    }

    fn with_connection(conn: Connection) -> SyncResult<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// All live records of one type, ordered by id
    pub fn list(&self, entity_type: EntityType) -> SyncResult<Vec<EntityRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, data, updated_at, server_version, sync_status
             FROM entities
             WHERE entity_type = ?1 AND is_deleted = 0
             ORDER BY id",
        )?;

        let rows = stmt.query_map(params![entity_type.as_str()], |row| {
            Ok(RawRow {
                id: row.get(0)?,
                data: row.get(1)?,
                updated_at: row.get(2)?,
                server_version: row.get(3)?,
                sync_status: row.get(4)?,
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record(entity_type)?);
        }
        Ok(records)
    }

    /// Number of live records per sync status
    pub fn count_by_status(&self, status: EntitySyncStatus) -> SyncResult<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM entities WHERE sync_status = ?1 AND is_deleted = 0",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn upsert(&self, record: &EntityRecord) -> SyncResult<()> {
        let data = serde_json::to_string(&record.data)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO entities (entity_type, id, data, updated_at, server_version, sync_status, is_deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(entity_type, id) DO UPDATE SET
             data = excluded.data,
             updated_at = excluded.updated_at,
             server_version = excluded.server_version,
             sync_status = excluded.sync_status,
             is_deleted = excluded.is_deleted",
            params![
                record.entity_type.as_str(),
                record.id,
                data,
                record.updated_at.to_rfc3339(),
                record.server_version.map(|v| v as i64),
                record.sync_status.as_str(),
                record.deleted,
            ],
        )?;
        Ok(())
    }
}

fn init_schema(conn: &Connection) -> SyncResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS sync_metadata (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS entities (
            entity_type TEXT NOT NULL,
            id TEXT NOT NULL,
            data TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            server_version INTEGER,
            sync_status TEXT NOT NULL,
            is_deleted BOOLEAN NOT NULL DEFAULT 0,
            PRIMARY KEY (entity_type, id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_entities_status ON entities(sync_status)",
        [],
    )?;

    Ok(())
}

struct RawRow {
    id: String,
    data: String,
    updated_at: String,
    server_version: Option<i64>,
    sync_status: String,
}

impl RawRow {
    fn into_record(self, entity_type: EntityType) -> SyncResult<EntityRecord> {
        let data: Map<String, Value> = serde_json::from_str(&self.data)?;
        let updated_at = DateTime::parse_from_rfc3339(&self.updated_at)
            .map_err(|e| SyncError::Storage(format!("bad updated_at for {}: {}", self.id, e)))?
            .with_timezone(&Utc);
        let sync_status = EntitySyncStatus::parse(&self.sync_status).ok_or_else(|| {
            SyncError::Storage(format!("bad sync_status '{}' for {}", self.sync_status, self.id))
        })?;

        Ok(EntityRecord {
            entity_type,
            id: self.id,
            data,
            updated_at,
            server_version: self.server_version.map(|v| v as u64),
            sync_status,
            deleted: false,
        })
    }
}

impl SettingsStore for SqliteStore {
    fn get(&self, key: &str) -> SyncResult<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM sync_metadata WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> SyncResult<()> {
        let now = Utc::now().timestamp_millis();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sync_metadata (key, value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
             value = excluded.value,
             updated_at = excluded.updated_at",
            params![key, value, now],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> SyncResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM sync_metadata WHERE key = ?1", params![key])?;
        Ok(())
    }
}

#[async_trait]
impl LocalStore for SqliteStore {
    async fn get(&self, entity_type: EntityType, id: &str) -> SyncResult<Option<EntityRecord>> {
        let raw = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT id, data, updated_at, server_version, sync_status
                 FROM entities
                 WHERE entity_type = ?1 AND id = ?2 AND is_deleted = 0",
                params![entity_type.as_str(), id],
                |row| {
                    Ok(RawRow {
                        id: row.get(0)?,
                        data: row.get(1)?,
                        updated_at: row.get(2)?,
                        server_version: row.get(3)?,
                        sync_status: row.get(4)?,
                    })
                },
            )
            .optional()?
        };

        raw.map(|r| r.into_record(entity_type)).transpose()
    }

    async fn insert(&self, record: &EntityRecord) -> SyncResult<()> {
        // A soft-deleted row with the same key is revived
        self.upsert(record)
    }

    async fn update(&self, record: &EntityRecord) -> SyncResult<()> {
        let data = serde_json::to_string(&record.data)?;
        let changed = {
            let conn = self.conn.lock();
            conn.execute(
                "UPDATE entities SET
                 data = ?1,
                 updated_at = ?2,
                 server_version = ?3,
                 sync_status = ?4,
                 is_deleted = ?5
                 WHERE entity_type = ?6 AND id = ?7",
                params![
                    data,
                    record.updated_at.to_rfc3339(),
                    record.server_version.map(|v| v as i64),
                    record.sync_status.as_str(),
                    record.deleted,
                    record.entity_type.as_str(),
                    record.id,
                ],
            )?
        };

        if changed == 0 {
            return Err(SyncError::Storage(format!(
                "{} '{}' does not exist",
                record.entity_type, record.id
            )));
        }
        Ok(())
    }

    async fn soft_delete(&self, entity_type: EntityType, id: &str) -> SyncResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE entities SET is_deleted = 1 WHERE entity_type = ?1 AND id = ?2",
            params![entity_type.as_str(), id],
        )?;
        Ok(())
    }

    async fn mark_synced(
        &self,
        entity_type: EntityType,
        id: &str,
        server_version: Option<u64>,
    ) -> SyncResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE entities SET
             sync_status = 'synced',
             server_version = COALESCE(?1, server_version)
             WHERE entity_type = ?2 AND id = ?3",
            params![
                server_version.map(|v| v as i64),
                entity_type.as_str(),
                id
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn record(id: &str, content: &str) -> EntityRecord {
        EntityRecord::pending(
            EntityType::JournalEntry,
            id,
            json!({"content": content}).as_object().cloned().unwrap(),
            Utc.with_ymd_and_hms(2026, 10, 1, 8, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_metadata() {
        let store = SqliteStore::open_in_memory().unwrap();
        SettingsStore::set(&store, "test_key", "test_value").unwrap();
        assert_eq!(
            SettingsStore::get(&store, "test_key").unwrap().as_deref(),
            Some("test_value")
        );
        SettingsStore::set(&store, "test_key", "second").unwrap();
        assert_eq!(
            SettingsStore::get(&store, "test_key").unwrap().as_deref(),
            Some("second")
        );
        SettingsStore::remove(&store, "test_key").unwrap();
        assert_eq!(SettingsStore::get(&store, "test_key").unwrap(), None);
    }

    #[tokio::test]
    async fn test_entity_lifecycle() {
        let store = SqliteStore::open_in_memory().unwrap();
        let rec = record("je-1", "draft");
        store.insert(&rec).await.unwrap();

        let loaded = LocalStore::get(&store, EntityType::JournalEntry, "je-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, rec);
        assert_eq!(store.count_by_status(EntitySyncStatus::Pending).unwrap(), 1);

        store
            .mark_synced(EntityType::JournalEntry, "je-1", Some(3))
            .await
            .unwrap();
        let loaded = LocalStore::get(&store, EntityType::JournalEntry, "je-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.sync_status, EntitySyncStatus::Synced);
        assert_eq!(loaded.server_version, Some(3));

        // Unknown version keeps the stored one
        store
            .mark_synced(EntityType::JournalEntry, "je-1", None)
            .await
            .unwrap();
        let loaded = LocalStore::get(&store, EntityType::JournalEntry, "je-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.server_version, Some(3));

        store
            .soft_delete(EntityType::JournalEntry, "je-1")
            .await
            .unwrap();
        assert!(LocalStore::get(&store, EntityType::JournalEntry, "je-1")
            .await
            .unwrap()
            .is_none());
        assert!(store.list(EntityType::JournalEntry).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_requires_existing_row() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store.update(&record("ghost", "x")).await;
        assert!(matches!(err, Err(SyncError::Storage(_))));

        store.insert(&record("je-2", "one")).await.unwrap();
        store.update(&record("je-2", "two")).await.unwrap();
        let listed = store.list(EntityType::JournalEntry).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].data["content"], "two");
    }

    #[tokio::test]
    async fn test_reopen_from_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(DB_FILE_NAME);
        {
            let store = SqliteStore::open_in_dir(dir.path()).unwrap();
            store.insert(&record("je-3", "kept")).await.unwrap();
            SettingsStore::set(&store, "last_sync_time", "2026-10-01T00:00:00+00:00").unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.list(EntityType::JournalEntry).unwrap().len(), 1);
        assert!(SettingsStore::get(&store, "last_sync_time").unwrap().is_some());
    }
}
