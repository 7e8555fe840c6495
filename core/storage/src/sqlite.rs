//! SQLite-backed local store.
//!
//! Persists entities, the pending-operation queue and metadata in a single
//! database file. All engine calls run on the blocking thread pool against a
//! mutex-guarded connection.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use metapm_common::{EntityKind, Error, Result};

use crate::store::{
    format_timestamp, parse_timestamp, prepare_record, FailureRecord, LocalStore, MetadataEntry,
    PendingOperation,
};

const QUEUE_COLUMNS: &str = "id, operation, payload, enqueued_at, synced, synced_at";

/// Durable local store on SQLite.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Create or open a store database.
    ///
    /// # Postconditions
    /// - Every table and index exists
    /// - Writes are fully synchronous (durable on return)
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Self::init(Connection::open(db_path.as_ref())?)?;
        info!("Local store opened at {}", db_path.as_ref().display());
        Ok(Self::from_connection(conn))
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn).map(Self::from_connection)
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    fn init(conn: Connection) -> Result<Connection> {
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "FULL")?;

        let mut schema = String::new();
        for kind in EntityKind::ALL {
            let table = kind.table();
            schema.push_str(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    id TEXT PRIMARY KEY,
                    status TEXT,
                    parent_id TEXT,
                    local_updated_at TEXT NOT NULL,
                    data TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_{table}_status ON {table}(status);
                CREATE INDEX IF NOT EXISTS idx_{table}_parent ON {table}(parent_id);
                "#
            ));
        }
        schema.push_str(
            r#"
            CREATE TABLE IF NOT EXISTS sync_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                operation TEXT NOT NULL,
                payload TEXT NOT NULL,
                enqueued_at TEXT NOT NULL,
                synced INTEGER NOT NULL DEFAULT 0,
                synced_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_sync_queue_synced ON sync_queue(synced, id);

            CREATE TABLE IF NOT EXISTS sync_failures (
                queue_id INTEGER PRIMARY KEY,
                attempts INTEGER NOT NULL,
                last_error TEXT NOT NULL,
                last_attempt_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        );

        conn.execute_batch(&schema)?;
        Ok(conn)
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| Error::Storage("Connection lock poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| Error::Storage(format!("Store task failed: {}", e)))?
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<String> {
    row.get(0)
}

fn decode_records(raw: Vec<String>) -> Result<Vec<Value>> {
    raw.iter()
        .map(|data| serde_json::from_str(data).map_err(Error::from))
        .collect()
}

/// Raw queue row before JSON and timestamp decoding.
struct QueueRow {
    id: i64,
    operation: String,
    payload: String,
    enqueued_at: String,
    synced: bool,
    synced_at: Option<String>,
}

impl QueueRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            operation: row.get(1)?,
            payload: row.get(2)?,
            enqueued_at: row.get(3)?,
            synced: row.get::<_, i64>(4)? != 0,
            synced_at: row.get(5)?,
        })
    }

    fn decode(self) -> Result<PendingOperation> {
        Ok(PendingOperation {
            id: self.id,
            operation: self.operation,
            payload: serde_json::from_str(&self.payload)?,
            enqueued_at: parse_timestamp(&self.enqueued_at)?,
            synced: self.synced,
            synced_at: self.synced_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}

fn query_queue(conn: &Connection, filter: &str) -> Result<Vec<PendingOperation>> {
    let sql = format!(
        "SELECT {} FROM sync_queue {} ORDER BY id ASC",
        QUEUE_COLUMNS, filter
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], QueueRow::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(QueueRow::decode).collect()
}

#[async_trait]
impl LocalStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get_all(&self, kind: EntityKind) -> Result<Vec<Value>> {
        let raw = self
            .with_conn(move |conn| {
                let sql = format!("SELECT data FROM {} ORDER BY id ASC", kind.table());
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], record_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        decode_records(raw)
    }

    async fn get_one(&self, kind: EntityKind, id: &str) -> Result<Option<Value>> {
        let id = id.to_string();
        let raw = self
            .with_conn(move |conn| {
                let sql = format!("SELECT data FROM {} WHERE id = ?1", kind.table());
                Ok(conn
                    .query_row(&sql, params![id], record_from_row)
                    .optional()?)
            })
            .await?;
        raw.map(|data| serde_json::from_str(&data).map_err(Error::from))
            .transpose()
    }

    async fn save(&self, kind: EntityKind, record: Value) -> Result<String> {
        let prepared = prepare_record(kind, record, Utc::now())?;
        let data = serde_json::to_string(&prepared.record)?;
        debug!("Saving {} {}", kind, prepared.id);

        self.with_conn(move |conn| {
            let sql = format!(
                "INSERT OR REPLACE INTO {} (id, status, parent_id, local_updated_at, data)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                kind.table()
            );
            conn.execute(
                &sql,
                params![
                    prepared.id,
                    prepared.status,
                    prepared.parent,
                    prepared.local_updated_at,
                    data
                ],
            )?;
            Ok(prepared.id)
        })
        .await
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<()> {
        debug!("Deleting {} {}", kind, id);
        let id = id.to_string();
        self.with_conn(move |conn| {
            let sql = format!("DELETE FROM {} WHERE id = ?1", kind.table());
            conn.execute(&sql, params![id])?;
            Ok(())
        })
        .await
    }

    async fn bulk_save(&self, kind: EntityKind, records: Vec<Value>) -> Result<u64> {
        let mut prepared = Vec::with_capacity(records.len());
        for record in records {
            let item = prepare_record(kind, record, Utc::now())?;
            let data = serde_json::to_string(&item.record)?;
            prepared.push((item, data));
        }
        debug!("Bulk saving {} {} records", prepared.len(), kind);

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let sql = format!(
                    "INSERT OR REPLACE INTO {} (id, status, parent_id, local_updated_at, data)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    kind.table()
                );
                let mut stmt = tx.prepare(&sql)?;
                for (item, data) in &prepared {
                    stmt.execute(params![
                        item.id,
                        item.status,
                        item.parent,
                        item.local_updated_at,
                        data
                    ])?;
                }
            }
            let count: i64 = tx.query_row(
                &format!("SELECT COUNT(*) FROM {}", kind.table()),
                [],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(count as u64)
        })
        .await
    }

    async fn list_by_status(&self, kind: EntityKind, status: &str) -> Result<Vec<Value>> {
        let status = status.to_string();
        let raw = self
            .with_conn(move |conn| {
                let sql = format!(
                    "SELECT data FROM {} WHERE status = ?1 ORDER BY id ASC",
                    kind.table()
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![status], record_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        decode_records(raw)
    }

    async fn list_by_parent(&self, kind: EntityKind, parent: &str) -> Result<Vec<Value>> {
        if kind.parent_field().is_none() {
            return Ok(Vec::new());
        }
        let parent = parent.to_string();
        let raw = self
            .with_conn(move |conn| {
                let sql = format!(
                    "SELECT data FROM {} WHERE parent_id = ?1 ORDER BY id ASC",
                    kind.table()
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![parent], record_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        decode_records(raw)
    }

    async fn enqueue_raw(&self, operation: &str, payload: Value) -> Result<i64> {
        let operation = operation.to_string();
        let payload = serde_json::to_string(&payload)?;
        let enqueued_at = format_timestamp(Utc::now());

        let id = self
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO sync_queue (operation, payload, enqueued_at, synced)
                     VALUES (?1, ?2, ?3, 0)",
                    params![operation, payload, enqueued_at],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        debug!("Enqueued operation {}", id);
        Ok(id)
    }

    async fn list_pending(&self) -> Result<Vec<PendingOperation>> {
        self.with_conn(|conn| query_queue(conn, "WHERE synced = 0"))
            .await
    }

    async fn list_all(&self) -> Result<Vec<PendingOperation>> {
        self.with_conn(|conn| query_queue(conn, "")).await
    }

    async fn get_operation(&self, id: i64) -> Result<Option<PendingOperation>> {
        let row = self
            .with_conn(move |conn| {
                let sql = format!("SELECT {} FROM sync_queue WHERE id = ?1", QUEUE_COLUMNS);
                Ok(conn
                    .query_row(&sql, params![id], QueueRow::from_row)
                    .optional()?)
            })
            .await?;
        row.map(QueueRow::decode).transpose()
    }

    async fn mark_synced(&self, id: i64) -> Result<()> {
        let synced_at = format_timestamp(Utc::now());
        let updated = self
            .with_conn(move |conn| {
                Ok(conn.execute(
                    "UPDATE sync_queue SET synced = 1, synced_at = ?2 WHERE id = ?1",
                    params![id, synced_at],
                )?)
            })
            .await?;

        if updated == 0 {
            return Err(Error::NotFound(format!("Queue entry {}", id)));
        }
        Ok(())
    }

    async fn pending_count(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sync_queue WHERE synced = 0",
                [],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
        .await
    }

    async fn purge_synced(&self) -> Result<u64> {
        let removed = self
            .with_conn(|conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM sync_failures
                     WHERE queue_id IN (SELECT id FROM sync_queue WHERE synced = 1)",
                    [],
                )?;
                let removed = tx.execute("DELETE FROM sync_queue WHERE synced = 1", [])?;
                tx.commit()?;
                Ok(removed as u64)
            })
            .await?;
        info!("Purged {} synced queue entries", removed);
        Ok(removed)
    }

    async fn clear_queue(&self) -> Result<()> {
        info!("Clearing sync queue");
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM sync_queue", [])?;
            tx.execute("DELETE FROM sync_failures", [])?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn record_failure(&self, id: i64, error: &str) -> Result<u32> {
        let error = error.to_string();
        let now = format_timestamp(Utc::now());
        self.with_conn(move |conn| {
            let attempts: i64 = conn.query_row(
                "INSERT INTO sync_failures (queue_id, attempts, last_error, last_attempt_at)
                 VALUES (?1, 1, ?2, ?3)
                 ON CONFLICT(queue_id) DO UPDATE SET
                     attempts = attempts + 1,
                     last_error = excluded.last_error,
                     last_attempt_at = excluded.last_attempt_at
                 RETURNING attempts",
                params![id, error, now],
                |row| row.get(0),
            )?;
            Ok(attempts as u32)
        })
        .await
    }

    async fn failures(&self) -> Result<Vec<FailureRecord>> {
        let rows = self
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT queue_id, attempts, last_error, last_attempt_at
                     FROM sync_failures ORDER BY queue_id ASC",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(queue_id, attempts, last_error, at)| {
                Ok(FailureRecord {
                    queue_id,
                    attempts: attempts as u32,
                    last_error,
                    last_attempt_at: parse_timestamp(&at)?,
                })
            })
            .collect()
    }

    async fn reset_attempts(&self, id: i64) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM sync_failures WHERE queue_id = ?1", params![id])?;
            Ok(())
        })
        .await
    }

    async fn set_metadata(&self, key: &str, value: Value) -> Result<()> {
        let key = key.to_string();
        let value = serde_json::to_string(&value)?;
        let now = format_timestamp(Utc::now());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO metadata (key, value, updated_at) VALUES (?1, ?2, ?3)",
                params![key, value, now],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_metadata_entry(&self, key: &str) -> Result<Option<MetadataEntry>> {
        let key = key.to_string();
        let row = self
            .with_conn(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT key, value, updated_at FROM metadata WHERE key = ?1",
                        params![key],
                        |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, String>(2)?,
                            ))
                        },
                    )
                    .optional()?)
            })
            .await?;

        row.map(|(key, value, updated_at)| {
            Ok(MetadataEntry {
                key,
                value: serde_json::from_str(&value)?,
                timestamp: parse_timestamp(&updated_at)?,
            })
        })
        .transpose()
    }

    async fn clear_metadata(&self) -> Result<()> {
        info!("Clearing metadata");
        self.with_conn(|conn| {
            conn.execute("DELETE FROM metadata", [])?;
            Ok(())
        })
        .await
    }

    async fn clear_all(&self) -> Result<()> {
        info!("Clearing all local data");
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            for kind in EntityKind::ALL {
                tx.execute(&format!("DELETE FROM {}", kind.table()), [])?;
            }
            tx.execute("DELETE FROM sync_queue", [])?;
            tx.execute("DELETE FROM sync_failures", [])?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}
