//! In-memory local store for testing.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

use metapm_common::{EntityKind, Error, Result};

use crate::store::{prepare_record, FailureRecord, LocalStore, MetadataEntry, PendingOperation};

/// Stored record with its index columns.
#[derive(Debug, Clone)]
struct Row {
    status: Option<String>,
    parent: Option<String>,
    record: Value,
}

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<EntityKind, BTreeMap<String, Row>>,
    queue: BTreeMap<i64, PendingOperation>,
    next_queue_id: i64,
    failures: BTreeMap<i64, FailureRecord>,
    metadata: HashMap<String, MetadataEntry>,
}

impl Inner {
    fn table(&self, kind: EntityKind) -> impl Iterator<Item = &Row> {
        self.tables.get(&kind).into_iter().flat_map(|t| t.values())
    }
}

/// In-memory local store.
///
/// Useful for testing and previews. All data is lost on drop. Every
/// operation takes a single lock, so multi-table operations are atomic.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| Error::Storage("Memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| Error::Storage("Memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get_all(&self, kind: EntityKind) -> Result<Vec<Value>> {
        Ok(self.read()?.table(kind).map(|row| row.record.clone()).collect())
    }

    async fn get_one(&self, kind: EntityKind, id: &str) -> Result<Option<Value>> {
        Ok(self
            .read()?
            .tables
            .get(&kind)
            .and_then(|t| t.get(id))
            .map(|row| row.record.clone()))
    }

    async fn save(&self, kind: EntityKind, record: Value) -> Result<String> {
        let prepared = prepare_record(kind, record, Utc::now())?;
        debug!("Saving {} {}", kind, prepared.id);

        let row = Row {
            status: prepared.status,
            parent: prepared.parent,
            record: prepared.record,
        };
        self.write()?
            .tables
            .entry(kind)
            .or_default()
            .insert(prepared.id.clone(), row);
        Ok(prepared.id)
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<()> {
        debug!("Deleting {} {}", kind, id);
        if let Some(table) = self.write()?.tables.get_mut(&kind) {
            table.remove(id);
        }
        Ok(())
    }

    async fn bulk_save(&self, kind: EntityKind, records: Vec<Value>) -> Result<u64> {
        // Validate everything before touching the table.
        let prepared = records
            .into_iter()
            .map(|record| prepare_record(kind, record, Utc::now()))
            .collect::<Result<Vec<_>>>()?;

        let mut inner = self.write()?;
        let table = inner.tables.entry(kind).or_default();
        for item in prepared {
            table.insert(
                item.id,
                Row {
                    status: item.status,
                    parent: item.parent,
                    record: item.record,
                },
            );
        }
        Ok(table.len() as u64)
    }

    async fn list_by_status(&self, kind: EntityKind, status: &str) -> Result<Vec<Value>> {
        Ok(self
            .read()?
            .table(kind)
            .filter(|row| row.status.as_deref() == Some(status))
            .map(|row| row.record.clone())
            .collect())
    }

    async fn list_by_parent(&self, kind: EntityKind, parent: &str) -> Result<Vec<Value>> {
        Ok(self
            .read()?
            .table(kind)
            .filter(|row| row.parent.as_deref() == Some(parent))
            .map(|row| row.record.clone())
            .collect())
    }

    async fn enqueue_raw(&self, operation: &str, payload: Value) -> Result<i64> {
        let mut inner = self.write()?;
        inner.next_queue_id += 1;
        let id = inner.next_queue_id;

        inner.queue.insert(
            id,
            PendingOperation {
                id,
                operation: operation.to_string(),
                payload,
                enqueued_at: Utc::now(),
                synced: false,
                synced_at: None,
            },
        );
        debug!("Enqueued operation {}", id);
        Ok(id)
    }

    async fn list_pending(&self) -> Result<Vec<PendingOperation>> {
        Ok(self
            .read()?
            .queue
            .values()
            .filter(|op| !op.synced)
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<PendingOperation>> {
        Ok(self.read()?.queue.values().cloned().collect())
    }

    async fn get_operation(&self, id: i64) -> Result<Option<PendingOperation>> {
        Ok(self.read()?.queue.get(&id).cloned())
    }

    async fn mark_synced(&self, id: i64) -> Result<()> {
        let mut inner = self.write()?;
        let op = inner
            .queue
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("Queue entry {}", id)))?;
        op.synced = true;
        op.synced_at = Some(Utc::now());
        Ok(())
    }

    async fn pending_count(&self) -> Result<u64> {
        Ok(self.read()?.queue.values().filter(|op| !op.synced).count() as u64)
    }

    async fn purge_synced(&self) -> Result<u64> {
        let mut inner = self.write()?;
        let synced: Vec<i64> = inner
            .queue
            .values()
            .filter(|op| op.synced)
            .map(|op| op.id)
            .collect();
        for id in &synced {
            inner.queue.remove(id);
            inner.failures.remove(id);
        }
        info!("Purged {} synced queue entries", synced.len());
        Ok(synced.len() as u64)
    }

    async fn clear_queue(&self) -> Result<()> {
        info!("Clearing sync queue");
        let mut inner = self.write()?;
        inner.queue.clear();
        inner.failures.clear();
        Ok(())
    }

    async fn record_failure(&self, id: i64, error: &str) -> Result<u32> {
        let mut inner = self.write()?;
        let record = inner.failures.entry(id).or_insert_with(|| FailureRecord {
            queue_id: id,
            attempts: 0,
            last_error: String::new(),
            last_attempt_at: Utc::now(),
        });
        record.attempts += 1;
        record.last_error = error.to_string();
        record.last_attempt_at = Utc::now();
        Ok(record.attempts)
    }

    async fn failures(&self) -> Result<Vec<FailureRecord>> {
        Ok(self.read()?.failures.values().cloned().collect())
    }

    async fn reset_attempts(&self, id: i64) -> Result<()> {
        self.write()?.failures.remove(&id);
        Ok(())
    }

    async fn set_metadata(&self, key: &str, value: Value) -> Result<()> {
        self.write()?.metadata.insert(
            key.to_string(),
            MetadataEntry {
                key: key.to_string(),
                value,
                timestamp: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get_metadata_entry(&self, key: &str) -> Result<Option<MetadataEntry>> {
        Ok(self.read()?.metadata.get(key).cloned())
    }

    async fn clear_metadata(&self) -> Result<()> {
        self.write()?.metadata.clear();
        Ok(())
    }

    async fn clear_all(&self) -> Result<()> {
        info!("Clearing all local data");
        let mut inner = self.write()?;
        inner.tables.clear();
        inner.queue.clear();
        inner.failures.clear();
        Ok(())
    }
}
