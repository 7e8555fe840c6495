//! Local store trait definition.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use metapm_common::{Entity, EntityKind, Error, OperationKind, Result};

/// Field stamped on every locally written record.
pub const LOCAL_UPDATED_AT: &str = "localUpdatedAt";

/// A recorded local mutation not yet confirmed by the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    /// Locally assigned, monotonically increasing sequence id.
    pub id: i64,
    /// Raw operation name, e.g. `CREATE_TASK`.
    pub operation: String,
    /// Entity data, or `{ <keyField>: id }` for deletes.
    pub payload: Value,
    /// When the operation was enqueued.
    pub enqueued_at: DateTime<Utc>,
    pub synced: bool,
    pub synced_at: Option<DateTime<Utc>>,
}

impl PendingOperation {
    /// Parse the operation name.
    ///
    /// # Errors
    /// - `UnknownOperation` if the name is outside the known set
    pub fn kind(&self) -> Result<OperationKind> {
        self.operation.parse()
    }
}

/// Failure bookkeeping for one queue entry, kept apart from the queue itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub queue_id: i64,
    pub attempts: u32,
    pub last_error: String,
    pub last_attempt_at: DateTime<Utc>,
}

/// A metadata value with the time it was last written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub key: String,
    pub value: Value,
    pub timestamp: DateTime<Utc>,
}

/// Local store for entities, the pending-operation queue and metadata.
///
/// Entity records are handled as JSON objects keyed by the natural
/// identifier of their `EntityKind`; see `EntityStoreExt` for typed access.
/// Operations on different entity kinds may interleave freely.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Backend name (e.g., "sqlite", "memory").
    fn name(&self) -> &str;

    /// Every record of a kind, in store-native (key) order.
    async fn get_all(&self, kind: EntityKind) -> Result<Vec<Value>>;

    /// A record by primary key, or `None` if absent.
    async fn get_one(&self, kind: EntityKind, id: &str) -> Result<Option<Value>>;

    /// Upsert a full record, stamping `localUpdatedAt`.
    ///
    /// # Postconditions
    /// - The record is durably persisted when the call returns
    /// - Any previous record with the same key is replaced
    ///
    /// # Errors
    /// - `InvalidInput` if the record is not an object or lacks its key
    /// - `Storage` on engine failure
    async fn save(&self, kind: EntityKind, record: Value) -> Result<String>;

    /// Remove a record. Deleting a missing key is a no-op.
    async fn delete(&self, kind: EntityKind, id: &str) -> Result<()>;

    /// Upsert many records of one kind in a single transaction.
    ///
    /// Each record is stamped independently. Returns the resulting total
    /// number of records of that kind.
    async fn bulk_save(&self, kind: EntityKind, records: Vec<Value>) -> Result<u64>;

    /// Records of a kind with the given `status`.
    async fn list_by_status(&self, kind: EntityKind, status: &str) -> Result<Vec<Value>>;

    /// Records of a kind grouped under the given parent identifier.
    async fn list_by_parent(&self, kind: EntityKind, parent: &str) -> Result<Vec<Value>>;

    /// Append an entry to the queue under a raw operation name.
    ///
    /// No bound is imposed on queue length; see `purge_synced`.
    async fn enqueue_raw(&self, operation: &str, payload: Value) -> Result<i64>;

    /// Append a known operation to the queue.
    async fn enqueue(&self, operation: OperationKind, payload: Value) -> Result<i64> {
        self.enqueue_raw(&operation.to_string(), payload).await
    }

    /// Unsynced entries in enqueue order.
    async fn list_pending(&self) -> Result<Vec<PendingOperation>>;

    /// Every entry, synced or not, in enqueue order.
    async fn list_all(&self) -> Result<Vec<PendingOperation>>;

    /// A queue entry by id.
    async fn get_operation(&self, id: i64) -> Result<Option<PendingOperation>>;

    /// Flip an entry to synced and stamp `syncedAt`.
    ///
    /// # Errors
    /// - `NotFound` if no entry has this id
    async fn mark_synced(&self, id: i64) -> Result<()>;

    /// Number of unsynced entries.
    async fn pending_count(&self) -> Result<u64>;

    /// Remove entries already marked synced. Returns how many were removed.
    async fn purge_synced(&self) -> Result<u64>;

    /// Remove every queue entry regardless of state, and the failure ledger.
    async fn clear_queue(&self) -> Result<()>;

    /// Record a failed sync attempt. Returns the attempt count so far.
    async fn record_failure(&self, id: i64, error: &str) -> Result<u32>;

    /// Failure ledger, ordered by queue id.
    async fn failures(&self) -> Result<Vec<FailureRecord>>;

    /// Forget recorded failures for one entry.
    async fn reset_attempts(&self, id: i64) -> Result<()>;

    /// Create or overwrite a metadata value.
    async fn set_metadata(&self, key: &str, value: Value) -> Result<()>;

    /// A metadata entry with its timestamp.
    async fn get_metadata_entry(&self, key: &str) -> Result<Option<MetadataEntry>>;

    /// A metadata value, or `None` if never set.
    async fn get_metadata(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.get_metadata_entry(key).await?.map(|entry| entry.value))
    }

    /// Remove every metadata entry.
    async fn clear_metadata(&self) -> Result<()>;

    /// Empty every entity table, the queue and the failure ledger atomically.
    ///
    /// A fault leaves either everything cleared or nothing cleared.
    async fn clear_all(&self) -> Result<()>;
}

/// Typed access to entity tables.
#[async_trait]
pub trait EntityStoreExt: LocalStore {
    async fn get_all_entities<E: Entity>(&self) -> Result<Vec<E>> {
        self.get_all(E::KIND)
            .await?
            .into_iter()
            .map(|record| serde_json::from_value(record).map_err(Error::from))
            .collect()
    }

    async fn get_entity<E: Entity>(&self, id: &str) -> Result<Option<E>> {
        match self.get_one(E::KIND, id).await? {
            Some(record) => Ok(Some(serde_json::from_value(record)?)),
            None => Ok(None),
        }
    }

    async fn save_entity<E: Entity>(&self, entity: &E) -> Result<String> {
        let record = serde_json::to_value(entity)?;
        self.save(E::KIND, record).await
    }

    async fn delete_entity<E: Entity>(&self, id: &str) -> Result<()> {
        self.delete(E::KIND, id).await
    }

    async fn bulk_save_entities<E: Entity>(&self, entities: &[E]) -> Result<u64> {
        let records = entities
            .iter()
            .map(|entity| serde_json::to_value(entity).map_err(Error::from))
            .collect::<Result<Vec<_>>>()?;
        self.bulk_save(E::KIND, records).await
    }
}

impl<S: LocalStore + ?Sized> EntityStoreExt for S {}

/// Format a timestamp the way records carry it (RFC 3339, millisecond precision).
pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| Error::Storage(format!("Corrupt timestamp '{}': {}", raw, e)))
}

/// Validated, stamped record ready to be written.
pub(crate) struct PreparedRecord {
    pub id: String,
    pub status: Option<String>,
    pub parent: Option<String>,
    pub local_updated_at: String,
    pub record: Value,
}

/// Validate a record for `kind` and stamp `localUpdatedAt`.
pub(crate) fn prepare_record(
    kind: EntityKind,
    mut record: Value,
    now: DateTime<Utc>,
) -> Result<PreparedRecord> {
    let id = kind.record_id(&record)?;
    let stamp = format_timestamp(now);

    let obj = record.as_object_mut().ok_or_else(|| {
        Error::InvalidInput(format!("{} record must be a JSON object", kind))
    })?;
    obj.insert(LOCAL_UPDATED_AT.to_string(), Value::String(stamp.clone()));

    let status = obj.get("status").and_then(scalar_to_string);
    let parent = kind
        .parent_field()
        .and_then(|field| obj.get(field))
        .and_then(scalar_to_string);

    Ok(PreparedRecord {
        id,
        status,
        parent,
        local_updated_at: stamp,
        record,
    })
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
