//! Core sync engine: drains the pending-operation queue against the remote API.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use metapm_common::{EntityKind, Error, Result};
use metapm_storage::{FailureRecord, LocalStore, PendingOperation};

use crate::connectivity::ConnectivityMonitor;
use crate::events::{EventBus, SyncEvent};
use crate::state::{StuckOperation, SyncStatus};
use crate::transport::{ApiRequest, RemoteTransport};

/// Metadata key holding the completion time of the last sync pass.
pub const LAST_SYNC_KEY: &str = "lastSync";

/// Metadata key holding the completion time of the last full snapshot pull.
pub const LAST_PULL_KEY: &str = "lastPull";

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Failed attempts after which an entry is parked as stuck.
    /// `None` retries every unsynced entry on every pass.
    pub max_attempts: Option<u32>,
    /// Start a pass whenever connectivity is restored.
    pub sync_on_reconnect: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            sync_on_reconnect: true,
        }
    }
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub pass_id: Uuid,
    /// Entries sent to the remote service.
    pub attempted: usize,
    pub synced: usize,
    pub failed: usize,
    /// Entries skipped because they reached `max_attempts`.
    pub skipped_stuck: usize,
    pub duration: Duration,
    pub completed_at: DateTime<Utc>,
}

/// Clears the single-flight flag when the pass ends, however it ends.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Sync engine for draining queued local mutations.
///
/// At most one pass runs at a time per engine; a trigger while a pass is
/// running is a silent no-op, not a queued retry.
pub struct SyncEngine<S: ?Sized, T: ?Sized> {
    store: Arc<S>,
    transport: Arc<T>,
    monitor: Arc<ConnectivityMonitor>,
    events: EventBus,
    syncing: AtomicBool,
    config: SyncConfig,
}

impl<S, T> SyncEngine<S, T>
where
    S: LocalStore + ?Sized,
    T: RemoteTransport + ?Sized,
{
    /// Create a new sync engine.
    pub fn new(
        store: Arc<S>,
        transport: Arc<T>,
        monitor: Arc<ConnectivityMonitor>,
        events: EventBus,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            transport,
            monitor,
            events,
            syncing: AtomicBool::new(false),
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    /// Run one sync pass over the current snapshot of pending operations.
    ///
    /// Returns `Ok(None)` without touching the queue when offline or when
    /// another pass is already running. A failed operation is logged,
    /// recorded in the failure ledger and left unsynced; it never aborts the
    /// pass. Entries enqueued during the pass are left for the next one.
    ///
    /// # Errors
    /// - `Storage` if the pending snapshot cannot be read
    pub async fn sync_all(&self) -> Result<Option<SyncReport>> {
        if !self.monitor.is_online() {
            debug!("Offline, skipping sync");
            return Ok(None);
        }
        if self
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Sync already in progress");
            return Ok(None);
        }
        let _guard = PassGuard(&self.syncing);

        let start = Instant::now();
        let pass_id = Uuid::new_v4();
        let pending = self.store.list_pending().await?;
        let attempts = self.attempts_by_id().await?;
        info!("Syncing {} pending operations (pass {})", pending.len(), pass_id);

        let mut attempted = 0;
        let mut synced = 0;
        let mut failed = 0;
        let mut skipped_stuck = 0;

        for op in pending {
            if self.is_stuck(attempts.get(&op.id).copied()) {
                debug!("Skipping stuck operation {} ({})", op.id, op.operation);
                skipped_stuck += 1;
                continue;
            }

            attempted += 1;
            match self.sync_operation(&op).await {
                Ok(()) => match self.store.mark_synced(op.id).await {
                    Ok(()) => synced += 1,
                    Err(e) => {
                        error!("Operation {} sent but not marked synced: {}", op.id, e);
                        failed += 1;
                    }
                },
                Err(e) => {
                    failed += 1;
                    self.report_failure(&op, &e).await;
                }
            }
        }

        let completed_at = Utc::now();
        let stamp = completed_at.to_rfc3339_opts(SecondsFormat::Millis, true);
        if let Err(e) = self.store.set_metadata(LAST_SYNC_KEY, stamp.into()).await {
            warn!("Failed to record last sync time: {}", e);
        }

        let report = SyncReport {
            pass_id,
            attempted,
            synced,
            failed,
            skipped_stuck,
            duration: start.elapsed(),
            completed_at,
        };
        info!(
            "Sync completed in {:?}: {} synced, {} failed, {} stuck",
            report.duration, synced, failed, skipped_stuck
        );

        drop(_guard);
        self.events.emit(SyncEvent::SyncCompleted(report.clone()));
        Ok(Some(report))
    }

    /// Send one queue entry to the remote service.
    ///
    /// # Errors
    /// - `UnknownOperation` for an operation outside the known set
    /// - `InvalidInput` for a payload without its identifier
    /// - `Network` / `Http` when the remote call fails
    pub async fn sync_operation(&self, op: &PendingOperation) -> Result<()> {
        let request = ApiRequest::for_operation(op)?;
        debug!("Operation {}: {} {}", op.id, request.method, request.path);
        self.transport.send(&request).await?;
        Ok(())
    }

    /// Replace the local copy of one collection with the server snapshot.
    ///
    /// Records are upserted; local records missing from the snapshot are kept.
    pub async fn pull(&self, kind: EntityKind) -> Result<u64> {
        let records = self.transport.fetch_collection(kind).await?;
        let saved = self.store.bulk_save(kind, records).await?;
        info!("Pulled {} {}", saved, kind.table());
        Ok(saved)
    }

    /// Pull every collection, then stamp `lastPull`.
    ///
    /// Stops at the first collection that fails; earlier collections stay saved
    /// and `lastPull` is left untouched.
    pub async fn pull_all(&self) -> Result<HashMap<EntityKind, u64>> {
        let mut counts = HashMap::new();
        for kind in EntityKind::ALL {
            counts.insert(kind, self.pull(kind).await?);
        }
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        self.store.set_metadata(LAST_PULL_KEY, stamp.into()).await?;
        Ok(counts)
    }

    async fn report_failure(&self, op: &PendingOperation, err: &Error) {
        match err {
            Error::UnknownOperation(_) => {
                error!("Operation {} cannot be synced and will not succeed: {}", op.id, err)
            }
            _ => error!("Failed to sync operation {} ({}): {}", op.id, op.operation, err),
        }

        match self.store.record_failure(op.id, &err.to_string()).await {
            Ok(attempts) => {
                if self.is_stuck(Some(attempts)) {
                    warn!("Operation {} parked after {} failed attempts", op.id, attempts);
                }
            }
            Err(e) => warn!("Failed to record sync failure for {}: {}", op.id, e),
        }
    }

    async fn attempts_by_id(&self) -> Result<HashMap<i64, u32>> {
        if self.config.max_attempts.is_none() {
            return Ok(HashMap::new());
        }
        Ok(self
            .store
            .failures()
            .await?
            .into_iter()
            .map(|f| (f.queue_id, f.attempts))
            .collect())
    }

    fn is_stuck(&self, attempts: Option<u32>) -> bool {
        match (self.config.max_attempts, attempts) {
            (Some(max), Some(attempts)) => attempts >= max,
            _ => false,
        }
    }

    /// Unsynced entries parked after reaching `max_attempts`.
    pub async fn stuck_operations(&self) -> Result<Vec<StuckOperation>> {
        let Some(max) = self.config.max_attempts else {
            return Ok(Vec::new());
        };

        let mut failures: HashMap<i64, FailureRecord> = self
            .store
            .failures()
            .await?
            .into_iter()
            .filter(|f| f.attempts >= max)
            .map(|f| (f.queue_id, f))
            .collect();
        if failures.is_empty() {
            return Ok(Vec::new());
        }

        Ok(self
            .store
            .list_pending()
            .await?
            .into_iter()
            .filter_map(|operation| {
                failures
                    .remove(&operation.id)
                    .map(|failure| StuckOperation { operation, failure })
            })
            .collect())
    }

    /// Put a parked entry back into rotation.
    pub async fn retry_stuck(&self, queue_id: i64) -> Result<()> {
        if self.store.get_operation(queue_id).await?.is_none() {
            return Err(Error::NotFound(format!("Queue entry {}", queue_id)));
        }
        self.store.reset_attempts(queue_id).await
    }

    /// Snapshot for status indicators.
    pub async fn status(&self) -> Result<SyncStatus> {
        let pending = self.store.pending_count().await?;
        let stuck = self.stuck_operations().await?.len() as u64;
        let last_sync = self
            .store
            .get_metadata(LAST_SYNC_KEY)
            .await?
            .and_then(|v| v.as_str().map(str::to_string))
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|ts| ts.with_timezone(&Utc));

        Ok(SyncStatus {
            is_online: self.monitor.is_online(),
            syncing: self.is_syncing(),
            pending,
            stuck,
            last_sync,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use metapm_common::{Entity, EntityKind, OperationKind, Project, Requirement};
    use metapm_storage::{EntityStoreExt, MemoryStore};
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use tokio::sync::Notify;

    /// Records every call; fails paths listed in `failing`.
    #[derive(Default)]
    struct MockTransport {
        calls: Mutex<Vec<ApiRequest>>,
        failing: Mutex<Vec<String>>,
    }

    impl MockTransport {
        fn fail_path(&self, path: &str) {
            self.failing.lock().unwrap().push(path.to_string());
        }

        fn calls(&self) -> Vec<ApiRequest> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RemoteTransport for MockTransport {
        async fn send(&self, request: &ApiRequest) -> Result<Option<Value>> {
            self.calls.lock().unwrap().push(request.clone());
            if self.failing.lock().unwrap().contains(&request.path) {
                return Err(Error::Network("connection reset".to_string()));
            }
            Ok(Some(json!({"ok": true})))
        }
    }

    fn engine(
        store: Arc<MemoryStore>,
        transport: Arc<MockTransport>,
        online: bool,
        config: SyncConfig,
    ) -> SyncEngine<MemoryStore, MockTransport> {
        SyncEngine::new(
            store,
            transport,
            Arc::new(ConnectivityMonitor::new(online)),
            EventBus::default(),
            config,
        )
    }

    #[tokio::test]
    async fn test_offline_is_noop() {
        let store = Arc::new(MemoryStore::new());
        store
            .enqueue(OperationKind::create(EntityKind::Task), json!({"taskId": 1}))
            .await
            .unwrap();
        let transport = Arc::new(MockTransport::default());
        let engine = engine(store.clone(), transport.clone(), false, SyncConfig::default());

        assert!(engine.sync_all().await.unwrap().is_none());
        assert!(transport.calls().is_empty());
        assert_eq!(store.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failure_does_not_abort_pass() {
        let store = Arc::new(MemoryStore::new());
        let first = store
            .enqueue(OperationKind::create(EntityKind::Task), json!({"taskId": 1}))
            .await
            .unwrap();
        let second = store
            .enqueue(OperationKind::update(EntityKind::Task), json!({"taskId": 2}))
            .await
            .unwrap();
        let third = store
            .enqueue(OperationKind::delete(EntityKind::Bug), json!({"bugId": "B-1"}))
            .await
            .unwrap();

        let transport = Arc::new(MockTransport::default());
        transport.fail_path("/api/tasks/2");
        let engine = engine(store.clone(), transport.clone(), true, SyncConfig::default());

        let report = engine.sync_all().await.unwrap().unwrap();
        assert_eq!(report.attempted, 3);
        assert_eq!(report.synced, 2);
        assert_eq!(report.failed, 1);

        let pending: Vec<i64> = store
            .list_pending()
            .await
            .unwrap()
            .iter()
            .map(|op| op.id)
            .collect();
        assert_eq!(pending, vec![second]);
        assert!(store.get_operation(first).await.unwrap().unwrap().synced);
        assert!(store.get_operation(third).await.unwrap().unwrap().synced);
        assert!(store.get_metadata(LAST_SYNC_KEY).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_operations_sent_in_enqueue_order() {
        let store = Arc::new(MemoryStore::new());
        for id in ["C", "A", "B"] {
            store
                .enqueue(OperationKind::update(EntityKind::Project), json!({"projectCode": id}))
                .await
                .unwrap();
        }
        let transport = Arc::new(MockTransport::default());
        let engine = engine(store, transport.clone(), true, SyncConfig::default());

        engine.sync_all().await.unwrap();

        let paths: Vec<String> = transport.calls().into_iter().map(|r| r.path).collect();
        assert_eq!(
            paths,
            vec!["/api/projects/C", "/api/projects/A", "/api/projects/B"]
        );
    }

    #[tokio::test]
    async fn test_unknown_operation_reported_and_kept() {
        let store = Arc::new(MemoryStore::new());
        let bad = store.enqueue_raw("ARCHIVE_TASK", json!({"taskId": 1})).await.unwrap();
        store
            .enqueue(OperationKind::create(EntityKind::Task), json!({"taskId": 2}))
            .await
            .unwrap();
        let transport = Arc::new(MockTransport::default());
        let engine = engine(store.clone(), transport.clone(), true, SyncConfig::default());

        let report = engine.sync_all().await.unwrap().unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(transport.calls().len(), 1);

        let pending = store.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, bad);
    }

    #[tokio::test]
    async fn test_failed_operation_retried_next_pass() {
        let store = Arc::new(MemoryStore::new());
        store
            .enqueue(OperationKind::create(EntityKind::Bug), json!({"bugId": "B-1"}))
            .await
            .unwrap();
        let transport = Arc::new(MockTransport::default());
        transport.fail_path("/api/backlog/bugs");
        let engine = engine(store.clone(), transport.clone(), true, SyncConfig::default());

        engine.sync_all().await.unwrap();
        assert_eq!(store.pending_count().await.unwrap(), 1);

        transport.failing.lock().unwrap().clear();
        let report = engine.sync_all().await.unwrap().unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(store.pending_count().await.unwrap(), 0);
        assert_eq!(transport.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_max_attempts_parks_operation() {
        let store = Arc::new(MemoryStore::new());
        let id = store
            .enqueue(OperationKind::update(EntityKind::Task), json!({"taskId": 9}))
            .await
            .unwrap();
        let transport = Arc::new(MockTransport::default());
        transport.fail_path("/api/tasks/9");
        let config = SyncConfig {
            max_attempts: Some(2),
            ..SyncConfig::default()
        };
        let engine = engine(store.clone(), transport.clone(), true, config);

        engine.sync_all().await.unwrap();
        engine.sync_all().await.unwrap();
        let report = engine.sync_all().await.unwrap().unwrap();

        assert_eq!(report.attempted, 0);
        assert_eq!(report.skipped_stuck, 1);
        assert_eq!(transport.calls().len(), 2);

        let stuck = engine.stuck_operations().await.unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].operation.id, id);
        assert_eq!(stuck[0].failure.attempts, 2);

        engine.retry_stuck(id).await.unwrap();
        assert!(engine.stuck_operations().await.unwrap().is_empty());
        assert!(matches!(
            engine.retry_stuck(404).await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    /// Blocks inside `send` until released, to hold a pass open.
    struct GatedTransport {
        entered: Notify,
        release: Notify,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl RemoteTransport for GatedTransport {
        async fn send(&self, _request: &ApiRequest) -> Result<Option<Value>> {
            *self.calls.lock().unwrap() += 1;
            self.entered.notify_one();
            self.release.notified().await;
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_single_flight() {
        let store = Arc::new(MemoryStore::new());
        store
            .enqueue(OperationKind::create(EntityKind::Task), json!({"taskId": 1}))
            .await
            .unwrap();
        let transport = Arc::new(GatedTransport {
            entered: Notify::new(),
            release: Notify::new(),
            calls: Mutex::new(0),
        });
        let engine = Arc::new(SyncEngine::new(
            store,
            transport.clone(),
            Arc::new(ConnectivityMonitor::new(true)),
            EventBus::default(),
            SyncConfig::default(),
        ));

        let running = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.sync_all().await })
        };
        transport.entered.notified().await;
        assert!(engine.is_syncing());

        // A second trigger while the first pass is in flight is a no-op.
        assert!(engine.sync_all().await.unwrap().is_none());

        transport.release.notify_one();
        let report = running.await.unwrap().unwrap().unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(*transport.calls.lock().unwrap(), 1);
        assert!(!engine.is_syncing());
    }

    #[tokio::test]
    async fn test_completion_event_emitted() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(MockTransport::default());
        let engine = engine(store, transport, true, SyncConfig::default());
        let mut events = engine.events().subscribe();

        engine.sync_all().await.unwrap();

        match events.recv().await.unwrap() {
            SyncEvent::SyncCompleted(report) => assert_eq!(report.attempted, 0),
            other => panic!("unexpected event {:?}", other),
        }
    }

    /// Serves fixed collection envelopes.
    struct SnapshotTransport;

    #[async_trait]
    impl RemoteTransport for SnapshotTransport {
        async fn send(&self, request: &ApiRequest) -> Result<Option<Value>> {
            let body = match request.path.as_str() {
                "/api/tasks" => json!({"tasks": [
                    {"taskId": 1, "title": "a", "status": "todo", "projectCode": "P"},
                    {"taskId": 2, "title": "b", "status": "done", "projectCode": "P"}
                ]}),
                "/api/projects" => json!({"projects": [{"projectCode": "P", "projectName": "Pilot"}]}),
                "/api/backlog/bugs" => json!({"bugs": []}),
                "/api/backlog/requirements" => json!([{"requirementId": 7, "projectId": 3}]),
                other => return Err(Error::Http { status: 404, body: other.to_string() }),
            };
            Ok(Some(body))
        }
    }

    #[tokio::test]
    async fn test_pull_all_hydrates_store() {
        let store = Arc::new(MemoryStore::new());
        let engine = SyncEngine::new(
            store.clone(),
            Arc::new(SnapshotTransport),
            Arc::new(ConnectivityMonitor::new(true)),
            EventBus::default(),
            SyncConfig::default(),
        );

        let counts = engine.pull_all().await.unwrap();
        assert_eq!(counts[&EntityKind::Task], 2);
        assert_eq!(counts[&EntityKind::Bug], 0);
        assert_eq!(counts[&EntityKind::Requirement], 1);

        let done = store.list_by_status(EntityKind::Task, "done").await.unwrap();
        assert_eq!(done.len(), 1);
        let projects: Vec<Project> = store.get_all_entities().await.unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].project_name, "Pilot");
        let requirements: Vec<Requirement> = store.get_all_entities().await.unwrap();
        assert_eq!(requirements[0].id(), "7");
        assert!(store.get_metadata(LAST_PULL_KEY).await.unwrap().is_some());
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let store = Arc::new(MemoryStore::new());
        store.enqueue_raw("CREATE_TASK", json!({"taskId": 1})).await.unwrap();
        let transport = Arc::new(MockTransport::default());
        let engine = engine(store, transport, false, SyncConfig::default());

        let status = engine.status().await.unwrap();
        assert!(!status.is_online);
        assert_eq!(status.pending, 1);
        assert!(status.last_sync.is_none());
    }
}
