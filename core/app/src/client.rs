//! Offline client: wires the local store, connectivity monitor, sync engine
//! and scheduler into one handle for application code.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use metapm_cache::{CachingFetcher, HttpFetcher, MemoryCache};
use metapm_common::{Action, Entity, EntityKind, Error, OperationKind, Result};
use metapm_storage::{EntityStoreExt, LocalStore, PendingOperation, SqliteStore};
use metapm_sync::{
    ConnectivityMonitor, EventBus, HttpTransport, ReachabilityProbe, RemoteTransport,
    StuckOperation, SyncEngine, SyncEvent, SyncReport, SyncScheduler, SyncStatus,
};

use crate::config::ClientConfig;

/// Engine type used by the client, with its collaborators behind trait objects.
pub type ClientEngine = SyncEngine<dyn LocalStore, dyn RemoteTransport>;

struct RunningScheduler {
    scheduler: SyncScheduler,
    task: JoinHandle<()>,
}

/// Application-facing handle over the offline layer.
///
/// Writes land in the local store and the queue immediately and never wait on
/// the network. The queue drains on reconnect (once [`start`](Self::start) is
/// called) or on [`sync_now`](Self::sync_now).
pub struct OfflineClient {
    store: Arc<dyn LocalStore>,
    engine: Arc<ClientEngine>,
    probe: Arc<dyn ReachabilityProbe>,
    probe_interval: Duration,
    scheduler: Mutex<Option<RunningScheduler>>,
}

impl OfflineClient {
    /// Open the client described by `config`.
    ///
    /// The initial connectivity state comes from one reachability probe.
    ///
    /// # Errors
    /// - `Config` for an invalid configuration
    /// - `Storage` if the database cannot be opened
    pub async fn open(config: &ClientConfig) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(SqliteStore::open(&config.database_path)?);
        let transport = Arc::new(HttpTransport::new(
            &config.base_url,
            &config.health_path,
            config.request_timeout(),
        )?);

        let client = Self::with_parts(
            store,
            transport.clone(),
            transport,
            false,
            config.sync.clone(),
            config.probe_interval(),
        );
        let online = client.probe_now().await;
        info!(
            "Offline client ready for {} ({})",
            config.base_url,
            if online { "online" } else { "offline" }
        );
        Ok(client)
    }

    /// Assemble a client from explicit collaborators.
    pub fn with_parts(
        store: Arc<dyn LocalStore>,
        transport: Arc<dyn RemoteTransport>,
        probe: Arc<dyn ReachabilityProbe>,
        initially_online: bool,
        sync: metapm_sync::SyncConfig,
        probe_interval: Duration,
    ) -> Self {
        let monitor = Arc::new(ConnectivityMonitor::new(initially_online));
        let events = EventBus::default();

        let bus = events.clone();
        monitor.on_change(move |online| bus.emit(SyncEvent::ConnectivityChanged(online)));

        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            transport,
            monitor,
            events,
            sync,
        ));

        Self {
            store,
            engine,
            probe,
            probe_interval,
            scheduler: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<ClientEngine> {
        &self.engine
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        self.engine.monitor()
    }

    pub fn is_online(&self) -> bool {
        self.monitor().is_online()
    }

    /// Subscribe to connectivity and sync-completion events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.engine.events().subscribe()
    }

    /// Start the background scheduler: reconnect-triggered sync plus periodic probing.
    ///
    /// # Errors
    /// - `Scheduler` if it is already running
    pub async fn start(&self) -> Result<()> {
        let mut running = self.scheduler.lock().await;
        if running.is_some() {
            return Err(Error::Scheduler("Scheduler already running".to_string()));
        }

        let (scheduler, handle) = SyncScheduler::new(self.monitor(), Some(self.probe_interval));
        let task = tokio::spawn(handle.run(self.engine.clone(), self.probe.clone()));
        *running = Some(RunningScheduler { scheduler, task });
        Ok(())
    }

    /// Stop the background scheduler and wait for it to exit.
    pub async fn shutdown(&self) {
        let running = self.scheduler.lock().await.take();
        if let Some(RunningScheduler { scheduler, task }) = running {
            scheduler.shutdown().await;
            if let Err(e) = task.await {
                debug!("Scheduler task ended abnormally: {}", e);
            }
        }
    }

    /// Probe reachability once and apply the result to the monitor.
    pub async fn probe_now(&self) -> bool {
        self.monitor().probe(&*self.probe).await
    }

    /// Run a sync pass now. `Ok(None)` when offline or already syncing.
    pub async fn sync_now(&self) -> Result<Option<SyncReport>> {
        self.engine.sync_all().await
    }

    pub async fn pull(&self, kind: EntityKind) -> Result<u64> {
        self.engine.pull(kind).await
    }

    pub async fn pull_all(&self) -> Result<HashMap<EntityKind, u64>> {
        self.engine.pull_all().await
    }

    pub async fn status(&self) -> Result<SyncStatus> {
        self.engine.status().await
    }

    pub async fn pending(&self) -> Result<Vec<PendingOperation>> {
        self.store.list_pending().await
    }

    pub async fn stuck(&self) -> Result<Vec<StuckOperation>> {
        self.engine.stuck_operations().await
    }

    pub async fn retry_stuck(&self, queue_id: i64) -> Result<()> {
        self.engine.retry_stuck(queue_id).await
    }

    /// Apply a mutation locally and queue it for the remote service.
    ///
    /// Create and update payloads are full records; they are saved and the
    /// stamped record is queued. A delete payload only needs the record key.
    /// Returns the queue id.
    ///
    /// # Errors
    /// - `InvalidInput` if the payload lacks the record key
    /// - `Storage` on store failure
    pub async fn apply(&self, operation: OperationKind, payload: Value) -> Result<i64> {
        let kind = operation.entity;
        let queued = match operation.action {
            Action::Create | Action::Update => {
                let id = self.store.save(kind, payload).await?;
                self.store
                    .get_one(kind, &id)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("{} {}", kind, id)))?
            }
            Action::Delete => {
                let id = kind.record_id(&payload)?;
                self.store.delete(kind, &id).await?;
                json!({ kind.key_field(): id })
            }
        };

        let queue_id = self.store.enqueue(operation, queued).await?;
        debug!("Queued {} as {}", operation, queue_id);
        Ok(queue_id)
    }

    /// Save a new record locally and queue its creation.
    pub async fn create<E: Entity>(&self, entity: &E) -> Result<i64> {
        self.apply(OperationKind::create(E::KIND), serde_json::to_value(entity)?)
            .await
    }

    /// Save a changed record locally and queue the update.
    pub async fn update<E: Entity>(&self, entity: &E) -> Result<i64> {
        self.apply(OperationKind::update(E::KIND), serde_json::to_value(entity)?)
            .await
    }

    /// Delete a record locally and queue the remote delete.
    pub async fn remove<E: Entity>(&self, id: &str) -> Result<i64> {
        self.apply(
            OperationKind::delete(E::KIND),
            json!({ E::KIND.key_field(): id }),
        )
        .await
    }

    pub async fn get<E: Entity>(&self, id: &str) -> Result<Option<E>> {
        self.store.get_entity(id).await
    }

    pub async fn list<E: Entity>(&self) -> Result<Vec<E>> {
        self.store.get_all_entities().await
    }

    /// Drop every queued operation, synced or not.
    pub async fn clear_sync_queue(&self) -> Result<()> {
        self.store.clear_queue().await
    }

    /// Empty every entity table and the queue, e.g. on logout.
    pub async fn clear_all(&self) -> Result<()> {
        self.store.clear_all().await
    }
}

/// Resource cache front end for the configured service, over an in-memory cache.
///
/// # Errors
/// - `Config` for an invalid base URL
pub fn resource_fetcher(
    config: &ClientConfig,
) -> Result<CachingFetcher<MemoryCache, HttpFetcher>> {
    let fetcher = HttpFetcher::new(&config.base_url, config.request_timeout())?;
    Ok(CachingFetcher::new(
        Arc::new(MemoryCache::new()),
        Arc::new(fetcher),
        config.cache.clone(),
    ))
}
