//! Sync scheduling: reconnect-triggered passes, periodic probing and manual requests.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use metapm_common::{Error, Result};
use metapm_storage::LocalStore;

use crate::connectivity::{ConnectivityMonitor, ObserverId, ReachabilityProbe};
use crate::engine::{SyncEngine, SyncReport};
use crate::transport::RemoteTransport;

/// Requests served by the scheduler task.
#[derive(Debug)]
pub enum SyncRequest {
    /// Run a pass now and report its outcome.
    Sync(oneshot::Sender<Result<Option<SyncReport>>>),
    /// Probe reachability now and report the resulting state.
    Probe(oneshot::Sender<bool>),
    /// Stop the scheduler task.
    Shutdown,
}

/// Front end for a running scheduler task. Cheap to clone.
#[derive(Clone)]
pub struct SyncScheduler {
    request_tx: mpsc::Sender<SyncRequest>,
}

impl SyncScheduler {
    /// Create a scheduler bound to `monitor`.
    ///
    /// Online transitions reported to the monitor become sync triggers for
    /// the handle until it is dropped. `probe_interval` of `None` or zero
    /// disables periodic probing.
    pub fn new(
        monitor: &Arc<ConnectivityMonitor>,
        probe_interval: Option<Duration>,
    ) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(32);
        let (reconnect_tx, reconnect_rx) = mpsc::unbounded_channel();

        let observer = monitor.on_change(move |online| {
            if online {
                let _ = reconnect_tx.send(());
            }
        });

        if probe_interval.is_some_and(|period| period.is_zero()) {
            warn!("Zero interval, periodic reachability checks disabled");
        }

        let handle = SyncSchedulerHandle {
            request_rx,
            reconnect_rx,
            probe_interval: probe_interval.filter(|period| !period.is_zero()),
            monitor: monitor.clone(),
            observer,
        };
        (Self { request_tx }, handle)
    }

    /// Run a pass and wait for its report.
    ///
    /// `Ok(None)` means the pass was a no-op (offline or already running).
    pub async fn request_sync(&self) -> Result<Option<SyncReport>> {
        let (tx, rx) = oneshot::channel();
        self.send(SyncRequest::Sync(tx)).await?;
        rx.await
            .map_err(|_| Error::Scheduler("Failed to receive sync result".to_string()))?
    }

    /// Probe reachability and return the resulting online state.
    pub async fn request_probe(&self) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.send(SyncRequest::Probe(tx)).await?;
        rx.await
            .map_err(|_| Error::Scheduler("Failed to receive probe result".to_string()))
    }

    /// Stop the scheduler task. A no-op when it already stopped.
    pub async fn shutdown(&self) {
        let _ = self.request_tx.send(SyncRequest::Shutdown).await;
    }

    async fn send(&self, request: SyncRequest) -> Result<()> {
        self.request_tx
            .send(request)
            .await
            .map_err(|_| Error::Scheduler("Scheduler not running".to_string()))
    }
}

/// Receiving half, consumed by [`SyncSchedulerHandle::run`].
///
/// Dropping it, including when `run` returns, detaches the reconnect
/// trigger from the monitor.
pub struct SyncSchedulerHandle {
    request_rx: mpsc::Receiver<SyncRequest>,
    reconnect_rx: mpsc::UnboundedReceiver<()>,
    probe_interval: Option<Duration>,
    monitor: Arc<ConnectivityMonitor>,
    observer: ObserverId,
}

impl Drop for SyncSchedulerHandle {
    fn drop(&mut self) {
        self.monitor.unsubscribe(self.observer);
    }
}

impl SyncSchedulerHandle {
    /// Run the scheduler loop until shutdown.
    ///
    /// This should be spawned in a tokio task. Passes run inline, so a
    /// request arriving mid-pass is served once that pass finishes.
    pub async fn run<S, T, P>(mut self, engine: Arc<SyncEngine<S, T>>, probe: Arc<P>)
    where
        S: LocalStore + ?Sized,
        T: RemoteTransport + ?Sized,
        P: ReachabilityProbe + ?Sized,
    {
        let mut ticker = self.probe_interval.map(|period| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });

        info!("Sync scheduler started");

        loop {
            tokio::select! {
                request = self.request_rx.recv() => match request {
                    Some(SyncRequest::Sync(response_tx)) => {
                        debug!("Processing manual sync request");
                        let _ = response_tx.send(engine.sync_all().await);
                    }
                    Some(SyncRequest::Probe(response_tx)) => {
                        let _ = response_tx.send(engine.monitor().probe(&*probe).await);
                    }
                    Some(SyncRequest::Shutdown) | None => {
                        info!("Sync scheduler shutting down");
                        break;
                    }
                },

                Some(()) = self.reconnect_rx.recv() => {
                    // Collapse a burst of transitions into one pass.
                    while self.reconnect_rx.try_recv().is_ok() {}
                    if engine.config().sync_on_reconnect {
                        debug!("Connectivity restored, triggering sync");
                        Self::log_pass(engine.sync_all().await);
                    }
                }

                _ = Self::wait_for_tick(&mut ticker) => {
                    engine.monitor().probe(&*probe).await;
                }
            }
        }
    }

    fn log_pass(result: Result<Option<SyncReport>>) {
        match result {
            Ok(Some(report)) => info!(
                "Reconnect sync completed: {} synced, {} failed",
                report.synced, report.failed
            ),
            Ok(None) => debug!("Reconnect sync skipped"),
            Err(e) => error!("Reconnect sync failed: {}", e),
        }
    }

    async fn wait_for_tick(ticker: &mut Option<Interval>) {
        match ticker {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}
