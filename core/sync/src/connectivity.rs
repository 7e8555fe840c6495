//! Connectivity monitor: a two-state (Online/Offline) machine fed by host
//! network signals and an active reachability probe.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use metapm_common::Result;

/// Subscriber notified on every connectivity transition.
pub trait ConnectivityObserver: Send + Sync {
    /// Called with the new state. Never called for same-state reports.
    fn on_connectivity_change(&self, online: bool);
}

impl<F> ConnectivityObserver for F
where
    F: Fn(bool) + Send + Sync,
{
    fn on_connectivity_change(&self, online: bool) {
        self(online)
    }
}

/// Lightweight reachability check against the remote service.
///
/// Host-level network signals can be wrong (e.g. a captive portal), so the
/// monitor confirms them by probing.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// `Ok(())` when the remote service answered.
    async fn check(&self) -> Result<()>;
}

/// Registration handle returned by [`ConnectivityMonitor::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type ObserverList = Vec<(ObserverId, Arc<dyn ConnectivityObserver>)>;

/// Tracks whether the remote service is reachable.
pub struct ConnectivityMonitor {
    online: AtomicBool,
    next_id: AtomicU64,
    observers: RwLock<ObserverList>,
}

impl ConnectivityMonitor {
    /// Create a monitor with the host's current network state.
    pub fn new(initially_online: bool) -> Self {
        Self {
            online: AtomicBool::new(initially_online),
            next_id: AtomicU64::new(0),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Register a subscriber. Subscribers are notified in registration order.
    pub fn subscribe(&self, observer: Arc<dyn ConnectivityObserver>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers_mut().push((id, observer));
        id
    }

    /// Register a closure as a subscriber.
    pub fn on_change<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.subscribe(Arc::new(callback))
    }

    /// Remove a subscriber. Returns whether it was registered.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut observers = self.observers_mut();
        let before = observers.len();
        observers.retain(|(registered, _)| *registered != id);
        observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        match self.observers.read() {
            Ok(observers) => observers.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    fn observers_mut(&self) -> std::sync::RwLockWriteGuard<'_, ObserverList> {
        match self.observers.write() {
            Ok(observers) => observers,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Host reported the network came up.
    pub fn network_up(&self) -> bool {
        self.set_online(true)
    }

    /// Host reported the network went down.
    pub fn network_down(&self) -> bool {
        self.set_online(false)
    }

    /// Apply a state report. Returns whether it caused a transition.
    ///
    /// Reports matching the current state are no-ops.
    pub fn set_online(&self, online: bool) -> bool {
        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous == online {
            return false;
        }

        info!("Status: {}", if online { "ONLINE" } else { "OFFLINE" });
        self.notify(online);
        true
    }

    /// Run one reachability probe and apply its outcome.
    pub async fn probe<P>(&self, probe: &P) -> bool
    where
        P: ReachabilityProbe + ?Sized,
    {
        match probe.check().await {
            Ok(()) => {
                self.set_online(true);
                true
            }
            Err(e) => {
                debug!("Reachability probe failed: {}", e);
                self.set_online(false);
                false
            }
        }
    }

    fn notify(&self, online: bool) {
        // Snapshot so observers may subscribe others without deadlocking.
        let observers = match self.observers.read() {
            Ok(observers) => observers.clone(),
            Err(poisoned) => {
                warn!("Observer list poisoned; continuing with last state");
                poisoned.into_inner().clone()
            }
        };

        for (_, observer) in observers {
            observer.on_connectivity_change(online);
        }
    }
}
