//! Process-wide lifecycle events for external subscribers (e.g. UI refresh).

use tokio::sync::broadcast;
use tracing::trace;

use crate::engine::SyncReport;

/// Lifecycle event.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// The connectivity monitor transitioned.
    ConnectivityChanged(bool),
    /// A sync pass finished, successfully or with per-operation failures.
    SyncCompleted(SyncReport),
}

/// Fan-out channel for lifecycle events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per lagging subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: SyncEvent) {
        if self.tx.send(event).is_err() {
            trace!("No event subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_sees_events() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(SyncEvent::ConnectivityChanged(false));

        assert!(matches!(a.recv().await.unwrap(), SyncEvent::ConnectivityChanged(false)));
        assert!(matches!(b.recv().await.unwrap(), SyncEvent::ConnectivityChanged(false)));
    }

    #[test]
    fn test_emit_without_subscribers() {
        EventBus::new(0).emit(SyncEvent::ConnectivityChanged(true));
    }
}
