//! MetaPM offline sync engine
//!
//! This crate drains locally queued mutations to the MetaPM API, including:
//! - Connectivity monitoring with observer notification
//! - Single-flight sync passes with per-operation failure isolation
//! - Snapshot pulls that hydrate the local store
//! - A background scheduler for reconnect and periodic probing

pub mod connectivity;
pub mod engine;
pub mod events;
pub mod scheduler;
pub mod state;
pub mod transport;

// Re-export main types
pub use connectivity::{ConnectivityMonitor, ConnectivityObserver, ObserverId, ReachabilityProbe};
pub use engine::{SyncConfig, SyncEngine, SyncReport, LAST_PULL_KEY, LAST_SYNC_KEY};
pub use events::{EventBus, SyncEvent};
pub use scheduler::{SyncRequest, SyncScheduler, SyncSchedulerHandle};
pub use state::{StuckOperation, SyncStatus};
pub use transport::{unwrap_collection, ApiMethod, ApiRequest, HttpTransport, RemoteTransport};
