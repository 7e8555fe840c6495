//! MetaPM offline client
//!
//! Glue over the store, sync and cache crates: configuration loading and a
//! single [`OfflineClient`] handle for application code.

pub mod client;
pub mod config;

pub use client::{resource_fetcher, ClientEngine, OfflineClient};
pub use config::{ClientConfig, DEFAULT_BASE_URL, DEFAULT_DATABASE_PATH};

pub use metapm_common::{Bug, Entity, EntityKind, Error, OperationKind, Project, Requirement, Result, Task};
pub use metapm_sync::{SyncConfig, SyncEvent, SyncReport, SyncStatus};
