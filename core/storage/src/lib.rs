//! Durable local store for offline operation.
//!
//! This crate provides a trait-based interface over the local persistence
//! layer (entity tables, the pending-operation queue, a failure ledger and a
//! metadata table) with two backends:
//! - `SqliteStore`: durable, file-backed, transactional
//! - `MemoryStore`: ephemeral, for tests and previews
//!
//! # Design Principles
//! - Full-record upserts: last write wins, no partial merge
//! - The queue is append-only; entries only ever flip to synced
//! - Errors from the underlying engine surface as `Error::Storage`

pub mod memory;
pub mod sqlite;
pub mod store;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::{EntityStoreExt, FailureRecord, LocalStore, MetadataEntry, PendingOperation};
