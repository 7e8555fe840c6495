//! Common utilities and types shared across the MetaPM offline modules.
//!
//! This crate provides the error taxonomy, the entity and operation kinds
//! that the local store and the sync engine agree on, and typed views of the
//! domain records.

pub mod entity;
pub mod error;
pub mod types;

pub use entity::{Bug, Entity, Project, Requirement, Task};
pub use error::{Error, Result};
pub use types::{Action, EntityKind, OperationKind};
