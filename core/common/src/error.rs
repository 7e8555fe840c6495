//! Common error types for the offline modules.

use thiserror::Error;

/// Top-level error type for offline store and sync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Durable store failure (disk I/O, quota, corrupt database).
    #[error("Storage error: {0}")]
    Storage(String),

    /// Queue or entity lookup miss.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Remote call failed or timed out.
    #[error("Network error: {0}")]
    Network(String),

    /// Remote service answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Queue entry carries an operation kind outside the known set.
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Invalid or unreadable configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Background scheduler is not running.
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the failure came from talking to the remote service.
    pub fn is_network(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Http { .. })
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
