//! Common error types for tripsync.

use thiserror::Error;

/// Top-level error type for tripsync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Local cache operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The cache backend connection is gone and must be reopened.
    #[error("Storage connection closed: {0}")]
    ConnectionClosed(String),

    /// Network transport failed before a response was received.
    #[error("Network error: {0}")]
    Network(String),

    /// The remote API answered with a non-success status.
    #[error("Remote error ({status}): {message}")]
    Remote { status: u16, message: String },

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration could not be loaded or is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A synchronization pass is already running.
    #[error("Sync already in progress")]
    SyncInProgress,

    /// A reconciliation of pending writes is already running.
    #[error("Reconciliation already in progress")]
    ReconcileInProgress,

    /// The background scheduler is not running.
    #[error("Scheduler not running")]
    SchedulerStopped,
}

impl Error {
    /// Whether the failure is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Network(_) | Error::Io(_) => true,
            Error::Remote { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Whether the error means the cache connection has been invalidated.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Error::ConnectionClosed(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
