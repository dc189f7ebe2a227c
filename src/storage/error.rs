//! Error type shared by the pool, batch and engine layers.

use std::time::Duration;
use thiserror::Error;

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error type for storage operations.
///
/// Not-found lookups are not errors; they surface as `Option::None`.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No connection became available before the acquisition timeout.
    #[error("Connection pool exhausted: no connection available within {timeout:?}")]
    PoolExhausted { timeout: Duration },

    /// The pool has been shut down and accepts no further acquisitions.
    #[error("Connection pool is shut down")]
    PoolClosed,

    /// The physical handle behind a pooled connection was already closed.
    #[error("Connection {id} is closed")]
    ConnectionClosed { id: u64 },

    /// The database rejected a statement.
    #[error("Database error: {0}")]
    Statement(#[from] rusqlite::Error),

    /// A cleanup or optimize pass failed part-way through.
    #[error("{operation} failed during {phase} (completed: {completed:?}): {source}")]
    Maintenance {
        operation: &'static str,
        phase: &'static str,
        completed: Vec<(&'static str, u64)>,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    /// Whether the caller should back off and retry.
    ///
    /// Only pool exhaustion is a backpressure signal; statement errors are
    /// surfaced as-is and never retried.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. })
    }
}
