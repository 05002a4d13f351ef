//! Core error types.

use std::time::Duration;

use thiserror::Error;

/// Core database errors.
#[derive(Debug, Error)]
pub enum Error {
    /// SQLite error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The pool was closed and no longer hands out connections.
    #[error("connection pool for {path} is closed")]
    PoolClosed {
        /// Database file the pool belonged to.
        path: String,
    },

    /// No connection became available in time.
    #[error("timed out after {timeout:?} waiting for a connection")]
    AcquireTimeout {
        /// How long the caller waited.
        timeout: Duration,
    },

    /// A statement ran past the per-statement timeout and was interrupted.
    #[error("statement timed out after {timeout:?}")]
    StatementTimeout {
        /// Configured statement timeout.
        timeout: Duration,
    },

    /// A blocking database task panicked or was cancelled.
    #[error("database task failed: {0}")]
    Task(String),

    /// Invalid data format.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

/// Convenience result alias for core operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
