//! Error types for trackline-store.

use std::path::PathBuf;

/// Result type for trackline-store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in trackline-store.
///
/// Every variant is a local persistence fault: the operation that raised it
/// did not take effect and the queue remains in its last committed state.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Database error from SQLite.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Failed to create database directory.
    #[error("Failed to create database directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Timestamp cannot be represented in the queue.
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// A persisted row no longer forms a valid sample.
    #[error("Invalid sample in row {id}: {source}")]
    InvalidSample {
        id: i64,
        source: trackline_types::SampleError,
    },
}
