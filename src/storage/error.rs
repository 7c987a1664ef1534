//! Storage error types
//!
//! Defines all errors that can occur in the persistence layer.

use thiserror::Error;

/// Errors that can occur in the storage layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// SQLite rejected or failed the statement
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization/deserialization of a JSON column failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Another writer inserted the same rule for this user first
    #[error("Pattern {rule_hash} already exists for user {user_id}")]
    PersistenceConflict { user_id: String, rule_hash: String },

    /// Requested row does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Lock acquisition failed
    #[error("Lock error: {0}")]
    Lock(String),

    /// The blocking database task panicked or was cancelled
    #[error("Database task failed: {0}")]
    Task(String),
}

impl StorageError {
    /// Whether repeating the operation may succeed
    ///
    /// Busy/locked databases and I/O hiccups are transient; schema,
    /// serialization and lookup failures are not.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            StorageError::PersistenceConflict { .. } => true,
            StorageError::Io(_) => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
