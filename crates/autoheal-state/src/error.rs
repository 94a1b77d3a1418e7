//! Error types for autoheal-state

use thiserror::Error;

/// Errors that can occur in the persistence layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// Filesystem I/O failed
    #[error("storage io failed: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// A persisted record could not be decoded
    #[error("deserialization failed in {path}: {detail}")]
    Deserialization { path: String, detail: String },

    /// Atomic replace of a ledger file failed
    #[error("atomic persist failed for {path}: {detail}")]
    Persist { path: String, detail: String },
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
