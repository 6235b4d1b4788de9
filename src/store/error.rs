// ABOUTME: Error types for run-state persistence
// ABOUTME: Any write failure surfaces to the executor, which pauses the run

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to write {path}: {message}")]
    WriteError { path: String, message: String },

    #[error("Failed to read {path}: {message}")]
    ReadError { path: String, message: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store rejected write of {id}")]
    WriteRejected { id: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;
