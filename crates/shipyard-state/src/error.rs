//! Error types for shipyard-state

use thiserror::Error;

/// Errors raised by storage backends and their in-memory counterparts.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Database connection error
    #[error("connection failed: {0}")]
    Connection(String),

    /// Backend query or command error
    #[error("backend error: {0}")]
    Backend(String),

    /// Parameter key does not have the `{namespace}/{scope}/{attribute}` shape
    #[error("invalid parameter key: {key}")]
    InvalidKey { key: String },

    /// Content digest is not 64 hex characters
    #[error("invalid digest: {digest}")]
    InvalidDigest { digest: String },

    /// Repository was never created in the registry
    #[error("repository not found: {name}")]
    RepositoryNotFound { name: String },

    /// Image reference is unknown to the registry
    #[error("image not found: {reference}")]
    ImageNotFound { reference: String },

    /// Registry refused an operation
    #[error("registry error: {0}")]
    Registry(String),

    /// Run does not exist in the ledger
    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// Run is not in the state required by the operation
    #[error("run {run_id} is {status}, expected {expected}")]
    InvalidRunState {
        run_id: String,
        status: String,
        expected: String,
    },

    /// Serialization error
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
