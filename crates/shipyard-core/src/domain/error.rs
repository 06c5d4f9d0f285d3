//! Domain-level error taxonomy for Shipyard.

use shipyard_state::StorageError;

/// Shipyard domain errors.
#[derive(Debug, thiserror::Error)]
pub enum ShipyardError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("duplicate {kind} name: {name}")]
    DuplicateName { kind: &'static str, name: String },

    #[error("invalid resource path: {path:?}")]
    InvalidResourcePath { path: String },

    #[error("invalid source revision: {revision:?}")]
    InvalidRevision { revision: String },

    #[error("invalid suppression: {0}")]
    InvalidSuppression(String),

    #[error("command {name} failed to run: {reason}")]
    Command { name: String, reason: String },

    #[error("git error: {0}")]
    Git(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("deployment error: {0}")]
    Deployment(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for ShipyardError {
    fn from(err: reqwest::Error) -> Self {
        ShipyardError::Http(err.to_string())
    }
}

/// Result type for Shipyard domain operations.
pub type Result<T> = std::result::Result<T, ShipyardError>;
