//! Pipeline error types.
//!
//! A step that runs and fails returns `Ok(StepOutcome::Failed { .. })`.
//! `PipelineError` is for the cases where the orchestration itself cannot
//! proceed: storage, wiring or an invalid pipeline definition.

use shipyard_core::ShipyardError;
use shipyard_state::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("duplicate {kind} '{name}'")]
    Duplicate { kind: &'static str, name: String },

    #[error("wave '{0}' has no members")]
    EmptyWave(String),

    #[error("unknown approval decision: {0}")]
    InvalidApproval(String),

    #[error(transparent)]
    Core(#[from] ShipyardError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
