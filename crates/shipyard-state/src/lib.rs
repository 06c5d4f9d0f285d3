//! Shipyard-State: persistence layer for delivery pipelines
//!
//! This crate owns every piece of state that outlives a single pipeline
//! member: the persisted key-value store through which waves hand artifacts
//! to later waves, the container registry contract, and the run ledger.
//!
//! ## Key Components
//!
//! - `ParameterStore`: last-write-wins store keyed by `{namespace}/{scope}/{attribute}`
//! - `ImageRegistry`: repository creation, image push and vulnerability scan
//! - `RunLedger`: ordered per-run event log with terminal status
//! - `SurrealHandle`: SurrealDB connection backing the persistent implementations

mod error;
pub mod fakes;
mod handle;
pub mod storage_traits;
pub mod surreal_store;

pub use error::StorageError;
pub use handle::{is_in_memory, CloudConfig, SurrealHandle};
pub use storage_traits::{
    ContentDigest, Finding, ImageReference, ImageRegistry, ParameterKey, ParameterStore,
    RunEvent, RunId, RunLedger, RunMetadata, RunRecord, RunStatus, RunSummary, Severity,
    StorageResult,
};
pub use surreal_store::{SurrealParameterStore, SurrealRunLedger};
