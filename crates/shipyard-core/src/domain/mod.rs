//! Core domain types.

pub mod error;
pub mod resource_path;
pub mod service;

pub use error::{Result, ShipyardError};
pub use resource_path::ResourcePath;
pub use service::{
    approval_step_id, tag_for_revision, ArtifactReference, ServiceDescriptor, ServiceStepIds,
    StepId, StepKind, IMAGE_TAG_LEN, POLICY_CHECK_STEP,
};
