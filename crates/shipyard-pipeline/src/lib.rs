//! Shipyard Pipeline - wave-based delivery orchestration
//!
//! Provides a pipeline orchestrator that:
//! - Runs waves strictly in order, dispatching each wave's members together
//! - Builds, scans and tests service images, handing artifacts to later
//!   waves through the persisted store
//! - Gates findings against the compliance exception ledger
//! - Deploys environment stages behind the runtime safety net
//! - Records every run in the run ledger

pub mod definition;
pub mod error;
pub mod gate;
pub mod pipeline;
pub mod report;
pub mod runner;
pub mod spec;
pub mod stage;
pub mod step;
pub mod steps;

// Re-export key types
pub use definition::{standard_pipeline, verification_pipeline};
pub use error::{PipelineError, Result};
pub use gate::{ComplianceGate, GateVerdict};
pub use pipeline::{Pipeline, Wave, WaveMember};
pub use report::{MemberReport, PipelineReport, Status, WaveReport};
pub use runner::PipelineRunner;
pub use spec::PipelineSpec;
pub use stage::{Stage, StageKind, StageOutcome};
pub use step::{ExecutionContext, FailureKind, Step, StepOutcome};
pub use steps::{
    ApprovalDecision, ApprovalSource, ApprovalStep, ApprovalVerdict, BuildStep, ChannelApproval,
    CodeScanStep, FunctionalTestStep, PolicyCheckStep, RegistryScanStep, StoreApproval,
};
