//! Shipyard core library
//!
//! Domain model, configuration, compliance ledger, resource graph and the
//! runtime safety net shared by the pipeline and the CLI.

pub mod annotations;
pub mod command;
pub mod compliance;
pub mod config;
pub mod domain;
pub mod git;
pub mod graph;
pub mod infra;
pub mod obs;
pub mod policy;
pub mod registry_binding;
pub mod registry_client;
pub mod safety_net;
pub mod telemetry;

pub use annotations::{annotation_line, parse_annotations, Annotation, AnnotationLevel};
pub use command::{CommandOutput, CommandRunner, CommandSpec};
pub use compliance::{ComplianceLedger, PolicyFinding, SuppressionRecord};
pub use config::{
    EnvironmentConfig, PipelineSettings, PolicyConfig, RunMode, ServiceConfig, ShipyardConfig,
    StateSettings,
};
pub use domain::{
    approval_step_id, ArtifactReference, ResourcePath, Result, ServiceDescriptor,
    ServiceStepIds, ShipyardError, StepId, StepKind, POLICY_CHECK_STEP,
};
pub use git::capture_head_revision;
pub use graph::{ResourceDecl, ResourceGraph};
pub use infra::{DeploymentReport, Infrastructure, RuntimeInfrastructure, ServiceDeployment};
pub use registry_binding::VerificationKind;
pub use registry_client::{CommandImageRegistry, RegistrySettings};
pub use safety_net::{
    DeploymentCircuitBreaker, RolloutOutcome, RuleChain, SafetyNetConfig, WebRequest,
};
pub use telemetry::init_tracing;
