//! The step contract and the context every wave member executes in.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shipyard_core::{ComplianceLedger, Infrastructure, RunMode, ShipyardConfig, StepId, StepKind};
use shipyard_state::{ImageRegistry, ParameterStore};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::steps::approval::ApprovalSource;

/// Why a wave member failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    BuildFailure,
    ScanFailure,
    TestFailure,
    PolicyFailure,
    ApprovalRejected,
    ApprovalExpired,
    ArtifactMissing,
    DeploymentFailure,
    Infrastructure,
    /// The run was cancelled before the member decided.
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::BuildFailure => "build_failure",
            FailureKind::ScanFailure => "scan_failure",
            FailureKind::TestFailure => "test_failure",
            FailureKind::PolicyFailure => "policy_failure",
            FailureKind::ApprovalRejected => "approval_rejected",
            FailureKind::ApprovalExpired => "approval_expired",
            FailureKind::ArtifactMissing => "artifact_missing",
            FailureKind::DeploymentFailure => "deployment_failure",
            FailureKind::Infrastructure => "infrastructure",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal result of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Passed { detail: String },
    Failed { kind: FailureKind, detail: String },
}

impl StepOutcome {
    pub fn passed(detail: impl Into<String>) -> Self {
        StepOutcome::Passed {
            detail: detail.into(),
        }
    }

    pub fn failed(kind: FailureKind, detail: impl Into<String>) -> Self {
        StepOutcome::Failed {
            kind,
            detail: detail.into(),
        }
    }

    pub fn is_passed(&self) -> bool {
        matches!(self, StepOutcome::Passed { .. })
    }

    pub fn detail(&self) -> &str {
        match self {
            StepOutcome::Passed { detail } | StepOutcome::Failed { detail, .. } => detail,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            StepOutcome::Passed { .. } => None,
            StepOutcome::Failed { kind, .. } => Some(*kind),
        }
    }
}

/// Everything a wave member may touch. Shared read-only across the members
/// of a run; the persisted store is the only mutable state they share.
#[derive(Clone)]
pub struct ExecutionContext {
    pub config: Arc<ShipyardConfig>,
    pub ledger: Arc<ComplianceLedger>,
    pub store: Arc<dyn ParameterStore>,
    pub registry: Arc<dyn ImageRegistry>,
    pub infrastructure: Arc<dyn Infrastructure>,
    pub approvals: Arc<dyn ApprovalSource>,
    pub source_revision: String,
    pub mode: RunMode,
    /// Set by the runner once the run is recorded.
    pub run_id: String,
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(
        config: Arc<ShipyardConfig>,
        store: Arc<dyn ParameterStore>,
        registry: Arc<dyn ImageRegistry>,
        infrastructure: Arc<dyn Infrastructure>,
        approvals: Arc<dyn ApprovalSource>,
        source_revision: impl Into<String>,
    ) -> Result<Self> {
        let ledger = Arc::new(config.compliance_ledger()?);
        let mode = config.runtime.mode;
        Ok(Self {
            config,
            ledger,
            store,
            registry,
            infrastructure,
            approvals,
            source_revision: source_revision.into(),
            mode,
            run_id: String::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn pipeline_name(&self) -> &str {
        &self.config.pipeline.name
    }
}

/// One unit of work inside a wave.
#[async_trait]
pub trait Step: Send + Sync {
    fn id(&self) -> &StepId;

    fn kind(&self) -> StepKind;

    /// Run to a terminal outcome. `Err` means the step could not be carried
    /// out at all; the runner reports it as an infrastructure failure.
    async fn execute(&self, ctx: &ExecutionContext) -> Result<StepOutcome>;
}
