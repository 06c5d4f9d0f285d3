//! Policy check over the synthesized resource graph.

use async_trait::async_trait;
use shipyard_core::graph::ResourceGraph;
use shipyard_core::{obs, policy, StepId, StepKind, POLICY_CHECK_STEP};
use tracing::{info, warn};

use crate::error::Result;
use crate::gate::ComplianceGate;
use crate::step::{ExecutionContext, FailureKind, Step, StepOutcome};

pub struct PolicyCheckStep {
    id: StepId,
}

impl PolicyCheckStep {
    pub fn new() -> Self {
        Self {
            id: StepId::new(POLICY_CHECK_STEP),
        }
    }
}

impl Default for PolicyCheckStep {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Step for PolicyCheckStep {
    fn id(&self) -> &StepId {
        &self.id
    }

    fn kind(&self) -> StepKind {
        StepKind::PolicyCheck
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<StepOutcome> {
        if !ctx.mode.policy_checks_enabled() {
            info!(mode = %ctx.mode, "policy checks disabled");
            return Ok(StepOutcome::passed(format!(
                "skipped: policy checks disabled in {} mode",
                ctx.mode
            )));
        }

        let graph = ResourceGraph::synthesize(&ctx.config)?;
        let findings = policy::evaluate(&graph);
        let total = findings.len();
        let verdict =
            ComplianceGate::evaluate(&ctx.ledger, findings, ctx.config.policy.policy_threshold);
        obs::emit_policy_evaluated(
            self.id.as_str(),
            total,
            verdict.acknowledged.len(),
            verdict.violations.len(),
            verdict.passed,
        );
        for line in verdict.annotations() {
            warn!(step = %self.id, "{line}");
        }

        if verdict.passed {
            Ok(StepOutcome::passed(verdict.message))
        } else {
            Ok(StepOutcome::failed(FailureKind::PolicyFailure, verdict.message))
        }
    }
}
