//! Registry vulnerability scan of a pushed image.
//!
//! Findings are attributed to the service's repository resource and go
//! through the compliance gate at the configured scan threshold.

use async_trait::async_trait;
use shipyard_core::graph::repository_path;
use shipyard_core::obs;
use shipyard_core::registry_binding::{self, VerificationKind};
use shipyard_core::{PolicyFinding, ServiceDescriptor, StepId, StepKind};
use shipyard_state::{ImageReference, StorageError};
use tracing::warn;

use super::current_tag;
use crate::error::Result;
use crate::gate::ComplianceGate;
use crate::step::{ExecutionContext, FailureKind, Step, StepOutcome};

pub struct RegistryScanStep {
    id: StepId,
    service: ServiceDescriptor,
}

impl RegistryScanStep {
    pub fn new(service: ServiceDescriptor) -> Self {
        Self {
            id: service.step_ids().registry_scan,
            service,
        }
    }
}

#[async_trait]
impl Step for RegistryScanStep {
    fn id(&self) -> &StepId {
        &self.id
    }

    fn kind(&self) -> StepKind {
        StepKind::RegistryScan
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<StepOutcome> {
        let tag = match current_tag(ctx, &self.service.name).await? {
            Ok(tag) => tag,
            Err(missing) => return Ok(missing),
        };
        let reference = ImageReference::new(&self.service.registry_identity, &tag);

        let findings = match ctx.registry.scan(&reference).await {
            Ok(findings) => findings,
            Err(StorageError::ImageNotFound { reference }) => {
                return Ok(StepOutcome::failed(
                    FailureKind::ArtifactMissing,
                    format!("image {reference} not found in registry"),
                ))
            }
            Err(err) => {
                return Ok(StepOutcome::failed(
                    FailureKind::Infrastructure,
                    format!("scan of {reference} failed: {err}"),
                ))
            }
        };

        let resource = repository_path(&self.service.name)?;
        let findings: Vec<PolicyFinding> = findings
            .into_iter()
            .map(|f| PolicyFinding {
                resource_path: resource.clone(),
                rule_id: f.rule_id,
                severity: f.severity,
                message: f.description,
            })
            .collect();
        let total = findings.len();
        let verdict = ComplianceGate::evaluate(
            &ctx.ledger,
            findings,
            ctx.config.policy.scan_threshold,
        );
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
        if !verdict.passed {
            return Ok(StepOutcome::failed(FailureKind::ScanFailure, verdict.message));
        }

        registry_binding::record_verification(
            ctx.store.as_ref(),
            &self.service.name,
            VerificationKind::RegistryScan,
            &tag,
        )
        .await?;
        Ok(StepOutcome::passed(format!("{reference}: {}", verdict.message)))
    }
}
