//! Static code scan of a service's sources.

use async_trait::async_trait;
use shipyard_core::registry_binding::{self, VerificationKind};
use shipyard_core::{RunMode, ServiceDescriptor, StepId, StepKind};

use super::{current_tag, run_checked, service_command};
use crate::error::Result;
use crate::step::{ExecutionContext, FailureKind, Step, StepOutcome};

pub struct CodeScanStep {
    id: StepId,
    service: ServiceDescriptor,
    argv: Vec<String>,
}

impl CodeScanStep {
    pub fn new(service: ServiceDescriptor, argv: Vec<String>) -> Self {
        Self {
            id: service.step_ids().code_scan,
            service,
            argv,
        }
    }
}

#[async_trait]
impl Step for CodeScanStep {
    fn id(&self) -> &StepId {
        &self.id
    }

    fn kind(&self) -> StepKind {
        StepKind::CodeScan
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<StepOutcome> {
        let tag = match current_tag(ctx, &self.service.name).await? {
            Ok(tag) => tag,
            Err(missing) => return Ok(missing),
        };

        // the scanner always runs with security-test settings
        let spec = service_command(ctx, &self.id, &self.service, &self.argv)
            .env("IMAGE_TAG", &tag)
            .env("SHIPYARD_MODE", RunMode::SecurityTest.as_str());
        if let Err(failed) = run_checked(&spec, FailureKind::ScanFailure).await {
            return Ok(failed);
        }

        registry_binding::record_verification(
            ctx.store.as_ref(),
            &self.service.name,
            VerificationKind::CodeScan,
            &tag,
        )
        .await?;
        Ok(StepOutcome::passed(format!("code scan clean for {tag}")))
    }
}
