//! Functional test suite of a service.

use async_trait::async_trait;
use shipyard_core::registry_binding::{self, VerificationKind};
use shipyard_core::{ServiceDescriptor, StepId, StepKind};

use super::{current_tag, run_checked, service_command};
use crate::error::Result;
use crate::step::{ExecutionContext, FailureKind, Step, StepOutcome};

pub struct FunctionalTestStep {
    id: StepId,
    service: ServiceDescriptor,
    argv: Vec<String>,
}

impl FunctionalTestStep {
    pub fn new(service: ServiceDescriptor, argv: Vec<String>) -> Self {
        Self {
            id: service.step_ids().test,
            service,
            argv,
        }
    }
}

#[async_trait]
impl Step for FunctionalTestStep {
    fn id(&self) -> &StepId {
        &self.id
    }

    fn kind(&self) -> StepKind {
        StepKind::FunctionalTest
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<StepOutcome> {
        let tag = match current_tag(ctx, &self.service.name).await? {
            Ok(tag) => tag,
            Err(missing) => return Ok(missing),
        };

        let spec = service_command(ctx, &self.id, &self.service, &self.argv)
            .env("IMAGE_TAG", &tag)
            .env("SHIPYARD_MODE", ctx.mode.as_str());
        let output = match run_checked(&spec, FailureKind::TestFailure).await {
            Ok(output) => output,
            Err(failed) => return Ok(failed),
        };

        registry_binding::record_verification(
            ctx.store.as_ref(),
            &self.service.name,
            VerificationKind::FunctionalTest,
            &tag,
        )
        .await?;
        Ok(StepOutcome::passed(format!(
            "tests passed for {tag} in {}ms",
            output.duration_ms
        )))
    }
}
