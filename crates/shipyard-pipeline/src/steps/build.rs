//! Build step: build a service image, push it, publish its tag.

use async_trait::async_trait;
use shipyard_core::registry_binding;
use shipyard_core::{ArtifactReference, ServiceDescriptor, StepId, StepKind};
use tracing::info;

use super::{run_checked, service_command};
use crate::error::Result;
use crate::step::{ExecutionContext, FailureKind, Step, StepOutcome};

pub struct BuildStep {
    id: StepId,
    service: ServiceDescriptor,
    argv: Vec<String>,
}

impl BuildStep {
    /// `argv` builds the image named by `$LOCAL_IMAGE`.
    pub fn new(service: ServiceDescriptor, argv: Vec<String>) -> Self {
        Self {
            id: service.step_ids().build,
            service,
            argv,
        }
    }

    /// `Some(tag)` when the current revision is already built and published
    /// under the tag derived from it.
    async fn unchanged_tag(&self, ctx: &ExecutionContext) -> Result<Option<String>> {
        let store = ctx.store.as_ref();
        let last = registry_binding::last_built_revision(store, &self.service.name).await?;
        if last.as_deref() != Some(ctx.source_revision.as_str()) {
            return Ok(None);
        }
        let Ok(expected) = ArtifactReference::for_revision(&self.service.name, &ctx.source_revision)
        else {
            return Ok(None);
        };
        Ok(registry_binding::image_tag(store, &self.service.name)
            .await?
            .filter(|tag| *tag == expected.image_tag))
    }
}

#[async_trait]
impl Step for BuildStep {
    fn id(&self) -> &StepId {
        &self.id
    }

    fn kind(&self) -> StepKind {
        StepKind::Build
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<StepOutcome> {
        if let Some(tag) = self.unchanged_tag(ctx).await? {
            info!(service = %self.service.name, tag = %tag, "revision already built");
            return Ok(StepOutcome::passed(format!("unchanged: {tag}")));
        }

        let artifact = ArtifactReference::for_revision(&self.service.name, &ctx.source_revision)?;
        let local_image = format!("{}:{}", self.service.name, artifact.image_tag);
        let spec = service_command(ctx, &self.id, &self.service, &self.argv)
            .env("IMAGE_TAG", &artifact.image_tag)
            .env("LOCAL_IMAGE", &local_image);
        if let Err(failed) = run_checked(&spec, FailureKind::BuildFailure).await {
            return Ok(failed);
        }

        let reference = match ctx
            .registry
            .push(&self.service.registry_identity, &local_image, &artifact.image_tag)
            .await
        {
            Ok(reference) => reference,
            Err(err) => {
                return Ok(StepOutcome::failed(
                    FailureKind::BuildFailure,
                    format!("push failed: {err}"),
                ))
            }
        };

        registry_binding::record_artifact(ctx.store.as_ref(), &artifact).await?;
        info!(service = %self.service.name, image = %reference, "artifact published");
        Ok(StepOutcome::passed(format!("built {reference}")))
    }
}
