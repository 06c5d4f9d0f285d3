//! Concrete pipeline steps.

pub mod approval;
pub mod build;
pub mod code_scan;
pub mod functional_test;
pub mod policy_check;
pub mod registry_scan;

pub use approval::{
    ApprovalDecision, ApprovalSource, ApprovalStep, ApprovalVerdict, ChannelApproval,
    StoreApproval,
};
pub use build::BuildStep;
pub use code_scan::CodeScanStep;
pub use functional_test::FunctionalTestStep;
pub use policy_check::PolicyCheckStep;
pub use registry_scan::RegistryScanStep;

use shipyard_core::registry_binding;
use shipyard_core::{CommandOutput, CommandRunner, CommandSpec, ServiceDescriptor, StepId};

use crate::error::Result;
use crate::step::{ExecutionContext, FailureKind, StepOutcome};

/// Command for `step` with the service layout in its environment:
/// `SERVICE_NAME`, `CONTAINER_NAME`, `CONTAINER_PATH`, `CONTEXT_PATH`,
/// `DOCKERFILE_PATH` and `SOURCE_REVISION`.
pub(crate) fn service_command(
    ctx: &ExecutionContext,
    step: &StepId,
    service: &ServiceDescriptor,
    argv: &[String],
) -> CommandSpec {
    CommandSpec::new(step.as_str(), argv.to_vec())
        .env("SERVICE_NAME", &service.name)
        .env("CONTAINER_NAME", &service.name)
        .env("CONTAINER_PATH", service.source_path.to_string_lossy())
        .env("CONTEXT_PATH", service.build_context_path.to_string_lossy())
        .env("DOCKERFILE_PATH", service.dockerfile_path.to_string_lossy())
        .env("SOURCE_REVISION", &ctx.source_revision)
        .timeout_secs(ctx.config.pipeline.step_timeout_secs)
}

/// Run `spec`; a command that fails, times out or cannot start becomes a
/// `kind` failure.
pub(crate) async fn run_checked(
    spec: &CommandSpec,
    kind: FailureKind,
) -> std::result::Result<CommandOutput, StepOutcome> {
    match CommandRunner::execute(spec).await {
        Ok(output) if output.passed() => Ok(output),
        Ok(output) if output.timed_out => Err(StepOutcome::failed(
            kind,
            format!("{} timed out after {}s", spec.name, spec.timeout_secs),
        )),
        Ok(output) => Err(StepOutcome::failed(
            kind,
            format!(
                "{} exited with {}: {}",
                spec.name,
                output.exit_code,
                output.stderr_tail()
            ),
        )),
        Err(err) => Err(StepOutcome::failed(kind, err.to_string())),
    }
}

/// Current image tag of `service`, or the failure to report when the build
/// has not published one.
pub(crate) async fn current_tag(
    ctx: &ExecutionContext,
    service: &str,
) -> Result<std::result::Result<String, StepOutcome>> {
    Ok(
        match registry_binding::image_tag(ctx.store.as_ref(), service).await? {
            Some(tag) if !tag.is_empty() => Ok(tag),
            _ => Err(StepOutcome::failed(
                FailureKind::ArtifactMissing,
                format!("no image tag recorded for {service}"),
            )),
        },
    )
}
