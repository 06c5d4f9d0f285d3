//! Stages: one environment's deployable unit, or the registry stage that
//! creates image repositories ahead of the first build.

use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use shipyard_core::graph::REGISTRY_STAGE;
use shipyard_core::registry_binding::{self, VerificationKind};
use shipyard_core::{
    DeploymentReport, EnvironmentConfig, RolloutOutcome, RuleChain, SafetyNetConfig,
    ServiceDeployment, ServiceDescriptor,
};
use tracing::{info, warn};

use crate::error::Result;
use crate::step::{ExecutionContext, FailureKind, StepOutcome};

#[derive(Debug, Clone)]
pub enum StageKind {
    Registry,
    Environment {
        environment: EnvironmentConfig,
        safety_net: SafetyNetConfig,
    },
}

#[derive(Debug, Clone)]
pub struct Stage {
    name: String,
    services: Vec<ServiceDescriptor>,
    kind: StageKind,
}

/// Terminal result of a stage or step, as the wave runner sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub outcome: StepOutcome,
    /// A rollout was rolled back; the previous release keeps serving.
    pub rolled_back: bool,
    pub deployments: Vec<DeploymentReport>,
}

impl From<StepOutcome> for StageOutcome {
    fn from(outcome: StepOutcome) -> Self {
        Self {
            outcome,
            rolled_back: false,
            deployments: Vec::new(),
        }
    }
}

impl Stage {
    pub fn registry(services: Vec<ServiceDescriptor>) -> Self {
        Self {
            name: REGISTRY_STAGE.to_string(),
            services,
            kind: StageKind::Registry,
        }
    }

    /// Stage for `environment`; its safety net is fixed here.
    pub fn environment(
        environment: &EnvironmentConfig,
        services: Vec<ServiceDescriptor>,
        base: &SafetyNetConfig,
    ) -> Self {
        Self {
            name: environment.stage_name(),
            services,
            kind: StageKind::Environment {
                safety_net: environment.safety_net(base),
                environment: environment.clone(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &StageKind {
        &self.kind
    }

    pub fn safety_net(&self) -> Option<&SafetyNetConfig> {
        match &self.kind {
            StageKind::Registry => None,
            StageKind::Environment { safety_net, .. } => Some(safety_net),
        }
    }

    pub async fn execute(&self, ctx: &ExecutionContext) -> Result<StageOutcome> {
        match &self.kind {
            StageKind::Registry => self.create_repositories(ctx).await,
            StageKind::Environment {
                environment,
                safety_net,
            } => self.deploy(ctx, environment, safety_net).await,
        }
    }

    async fn create_repositories(&self, ctx: &ExecutionContext) -> Result<StageOutcome> {
        let mut created = Vec::with_capacity(self.services.len());
        for service in &self.services {
            let uri = match ctx
                .infrastructure
                .create_repository(&service.registry_identity)
                .await
            {
                Ok(uri) => uri,
                Err(err) => {
                    return Ok(StepOutcome::failed(
                        FailureKind::Infrastructure,
                        format!("repository {}: {err}", service.registry_identity),
                    )
                    .into())
                }
            };
            registry_binding::record_repository_uri(ctx.store.as_ref(), &service.name, &uri)
                .await?;
            info!(service = %service.name, uri = %uri, "repository ready");
            created.push(uri);
        }
        Ok(StepOutcome::passed(format!("repositories: {}", created.join(", "))).into())
    }

    /// Resolve the image each service deploys. `Err` carries the failure
    /// when an artifact is missing or not verified.
    async fn resolve_images(
        &self,
        ctx: &ExecutionContext,
        environment: &EnvironmentConfig,
    ) -> Result<std::result::Result<Vec<String>, StepOutcome>> {
        let store = ctx.store.as_ref();
        let mut images = Vec::with_capacity(self.services.len());
        for service in &self.services {
            let Some(tag) = registry_binding::image_tag(store, &service.name).await? else {
                return Ok(Err(StepOutcome::failed(
                    FailureKind::ArtifactMissing,
                    format!("no image tag recorded for {}", service.name),
                )));
            };
            let Some(uri) = registry_binding::repository_uri(store, &service.name).await? else {
                return Ok(Err(StepOutcome::failed(
                    FailureKind::ArtifactMissing,
                    format!("no repository recorded for {}", service.name),
                )));
            };
            if environment.requires_verification {
                let missing = registry_binding::missing_verifications(
                    store,
                    &service.name,
                    &tag,
                    &VerificationKind::ALL,
                )
                .await?;
                if !missing.is_empty() {
                    let names: Vec<&str> = missing.iter().map(|k| k.as_str()).collect();
                    return Ok(Err(StepOutcome::failed(
                        FailureKind::ArtifactMissing,
                        format!(
                            "{}:{tag} has not passed {}",
                            service.name,
                            names.join(", ")
                        ),
                    )));
                }
            }
            images.push(format!("{uri}:{tag}"));
        }
        Ok(Ok(images))
    }

    async fn deploy(
        &self,
        ctx: &ExecutionContext,
        environment: &EnvironmentConfig,
        safety_net: &SafetyNetConfig,
    ) -> Result<StageOutcome> {
        let images = match self.resolve_images(ctx, environment).await? {
            Ok(images) => images,
            Err(failed) => return Ok(failed.into()),
        };

        // each service gets its own chain, so rate limits are per service
        for service in &self.services {
            let chain = Arc::new(RuleChain::from_config(safety_net)?);
            ctx.infrastructure
                .attach_traffic_filter(&environment.name, &service.name, chain)
                .await?;
        }

        let deployments: Vec<ServiceDeployment> = self
            .services
            .iter()
            .zip(images)
            .map(|(service, image)| ServiceDeployment {
                environment: environment.name.clone(),
                service: service.name.clone(),
                image,
                container_port: environment.container_port,
                safety_net: safety_net.clone(),
            })
            .collect();
        let results = join_all(
            deployments
                .iter()
                .map(|d| ctx.infrastructure.deploy_service(d)),
        )
        .await;

        let mut reports = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        let mut rolled_back = false;
        for (deployment, result) in deployments.iter().zip(results) {
            match result {
                Ok(report) => {
                    match &report.outcome {
                        RolloutOutcome::Promoted { .. } => {}
                        RolloutOutcome::RolledBack {
                            serving,
                            healthy,
                            desired,
                        } => {
                            rolled_back = true;
                            let serving = serving.as_ref().map(|s| s.image.as_str());
                            warn!(
                                stage = %self.name,
                                service = %deployment.service,
                                healthy,
                                desired,
                                serving = serving.unwrap_or("none"),
                                "rollout rolled back"
                            );
                            failures.push(format!(
                                "{}: rolled back ({healthy}/{desired} healthy), serving {}",
                                deployment.service,
                                serving.unwrap_or("nothing")
                            ));
                        }
                        RolloutOutcome::Failed { reason } => {
                            failures.push(format!("{}: {reason}", deployment.service));
                        }
                    }
                    reports.push(report);
                }
                Err(err) => failures.push(format!("{}: {err}", deployment.service)),
            }
        }

        let outcome = if failures.is_empty() {
            let promoted: Vec<&str> = reports.iter().map(|r| r.image.as_str()).collect();
            StepOutcome::passed(format!("promoted {}", promoted.join(", ")))
        } else {
            StepOutcome::failed(FailureKind::DeploymentFailure, failures.join("; "))
        };
        Ok(StageOutcome {
            outcome,
            rolled_back,
            deployments: reports,
        })
    }
}
