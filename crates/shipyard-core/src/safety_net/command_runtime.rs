//! Replica runtime driven by operator-supplied commands.
//!
//! Commands receive the replica set through the environment:
//! `SHIPYARD_ENVIRONMENT`, `SERVICE_NAME`, `IMAGE`, `REPLICAS`,
//! `CONTAINER_PORT` and `REPLICA_SET_ID`. The deploy command prints the base
//! URL of each replica it started, one per line; when it prints none the
//! configured `endpoints` are checked instead.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};

use super::health::{HealthCheck, HealthChecker};
use super::rollout::{LaunchRequest, ReplicaRuntime, ReplicaSet};
use crate::command::{CommandRunner, CommandSpec};
use crate::domain::{Result, ShipyardError};

fn default_timeout_secs() -> u64 {
    300
}

/// Commands that host one environment's replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeCommands {
    #[serde(default)]
    pub deploy: Option<Vec<String>>,
    #[serde(default)]
    pub route: Option<Vec<String>>,
    #[serde(default)]
    pub retire: Option<Vec<String>>,
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RuntimeCommands {
    fn default() -> Self {
        Self {
            deploy: None,
            route: None,
            retire: None,
            endpoints: Vec::new(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

pub struct CommandReplicaRuntime {
    commands: RuntimeCommands,
    checker: Arc<dyn HealthChecker>,
}

impl CommandReplicaRuntime {
    pub fn new(commands: RuntimeCommands, checker: Arc<dyn HealthChecker>) -> Result<Self> {
        if commands.deploy.as_ref().map_or(true, |argv| argv.is_empty()) {
            return Err(ShipyardError::InvalidConfig(
                "runtime needs a deploy command".to_string(),
            ));
        }
        Ok(Self { commands, checker })
    }

    fn spec(&self, name: &str, argv: &[String], set: &ReplicaSet) -> CommandSpec {
        CommandSpec::new(format!("{}-{}", set.id, name), argv.to_vec())
            .env("SHIPYARD_ENVIRONMENT", &set.environment)
            .env("SERVICE_NAME", &set.service)
            .env("IMAGE", &set.image)
            .env("REPLICAS", set.replicas.to_string())
            .env("REPLICA_SET_ID", &set.id)
            .timeout_secs(self.commands.timeout_secs)
    }

    async fn run(&self, name: &str, spec: CommandSpec) -> Result<String> {
        let output = CommandRunner::execute(&spec).await?;
        if !output.passed() {
            return Err(ShipyardError::Deployment(format!(
                "{name} command exited with {}: {}",
                output.exit_code,
                output.stderr_tail()
            )));
        }
        tracing::debug!(command = %spec.name, "runtime command finished");
        Ok(output.stdout)
    }
}

#[async_trait]
impl ReplicaRuntime for CommandReplicaRuntime {
    async fn launch(&self, request: &LaunchRequest) -> Result<ReplicaSet> {
        let argv = self.commands.deploy.clone().unwrap_or_default();
        let id = format!(
            "{}-{}-{}",
            request.environment,
            request.service,
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let mut set = ReplicaSet {
            id,
            service: request.service.clone(),
            environment: request.environment.clone(),
            image: request.image.clone(),
            replicas: request.replicas,
            endpoints: Vec::new(),
        };
        let spec = self
            .spec("deploy", &argv, &set)
            .env("CONTAINER_PORT", request.container_port.to_string());
        let stdout = self.run("deploy", spec).await?;

        set.endpoints = stdout
            .lines()
            .map(str::trim)
            .filter(|l| l.starts_with("http://") || l.starts_with("https://"))
            .map(str::to_string)
            .collect();
        if set.endpoints.is_empty() {
            set.endpoints = self.commands.endpoints.clone();
        }
        Ok(set)
    }

    async fn healthy_replicas(&self, set: &ReplicaSet, check: &HealthCheck) -> Result<u32> {
        let checks = set
            .endpoints
            .iter()
            .map(|endpoint| self.checker.is_healthy(endpoint, check));
        let results = join_all(checks).await;
        Ok(results.into_iter().filter(|healthy| *healthy).count() as u32)
    }

    async fn route_traffic(&self, set: &ReplicaSet) -> Result<()> {
        if let Some(argv) = &self.commands.route {
            self.run("route", self.spec("route", argv, set)).await?;
        }
        Ok(())
    }

    async fn retire(&self, set: &ReplicaSet) -> Result<()> {
        if let Some(argv) = &self.commands.retire {
            self.run("retire", self.spec("retire", argv, set)).await?;
        }
        Ok(())
    }
}
