//! Deployment circuit breaker.
//!
//! A rollout launches a new replica set next to the one currently serving
//! and polls it until `desired_replica_count` replicas are healthy or the
//! rollout timeout expires. Only a fully healthy set receives traffic; the
//! set it replaces is retired afterwards. When the timeout expires first the
//! new set is retired and the previous set keeps serving.
//!
//! The serving set of each service is persisted under
//! `deployment/{environment}.{service}/servingSet`, so a later process knows
//! what to fall back to and what to retire.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shipyard_state::{ParameterKey, ParameterStore};
use tokio::time::Instant;
use tracing::{info, warn};

use super::health::HealthCheck;
use super::SafetyNetConfig;
use crate::domain::Result;
use crate::obs;

pub const DEPLOYMENT_NAMESPACE: &str = "deployment";
pub const SERVING_SET: &str = "servingSet";

pub fn serving_key(environment: &str, service: &str) -> Result<ParameterKey> {
    Ok(ParameterKey::new(
        DEPLOYMENT_NAMESPACE,
        &format!("{environment}.{service}"),
        SERVING_SET,
    )?)
}

/// A group of replicas running one image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSet {
    pub id: String,
    pub service: String,
    pub environment: String,
    pub image: String,
    pub replicas: u32,
    /// Base URLs of the individual replicas.
    pub endpoints: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub environment: String,
    pub service: String,
    pub image: String,
    pub replicas: u32,
    pub container_port: u16,
}

/// Runs replica sets. Implemented by whatever actually hosts containers.
#[async_trait]
pub trait ReplicaRuntime: Send + Sync {
    async fn launch(&self, request: &LaunchRequest) -> Result<ReplicaSet>;

    async fn healthy_replicas(&self, set: &ReplicaSet, check: &HealthCheck) -> Result<u32>;

    /// Point the service's traffic at `set`.
    async fn route_traffic(&self, set: &ReplicaSet) -> Result<()>;

    async fn retire(&self, set: &ReplicaSet) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RolloutOutcome {
    /// The new set reached the desired healthy count and now serves traffic.
    Promoted { set: ReplicaSet, healthy: u32 },
    /// The new set never became healthy and was removed; `serving` is the set
    /// still receiving traffic, if there was one.
    RolledBack {
        serving: Option<ReplicaSet>,
        healthy: u32,
        desired: u32,
    },
    /// The rollout failed without a rollback.
    Failed { reason: String },
}

impl RolloutOutcome {
    pub fn is_promoted(&self) -> bool {
        matches!(self, RolloutOutcome::Promoted { .. })
    }
}

/// Performs guarded rollouts against a [`ReplicaRuntime`], reading and
/// recording the serving set of each service in the parameter store.
pub struct DeploymentCircuitBreaker {
    runtime: Arc<dyn ReplicaRuntime>,
    store: Arc<dyn ParameterStore>,
}

impl DeploymentCircuitBreaker {
    pub fn new(runtime: Arc<dyn ReplicaRuntime>, store: Arc<dyn ParameterStore>) -> Self {
        Self { runtime, store }
    }

    /// The set currently receiving `service`'s traffic in `environment`.
    pub async fn serving(&self, environment: &str, service: &str) -> Result<Option<ReplicaSet>> {
        let key = serving_key(environment, service)?;
        match self.store.get(&key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn record_serving(&self, set: &ReplicaSet) -> Result<()> {
        let key = serving_key(&set.environment, &set.service)?;
        self.store.put(&key, &serde_json::to_string(set)?).await?;
        Ok(())
    }

    async fn retire_quietly(&self, set: &ReplicaSet, what: &str) {
        if let Err(err) = self.runtime.retire(set).await {
            warn!(set = %set.id, error = %err, "failed to retire {what} replica set");
        }
    }

    pub async fn rollout(
        &self,
        request: &LaunchRequest,
        config: &SafetyNetConfig,
    ) -> Result<RolloutOutcome> {
        let desired = config.desired_replica_count;
        let previous = self.serving(&request.environment, &request.service).await?;
        let new_set = match self.runtime.launch(request).await {
            Ok(set) => set,
            Err(err) => {
                return Ok(RolloutOutcome::Failed {
                    reason: format!("launch failed: {err}"),
                })
            }
        };
        info!(
            service = %request.service,
            environment = %request.environment,
            set = %new_set.id,
            previous = previous.as_ref().map(|p| p.id.as_str()).unwrap_or("none"),
            desired,
            "replica set launched"
        );

        let healthy = self.wait_until_healthy(&new_set, config).await;
        if healthy >= desired {
            if let Err(err) = self.runtime.route_traffic(&new_set).await {
                self.retire_quietly(&new_set, "unroutable").await;
                return Err(err);
            }
            self.record_serving(&new_set).await?;
            if let Some(previous) = previous.filter(|p| p.id != new_set.id) {
                self.retire_quietly(&previous, "replaced").await;
            }
            return Ok(RolloutOutcome::Promoted {
                set: new_set,
                healthy,
            });
        }

        if !config.rollback_on_failure {
            return Ok(RolloutOutcome::Failed {
                reason: format!("{healthy}/{desired} replicas healthy after timeout"),
            });
        }

        self.retire_quietly(&new_set, "unhealthy").await;
        obs::emit_rollback(
            &request.environment,
            &request.service,
            &new_set.id,
            previous.as_ref().map(|s| s.id.as_str()),
        );
        Ok(RolloutOutcome::RolledBack {
            serving: previous,
            healthy,
            desired,
        })
    }

    /// Poll until the set is fully healthy or the rollout timeout passes;
    /// returns the last healthy count seen.
    async fn wait_until_healthy(&self, set: &ReplicaSet, config: &SafetyNetConfig) -> u32 {
        let check = config.health_check();
        let deadline = Instant::now() + Duration::from_secs(config.rollout_timeout_secs);
        let interval = Duration::from_secs(config.health_poll_interval_secs.max(1));
        loop {
            let healthy = match self.runtime.healthy_replicas(set, &check).await {
                Ok(count) => count,
                Err(err) => {
                    warn!(set = %set.id, error = %err, "health poll failed");
                    0
                }
            };
            if healthy >= config.desired_replica_count {
                return healthy;
            }
            let now = Instant::now();
            if now >= deadline {
                return healthy;
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
        }
    }
}
