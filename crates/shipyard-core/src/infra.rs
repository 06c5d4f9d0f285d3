//! Infrastructure seam used by the pipeline's stages.
//!
//! [`Infrastructure`] is what a Stage needs from the outside world: image
//! repositories, guarded service deployments and the traffic filter in front
//! of each service. [`RuntimeInfrastructure`] implements it on top of an
//! [`ImageRegistry`], one [`ReplicaRuntime`] per environment and the
//! parameter store that remembers which replica set serves each service.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipyard_state::{ImageRegistry, ParameterStore};
use tracing::info;

use crate::domain::{Result, ShipyardError};
use crate::safety_net::{
    ChainVerdict, DeploymentCircuitBreaker, LaunchRequest, ReplicaRuntime, RolloutOutcome,
    RuleChain, SafetyNetConfig, WebRequest,
};

/// One service rollout into one environment.
#[derive(Debug, Clone)]
pub struct ServiceDeployment {
    pub environment: String,
    pub service: String,
    /// Full image reference, `repository:tag`.
    pub image: String,
    pub container_port: u16,
    pub safety_net: SafetyNetConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentReport {
    pub environment: String,
    pub service: String,
    pub image: String,
    pub outcome: RolloutOutcome,
}

#[async_trait]
pub trait Infrastructure: Send + Sync {
    /// Ensure the repository exists; returns its URI.
    async fn create_repository(&self, name: &str) -> Result<String>;

    async fn deploy_service(&self, deployment: &ServiceDeployment) -> Result<DeploymentReport>;

    /// Put `chain` in front of `service` in `environment`, replacing any
    /// previous filter.
    async fn attach_traffic_filter(
        &self,
        environment: &str,
        service: &str,
        chain: Arc<RuleChain>,
    ) -> Result<()>;
}

type FilterKey = (String, String);

pub struct RuntimeInfrastructure {
    registry: Arc<dyn ImageRegistry>,
    store: Arc<dyn ParameterStore>,
    breakers: HashMap<String, DeploymentCircuitBreaker>,
    filters: RwLock<HashMap<FilterKey, Arc<RuleChain>>>,
}

impl RuntimeInfrastructure {
    pub fn new(registry: Arc<dyn ImageRegistry>, store: Arc<dyn ParameterStore>) -> Self {
        Self {
            registry,
            store,
            breakers: HashMap::new(),
            filters: RwLock::new(HashMap::new()),
        }
    }

    /// Host `environment`'s replicas on `runtime`.
    pub fn with_environment(
        mut self,
        environment: impl Into<String>,
        runtime: Arc<dyn ReplicaRuntime>,
    ) -> Self {
        let breaker = DeploymentCircuitBreaker::new(runtime, self.store.clone());
        self.breakers.insert(environment.into(), breaker);
        self
    }

    pub fn breaker(&self, environment: &str) -> Option<&DeploymentCircuitBreaker> {
        self.breakers.get(environment)
    }

    pub fn traffic_filter(&self, environment: &str, service: &str) -> Option<Arc<RuleChain>> {
        self.filters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(environment.to_string(), service.to_string()))
            .cloned()
    }

    /// Run `request` through the filter in front of `service`. Services
    /// without a filter admit everything.
    pub fn screen(
        &self,
        environment: &str,
        service: &str,
        request: &WebRequest,
        now: DateTime<Utc>,
    ) -> ChainVerdict {
        match self.traffic_filter(environment, service) {
            Some(chain) => chain.evaluate(request, now),
            None => ChainVerdict {
                blocked: false,
                terminating_rule: None,
                evaluated: Vec::new(),
            },
        }
    }
}

#[async_trait]
impl Infrastructure for RuntimeInfrastructure {
    async fn create_repository(&self, name: &str) -> Result<String> {
        Ok(self.registry.create_repository(name).await?)
    }

    async fn deploy_service(&self, deployment: &ServiceDeployment) -> Result<DeploymentReport> {
        let breaker = self.breakers.get(&deployment.environment).ok_or_else(|| {
            ShipyardError::Deployment(format!(
                "no runtime configured for environment {}",
                deployment.environment
            ))
        })?;
        let request = LaunchRequest {
            environment: deployment.environment.clone(),
            service: deployment.service.clone(),
            image: deployment.image.clone(),
            replicas: deployment.safety_net.desired_replica_count,
            container_port: deployment.container_port,
        };
        let outcome = breaker.rollout(&request, &deployment.safety_net).await?;
        info!(
            environment = %deployment.environment,
            service = %deployment.service,
            promoted = outcome.is_promoted(),
            "rollout finished"
        );
        Ok(DeploymentReport {
            environment: deployment.environment.clone(),
            service: deployment.service.clone(),
            image: deployment.image.clone(),
            outcome,
        })
    }

    async fn attach_traffic_filter(
        &self,
        environment: &str,
        service: &str,
        chain: Arc<RuleChain>,
    ) -> Result<()> {
        self.filters
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((environment.to_string(), service.to_string()), chain);
        Ok(())
    }
}
