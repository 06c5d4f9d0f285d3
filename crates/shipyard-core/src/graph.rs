//! Declared resource graph.
//!
//! `synth` turns the configuration into an ordered map from resource path to
//! declaration: the registry stage, every environment stage (network,
//! cluster, load-balanced services with their safety net) and the pipeline's
//! own resources. The map is a `BTreeMap`, so the rendered JSON and its
//! digest depend only on the configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shipyard_state::ContentDigest;

use crate::config::{EnvironmentConfig, ShipyardConfig};
use crate::domain::{
    ResourcePath, Result, ServiceDescriptor, ShipyardError, StepId, POLICY_CHECK_STEP,
};
use crate::registry_binding::{self, IMAGE_TAG, REPOSITORY_URI};
use crate::safety_net::rules::{rule_plan, RATE_LIMIT_RULE};

pub const REGISTRY_STAGE: &str = "RegistryStage";
pub const PIPELINE_ROOT: &str = "Pipeline";

pub mod kinds {
    pub const REPOSITORY: &str = "registry.repository";
    pub const ROLE: &str = "iam.role";
    pub const LOG_GROUP: &str = "logs.log_group";
    pub const NETWORK: &str = "network.vpc";
    pub const SUBNET: &str = "network.subnet";
    pub const SECURITY_GROUP: &str = "network.security_group";
    pub const CLUSTER: &str = "compute.cluster";
    pub const SERVICE: &str = "compute.service";
    pub const LOAD_BALANCER: &str = "lb.load_balancer";
    pub const WEB_ACL: &str = "waf.web_acl";
    pub const WEB_ACL_ASSOCIATION: &str = "waf.association";
    pub const BUCKET: &str = "storage.bucket";
    pub const SOURCE: &str = "pipeline.source";
    pub const BUILD_PROJECT: &str = "build.project";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDecl {
    pub kind: String,
    pub properties: Value,
}

#[derive(Serialize)]
struct GraphDocument<'a> {
    pipeline: &'a str,
    resources: &'a BTreeMap<ResourcePath, ResourceDecl>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceGraph {
    pipeline: String,
    resources: BTreeMap<ResourcePath, ResourceDecl>,
}

fn path(segments: &[&str]) -> Result<ResourcePath> {
    ResourcePath::from_segments(segments.iter().copied())
}

/// Address of a service's image repository.
pub fn repository_path(service: &str) -> Result<ResourcePath> {
    path(&[REGISTRY_STAGE, format!("{service}-repository").as_str()])
}

/// Address of the build project running `step`.
pub fn step_project_path(step: &StepId) -> Result<ResourcePath> {
    path(&[PIPELINE_ROOT, "steps", step.as_str(), "project"])
}

impl ResourceGraph {
    pub fn synthesize(config: &ShipyardConfig) -> Result<Self> {
        let mut graph = ResourceGraph {
            pipeline: config.pipeline.name.clone(),
            resources: BTreeMap::new(),
        };
        let services = config.descriptors();

        for service in &services {
            graph.declare_repository(service)?;
        }
        for env in &config.environments {
            graph.declare_stage(config, env, &services)?;
        }
        graph.declare_pipeline(config, &services)?;
        Ok(graph)
    }

    fn declare(&mut self, path: ResourcePath, kind: &str, properties: Value) -> Result<()> {
        if self.resources.contains_key(&path) {
            return Err(ShipyardError::InvalidConfig(format!(
                "resource {path} declared twice"
            )));
        }
        self.resources.insert(
            path,
            ResourceDecl {
                kind: kind.to_string(),
                properties,
            },
        );
        Ok(())
    }

    fn declare_repository(&mut self, service: &ServiceDescriptor) -> Result<()> {
        let uri_key = registry_binding::registry_key(&service.name, REPOSITORY_URI)?;
        self.declare(
            repository_path(&service.name)?,
            kinds::REPOSITORY,
            json!({
                "name": service.registry_identity,
                "scan_on_push": true,
                "uri_parameter": uri_key.to_string(),
            }),
        )
    }

    fn declare_stage(
        &mut self,
        config: &ShipyardConfig,
        env: &EnvironmentConfig,
        services: &[ServiceDescriptor],
    ) -> Result<()> {
        let stage_name = env.stage_name();
        let stage = stage_name.as_str();
        let safety_net = env.safety_net(&config.safety_net);

        let log_group = path(&[stage, "flow-log-group"])?;
        let log_role = path(&[stage, "flow-log-role"])?;
        let network = path(&[stage, "network"])?;
        let cluster = path(&[stage, "cluster"])?;
        let web_acl = path(&[stage, "traffic-filter"])?;

        self.declare(
            log_group.clone(),
            kinds::LOG_GROUP,
            json!({ "retention_days": 30 }),
        )?;
        self.declare(
            log_role.clone(),
            kinds::ROLE,
            json!({
                "assumed_by": "vpc-flow-logs",
                "managed_policies": [],
                "statements": [{
                    "actions": ["logs:CreateLogStream", "logs:PutLogEvents", "logs:DescribeLogStreams"],
                    "resources": ["*"],
                }],
            }),
        )?;
        self.declare(
            network.clone(),
            kinds::NETWORK,
            json!({
                "max_azs": 2,
                "nat_gateways": 1,
                "flow_logs": { "log_group": log_group.to_string(), "role": log_role.to_string() },
            }),
        )?;
        self.declare(
            network.child("public-subnet")?,
            kinds::SUBNET,
            json!({ "public": true, "cidr_mask": 24 }),
        )?;
        self.declare(
            network.child("private-subnet")?,
            kinds::SUBNET,
            json!({ "public": false, "cidr_mask": 24 }),
        )?;
        self.declare(
            cluster.clone(),
            kinds::CLUSTER,
            json!({ "network": network.to_string(), "container_insights": true }),
        )?;

        let rules: Vec<Value> = rule_plan(&safety_net)
            .into_iter()
            .map(|rule| {
                let statement = if rule.name == RATE_LIMIT_RULE {
                    json!({ "rate_based": {
                        "limit": safety_net.rate_limit_per_window,
                        "window_secs": safety_net.rate_limit_window_secs,
                        "key": "client_ip",
                    }})
                } else {
                    json!({ "managed_rule_set": rule.name })
                };
                json!({
                    "name": rule.name,
                    "priority": rule.priority,
                    "action": rule.action,
                    "statement": statement,
                })
            })
            .collect();
        self.declare(
            web_acl.clone(),
            kinds::WEB_ACL,
            json!({ "default_action": "allow", "rules": rules }),
        )?;

        for service in services {
            let root = path(&[stage, format!("{}-service", service.name).as_str()])?;
            let execution_role = root.child("task-execution-role")?;
            let load_balancer = root.child("load-balancer")?;
            let tag_key = registry_binding::registry_key(&service.name, IMAGE_TAG)?;

            self.declare(
                execution_role.clone(),
                kinds::ROLE,
                json!({
                    "assumed_by": "container-tasks",
                    "managed_policies": ["ContainerTaskExecutionRolePolicy"],
                    "statements": [],
                }),
            )?;
            self.declare(
                load_balancer.clone(),
                kinds::LOAD_BALANCER,
                json!({ "public": true, "listener_port": 80, "access_logs": false }),
            )?;
            self.declare(
                load_balancer.child("security-group")?,
                kinds::SECURITY_GROUP,
                json!({ "ingress": [{ "cidr": "0.0.0.0/0", "port": 80 }] }),
            )?;
            self.declare(
                root.child("service")?,
                kinds::SERVICE,
                json!({
                    "cluster": cluster.to_string(),
                    "image": {
                        "repository": service.registry_identity,
                        "tag_parameter": tag_key.to_string(),
                    },
                    "container_port": env.container_port,
                    "desired_count": safety_net.desired_replica_count,
                    "execution_role": execution_role.to_string(),
                    "load_balancer": load_balancer.to_string(),
                    "health_check": {
                        "path": safety_net.health_check_path,
                        "healthy_status_code": safety_net.healthy_status_code,
                    },
                    "circuit_breaker": {
                        "rollback": safety_net.rollback_on_failure,
                        "timeout_secs": safety_net.rollout_timeout_secs,
                    },
                }),
            )?;
            self.declare(
                root.child("traffic-filter-association")?,
                kinds::WEB_ACL_ASSOCIATION,
                json!({ "web_acl": web_acl.to_string(), "resource": load_balancer.to_string() }),
            )?;
        }
        Ok(())
    }

    fn declare_pipeline(
        &mut self,
        config: &ShipyardConfig,
        services: &[ServiceDescriptor],
    ) -> Result<()> {
        self.declare(
            path(&[PIPELINE_ROOT, "source"])?,
            kinds::SOURCE,
            json!({
                "repository": config.pipeline.source_repository,
                "branch": config.pipeline.branch,
            }),
        )?;
        self.declare(
            path(&[PIPELINE_ROOT, "artifacts-bucket"])?,
            kinds::BUCKET,
            json!({ "encrypted": true, "enforce_ssl": true, "access_logs": false }),
        )?;
        self.declare(
            path(&[PIPELINE_ROOT, "role"])?,
            kinds::ROLE,
            json!({
                "assumed_by": "pipeline",
                "managed_policies": [],
                "statements": [{ "actions": ["sts:AssumeRole"], "resources": ["*"] }],
            }),
        )?;

        let timeout = config.pipeline.step_timeout_secs;
        for service in services {
            let ids = service.step_ids();
            let build_project = step_project_path(&ids.build)?;
            let build_role = path(&[PIPELINE_ROOT, "steps", ids.build.as_str(), "role"])?;
            let repository = repository_path(&service.name)?;
            self.declare(
                build_role.clone(),
                kinds::ROLE,
                json!({
                    "assumed_by": "build",
                    "managed_policies": [],
                    "statements": [
                        {
                            "actions": ["registry:PutImage", "registry:UploadLayerPart"],
                            "resources": [repository.to_string()],
                        },
                        { "actions": ["registry:GetAuthorizationToken"], "resources": ["*"] },
                    ],
                }),
            )?;
            self.declare(
                build_project,
                kinds::BUILD_PROJECT,
                json!({
                    "privileged": true,
                    "role": build_role.to_string(),
                    "timeout_secs": timeout,
                    "encryption_key": null,
                }),
            )?;
            for step in [&ids.code_scan, &ids.registry_scan, &ids.test] {
                self.declare(
                    step_project_path(step)?,
                    kinds::BUILD_PROJECT,
                    json!({ "privileged": false, "timeout_secs": timeout, "encryption_key": null }),
                )?;
            }
        }
        self.declare(
            step_project_path(&StepId::new(POLICY_CHECK_STEP))?,
            kinds::BUILD_PROJECT,
            json!({ "privileged": false, "timeout_secs": timeout, "encryption_key": null }),
        )
    }

    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    pub fn get(&self, path: &ResourcePath) -> Option<&ResourceDecl> {
        self.resources.get(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ResourcePath, &ResourceDecl)> {
        self.resources.iter()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Pretty-printed JSON document of the whole graph.
    pub fn to_json(&self) -> Result<String> {
        let document = GraphDocument {
            pipeline: &self.pipeline,
            resources: &self.resources,
        };
        Ok(serde_json::to_string_pretty(&document)?)
    }

    pub fn digest(&self) -> Result<ContentDigest> {
        Ok(ContentDigest::from_bytes(self.to_json()?.as_bytes()))
    }
}
