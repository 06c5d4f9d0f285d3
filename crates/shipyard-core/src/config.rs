//! Shipyard configuration: `shipyard.toml` plus `SHIPYARD_*` environment
//! variables. Loaded once, validated, then shared read-only.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};
use shipyard_state::Severity;

use crate::compliance::{ComplianceLedger, SuppressionRecord};
use crate::domain::{Result, ServiceDescriptor, ShipyardError};
use crate::registry_client::RegistrySettings;
use crate::safety_net::{RuntimeCommands, SafetyNetConfig};

pub const CONFIG_FILE: &str = "shipyard.toml";

pub const ENV_ACCOUNT: &str = "SHIPYARD_ACCOUNT";
pub const ENV_REGION: &str = "SHIPYARD_REGION";
pub const ENV_MODE: &str = "SHIPYARD_MODE";
pub const ENV_REVISION: &str = "SHIPYARD_REVISION";

/// Environment names taken by the fixed pipeline waves (`RegistryWave`,
/// `BuildWave`, `TestWave`) and the `/Pipeline` resource root.
pub const RESERVED_ENVIRONMENT_NAMES: [&str; 4] = ["registry", "build", "test", "pipeline"];

/// Selects which checks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    #[default]
    Normal,
    Test,
    SecurityTest,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Normal => "normal",
            RunMode::Test => "test",
            RunMode::SecurityTest => "security-test",
        }
    }

    /// Policy checks over the resource graph run in `test` and
    /// `security-test`.
    pub fn policy_checks_enabled(&self) -> bool {
        !matches!(self, RunMode::Normal)
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = ShipyardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "" | "normal" => Ok(RunMode::Normal),
            "test" => Ok(RunMode::Test),
            "security-test" => Ok(RunMode::SecurityTest),
            other => Err(ShipyardError::InvalidConfig(format!(
                "unknown mode {other:?} (expected normal, test or security-test)"
            ))),
        }
    }
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_approval_poll_secs() -> u64 {
    5
}

fn default_step_timeout_secs() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    pub name: String,
    #[serde(default)]
    pub source_repository: Option<String>,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Unset: approvals wait until granted, rejected or cancelled.
    #[serde(default)]
    pub approval_timeout_secs: Option<u64>,
    #[serde(default = "default_approval_poll_secs")]
    pub approval_poll_secs: u64,
    /// Timeout applied to every build, scan and test command.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
}

/// Command overrides for one service; unset commands use the defaults below.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceCommands {
    #[serde(default)]
    pub build: Option<Vec<String>>,
    #[serde(default)]
    pub code_scan: Option<Vec<String>>,
    #[serde(default)]
    pub test: Option<Vec<String>>,
}

fn shell(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

impl ServiceCommands {
    pub fn build_argv(&self) -> Vec<String> {
        self.build.clone().unwrap_or_else(|| {
            shell(r#"docker build -t "$LOCAL_IMAGE" -f "$DOCKERFILE_PATH" "$CONTEXT_PATH""#)
        })
    }

    pub fn code_scan_argv(&self) -> Vec<String> {
        self.code_scan
            .clone()
            .unwrap_or_else(|| shell(r#"cd "$CONTAINER_PATH" && npm audit --audit-level=high"#))
    }

    pub fn test_argv(&self) -> Vec<String> {
        self.test
            .clone()
            .unwrap_or_else(|| shell(r#"cd "$CONTAINER_PATH" && npm ci && npm test"#))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub source_path: PathBuf,
    #[serde(default)]
    pub dockerfile_path: Option<PathBuf>,
    #[serde(default)]
    pub build_context_path: Option<PathBuf>,
    #[serde(default)]
    pub repository_name: Option<String>,
    #[serde(default)]
    pub commands: ServiceCommands,
}

impl ServiceConfig {
    pub fn descriptor(&self) -> ServiceDescriptor {
        let build_context_path = self
            .build_context_path
            .clone()
            .unwrap_or_else(|| self.source_path.clone());
        ServiceDescriptor {
            name: self.name.clone(),
            source_path: self.source_path.clone(),
            dockerfile_path: self
                .dockerfile_path
                .clone()
                .unwrap_or_else(|| build_context_path.join("Dockerfile")),
            build_context_path,
            registry_identity: self
                .repository_name
                .clone()
                .unwrap_or_else(|| format!("{}-repository", self.name)),
        }
    }
}

fn one() -> u32 {
    1
}

fn default_container_port() -> u16 {
    3000
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub name: String,
    #[serde(default = "one")]
    pub desired_replicas: u32,
    #[serde(default = "default_container_port")]
    pub container_port: u16,
    /// A manual approval must be granted before this environment deploys.
    #[serde(default)]
    pub requires_approval: bool,
    /// Deploy only images that passed every verification step.
    #[serde(default = "yes")]
    pub requires_verification: bool,
    #[serde(default)]
    pub runtime: RuntimeCommands,
}

impl EnvironmentConfig {
    /// Stage name used in resource paths: `dev` -> `Dev`.
    pub fn stage_name(&self) -> String {
        let mut chars = self.name.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        }
    }

    pub fn wave_name(&self) -> String {
        format!("{}Wave", self.stage_name())
    }

    /// Shared safety net settings with this environment's replica count.
    pub fn safety_net(&self, base: &SafetyNetConfig) -> SafetyNetConfig {
        base.with_replicas(self.desired_replicas)
    }
}

fn default_policy_threshold() -> Severity {
    Severity::Low
}

fn default_scan_threshold() -> Severity {
    Severity::High
}

/// Severities at or above which unsuppressed findings fail a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_policy_threshold")]
    pub policy_threshold: Severity,
    #[serde(default = "default_scan_threshold")]
    pub scan_threshold: Severity,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            policy_threshold: default_policy_threshold(),
            scan_threshold: default_scan_threshold(),
        }
    }
}

fn default_state_url() -> String {
    "surrealkv://.shipyard/state".to_string()
}

/// Where pipeline state lives. It must outlive a single invocation: `deploy`
/// records approvals, artifacts and serving replica sets that `approve` and
/// later runs read back. `SURREALDB_URL` (or the `SURREALDB_ENDPOINT`
/// credentials) override `url`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSettings {
    #[serde(default = "default_state_url")]
    pub url: String,
}

impl Default for StateSettings {
    fn default() -> Self {
        Self {
            url: default_state_url(),
        }
    }
}

/// Values taken from the environment rather than the file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub account: Option<String>,
    pub region: Option<String>,
    pub mode: RunMode,
    pub revision: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShipyardConfig {
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub environments: Vec<EnvironmentConfig>,
    #[serde(default)]
    pub registry: RegistrySettings,
    #[serde(default)]
    pub safety_net: SafetyNetConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub state: StateSettings,
    #[serde(default)]
    pub suppressions: Vec<SuppressionRecord>,
    #[serde(skip)]
    pub runtime: RuntimeSettings,
}

impl ShipyardConfig {
    /// Parse and validate a TOML document. Environment variables are not read.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: ShipyardConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path`, then apply `SHIPYARD_*` environment variables.
    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            ShipyardError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut config = Self::from_toml_str(&source)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        self.runtime.account = non_empty(ENV_ACCOUNT);
        self.runtime.region = non_empty(ENV_REGION);
        self.runtime.revision = non_empty(ENV_REVISION).map(|v| v.trim().to_string());
        self.runtime.mode = match non_empty(ENV_MODE) {
            Some(mode) => mode.parse()?,
            None => RunMode::Normal,
        };
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let name_pattern = Regex::new(r"^[a-z0-9][a-z0-9-]*$")
            .map_err(|e| ShipyardError::InvalidConfig(e.to_string()))?;

        if self.pipeline.name.trim().is_empty() {
            return Err(ShipyardError::InvalidConfig(
                "pipeline name must not be empty".to_string(),
            ));
        }
        if self.pipeline.approval_timeout_secs == Some(0) {
            return Err(ShipyardError::InvalidConfig(
                "approval_timeout_secs must be positive when set".to_string(),
            ));
        }
        if self.pipeline.approval_poll_secs == 0 {
            return Err(ShipyardError::InvalidConfig(
                "approval_poll_secs must be positive".to_string(),
            ));
        }

        if self.registry.host.trim().is_empty() || self.registry.push.is_empty() {
            return Err(ShipyardError::InvalidConfig(
                "registry needs a host and a push command".to_string(),
            ));
        }

        if self.services.is_empty() {
            return Err(ShipyardError::InvalidConfig(
                "at least one service is required".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for service in &self.services {
            if !name_pattern.is_match(&service.name) {
                return Err(ShipyardError::InvalidConfig(format!(
                    "service name {:?} must be lowercase letters, digits and '-'",
                    service.name
                )));
            }
            if !seen.insert(service.name.as_str()) {
                return Err(ShipyardError::DuplicateName {
                    kind: "service",
                    name: service.name.clone(),
                });
            }
        }

        if self.environments.is_empty() {
            return Err(ShipyardError::InvalidConfig(
                "at least one environment is required".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for env in &self.environments {
            if !name_pattern.is_match(&env.name) {
                return Err(ShipyardError::InvalidConfig(format!(
                    "environment name {:?} must be lowercase letters, digits and '-'",
                    env.name
                )));
            }
            if RESERVED_ENVIRONMENT_NAMES.contains(&env.name.as_str()) {
                return Err(ShipyardError::InvalidConfig(format!(
                    "environment name {:?} is reserved by the pipeline",
                    env.name
                )));
            }
            if !seen.insert(env.name.as_str()) {
                return Err(ShipyardError::DuplicateName {
                    kind: "environment",
                    name: env.name.clone(),
                });
            }
            if env.desired_replicas == 0 {
                return Err(ShipyardError::InvalidConfig(format!(
                    "environment {} needs desired_replicas >= 1",
                    env.name
                )));
            }
            env.safety_net(&self.safety_net).validate()?;
        }

        if self.state.url.trim().is_empty() {
            return Err(ShipyardError::InvalidConfig(
                "state url must not be empty".to_string(),
            ));
        }

        self.compliance_ledger()?;
        Ok(())
    }

    pub fn compliance_ledger(&self) -> Result<ComplianceLedger> {
        ComplianceLedger::new(self.suppressions.clone())
    }

    pub fn descriptors(&self) -> Vec<ServiceDescriptor> {
        self.services.iter().map(ServiceConfig::descriptor).collect()
    }

    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn environment(&self, name: &str) -> Option<&EnvironmentConfig> {
        self.environments.iter().find(|e| e.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
[pipeline]
name = "delivery"

[[services]]
name = "app1"
source_path = "containers/app1"

[[environments]]
name = "dev"
requires_verification = false

[[environments]]
name = "production"
desired_replicas = 2
requires_approval = true

[[suppressions]]
resource_path = "/Pipeline/artifacts-bucket"
rule_id = "S3-ACCESS-LOGS"
reason = "artifact bucket holds build outputs only"
"#;

    #[test]
    fn parses_with_defaults() {
        let config = ShipyardConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.pipeline.branch, "main");
        assert_eq!(config.pipeline.approval_timeout_secs, None);
        assert_eq!(config.environments[0].desired_replicas, 1);
        assert_eq!(config.environments[0].container_port, 3000);
        assert_eq!(config.environments[1].stage_name(), "Production");
        assert_eq!(config.environments[1].wave_name(), "ProductionWave");
        assert_eq!(config.safety_net.health_check_path, "/health");
        assert_eq!(config.policy.scan_threshold, Severity::High);
        assert_eq!(config.compliance_ledger().unwrap().len(), 1);

        let descriptor = config.services[0].descriptor();
        assert_eq!(
            descriptor.dockerfile_path,
            PathBuf::from("containers/app1/Dockerfile")
        );
        assert_eq!(descriptor.registry_identity, "app1-repository");
    }

    #[test]
    fn environment_overrides_apply() {
        let mut config = ShipyardConfig::from_toml_str(SAMPLE).unwrap();
        let vars: HashMap<&str, &str> = [
            (ENV_MODE, "SECURITY_TEST"),
            (ENV_REVISION, "abc123 "),
            (ENV_REGION, "eu-west-1"),
        ]
        .into_iter()
        .collect();
        config
            .apply_env(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.runtime.mode, RunMode::SecurityTest);
        assert!(config.runtime.mode.policy_checks_enabled());
        assert_eq!(config.runtime.revision.as_deref(), Some("abc123"));
        assert_eq!(config.runtime.region.as_deref(), Some("eu-west-1"));
        assert_eq!(config.runtime.account, None);

        assert!(config.apply_env(|_| Some("loud".to_string())).is_err());
    }

    #[test]
    fn normal_mode_skips_policy_checks() {
        assert!(!RunMode::Normal.policy_checks_enabled());
        assert!(RunMode::Test.policy_checks_enabled());
        assert_eq!("test".parse::<RunMode>().unwrap(), RunMode::Test);
    }

    #[test]
    fn rejects_duplicates_and_bad_values() {
        let dup_service = SAMPLE.replace(
            "[[environments]]\nname = \"dev\"",
            "[[services]]\nname = \"app1\"\nsource_path = \"x\"\n\n[[environments]]\nname = \"dev\"",
        );
        assert!(matches!(
            ShipyardConfig::from_toml_str(&dup_service),
            Err(ShipyardError::DuplicateName { kind: "service", .. })
        ));

        let zero = SAMPLE.replace("desired_replicas = 2", "desired_replicas = 0");
        assert!(ShipyardConfig::from_toml_str(&zero).is_err());

        let no_rate = format!("{SAMPLE}\n[safety_net]\nrate_limit_per_window = 0\n");
        assert!(ShipyardConfig::from_toml_str(&no_rate).is_err());

        let bad_name = SAMPLE.replace("name = \"app1\"", "name = \"App One\"");
        assert!(ShipyardConfig::from_toml_str(&bad_name).is_err());
    }

    #[test]
    fn rejects_environment_names_used_by_the_pipeline() {
        for reserved in RESERVED_ENVIRONMENT_NAMES {
            let source = SAMPLE.replace("name = \"dev\"", &format!("name = \"{reserved}\""));
            let err = ShipyardConfig::from_toml_str(&source).unwrap_err();
            assert!(err.to_string().contains("reserved"), "{reserved}: {err}");
        }
        let source = SAMPLE.replace("name = \"dev\"", "name = \"testing\"");
        assert!(ShipyardConfig::from_toml_str(&source).is_ok());
    }

    #[test]
    fn state_defaults_to_a_local_database() {
        let config = ShipyardConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.state.url, "surrealkv://.shipyard/state");

        let custom = format!("{SAMPLE}\n[state]\nurl = \"ws://state.internal:8000\"\n");
        let config = ShipyardConfig::from_toml_str(&custom).unwrap();
        assert_eq!(config.state.url, "ws://state.internal:8000");

        let empty = format!("{SAMPLE}\n[state]\nurl = \"\"\n");
        assert!(ShipyardConfig::from_toml_str(&empty).is_err());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, SAMPLE).unwrap();
        let config = ShipyardConfig::load(&path).unwrap();
        assert_eq!(config.pipeline.name, "delivery");

        assert!(ShipyardConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
