//! Runtime safety net attached to every deployed service.
//!
//! - [`health`]: health check contract and HTTP checker
//! - [`rate_limit`]: fixed-window request limiter keyed by client IP
//! - [`rules`]: managed rule sets and the priority-ordered rule chain
//! - [`rollout`]: deployment circuit breaker with rollback
//! - [`command_runtime`]: replica runtime driven by external commands
//! - [`fakes`]: scripted replica runtime for tests

pub mod command_runtime;
pub mod fakes;
pub mod health;
pub mod rate_limit;
pub mod rollout;
pub mod rules;

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::domain::{Result, ShipyardError};
use rules::RuleAction;

pub use command_runtime::{CommandReplicaRuntime, RuntimeCommands};
pub use health::{HealthCheck, HealthChecker, HttpHealthChecker};
pub use rate_limit::{RateDecision, RateLimiter};
pub use rollout::{
    serving_key, DeploymentCircuitBreaker, LaunchRequest, ReplicaRuntime, ReplicaSet,
    RolloutOutcome,
};
pub use rules::{ChainVerdict, ManagedRuleSet, ProtectionRule, RuleChain, WebRequest};

/// Managed rule sets attached when none are configured.
pub const DEFAULT_MANAGED_RULE_SETS: [&str; 4] = [
    "CommonRuleSet",
    "KnownBadInputsRuleSet",
    "IpReputationList",
    "BotControlRuleSet",
];

/// Safety net settings of one Stage. Fixed when the Stage is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyNetConfig {
    pub health_check_path: String,
    pub healthy_status_code: u16,
    /// Requests allowed per client IP per window.
    pub rate_limit_per_window: u32,
    pub rate_limit_window_secs: u64,
    pub managed_rule_set_names: Vec<String>,
    /// Action applied when a managed rule set matches.
    pub managed_rule_action: RuleAction,
    /// Client addresses matched by the IP reputation rule set.
    pub ip_reputation_list: Vec<IpAddr>,
    pub desired_replica_count: u32,
    pub rollback_on_failure: bool,
    /// How long a new replica set has to become fully healthy.
    pub rollout_timeout_secs: u64,
    pub health_poll_interval_secs: u64,
}

impl Default for SafetyNetConfig {
    fn default() -> Self {
        Self {
            health_check_path: "/health".to_string(),
            healthy_status_code: 200,
            rate_limit_per_window: 100,
            rate_limit_window_secs: 300,
            managed_rule_set_names: DEFAULT_MANAGED_RULE_SETS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            managed_rule_action: RuleAction::Block,
            ip_reputation_list: Vec::new(),
            desired_replica_count: 1,
            rollback_on_failure: true,
            rollout_timeout_secs: 600,
            health_poll_interval_secs: 5,
        }
    }
}

impl SafetyNetConfig {
    /// Same settings with a different replica count.
    pub fn with_replicas(&self, desired_replica_count: u32) -> Self {
        Self {
            desired_replica_count,
            ..self.clone()
        }
    }

    pub fn health_check(&self) -> HealthCheck {
        HealthCheck {
            path: self.health_check_path.clone(),
            healthy_status_code: self.healthy_status_code,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.health_check_path.starts_with('/') {
            return Err(ShipyardError::InvalidConfig(format!(
                "health check path must start with '/': {}",
                self.health_check_path
            )));
        }
        if !(100..=599).contains(&self.healthy_status_code) {
            return Err(ShipyardError::InvalidConfig(format!(
                "healthy status code out of range: {}",
                self.healthy_status_code
            )));
        }
        if self.rate_limit_per_window == 0 || self.rate_limit_window_secs == 0 {
            return Err(ShipyardError::InvalidConfig(
                "rate limit and its window must be positive".to_string(),
            ));
        }
        if self.desired_replica_count == 0 {
            return Err(ShipyardError::InvalidConfig(
                "desired replica count must be at least 1".to_string(),
            ));
        }
        if self.health_poll_interval_secs == 0 {
            return Err(ShipyardError::InvalidConfig(
                "health poll interval must be positive".to_string(),
            ));
        }
        for name in &self.managed_rule_set_names {
            ManagedRuleSet::by_name(name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SafetyNetConfig::default();
        config.validate().unwrap();
        assert_eq!(config.health_check_path, "/health");
        assert_eq!(config.rate_limit_per_window, 100);
        assert_eq!(config.rate_limit_window_secs, 300);
        assert_eq!(config.managed_rule_set_names.len(), 4);
    }

    #[test]
    fn rejects_zero_replicas_and_unknown_rule_sets() {
        assert!(SafetyNetConfig::default().with_replicas(0).validate().is_err());

        let config = SafetyNetConfig {
            managed_rule_set_names: vec!["NoSuchRuleSet".to_string()],
            ..SafetyNetConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: SafetyNetConfig = toml::from_str("rate_limit_per_window = 50").unwrap();
        assert_eq!(config.rate_limit_per_window, 50);
        assert_eq!(config.healthy_status_code, 200);
    }
}
