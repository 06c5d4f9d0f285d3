//! Integration tests for synthesis and policy evaluation of the checked-in
//! pipeline definition.

use std::path::PathBuf;

use shipyard_core::config::ShipyardConfig;
use shipyard_core::graph::ResourceGraph;
use shipyard_core::{parse_annotations, policy};

fn workspace_config() -> ShipyardConfig {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../shipyard.toml");
    let source = std::fs::read_to_string(&path).expect("read shipyard.toml");
    ShipyardConfig::from_toml_str(&source).expect("valid shipyard.toml")
}

/// Test: synthesizing the same definition twice gives identical output
#[test]
fn test_synthesis_is_idempotent() {
    let config = workspace_config();
    let first = ResourceGraph::synthesize(&config).unwrap();
    let second = ResourceGraph::synthesize(&config).unwrap();
    assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());
    assert_eq!(first.digest().unwrap(), second.digest().unwrap());
}

/// Test: every finding on the checked-in definition has a reviewed record,
/// and no record is stale
#[test]
fn test_checked_in_suppressions_cover_all_findings() {
    let config = workspace_config();
    let ledger = config.compliance_ledger().unwrap();
    let graph = ResourceGraph::synthesize(&config).unwrap();
    let findings = policy::evaluate(&graph);

    assert!(!findings.is_empty());
    let open: Vec<String> = findings
        .iter()
        .filter(|f| !ledger.is_suppressed(&f.resource_path, &f.rule_id))
        .map(ToString::to_string)
        .collect();
    assert!(open.is_empty(), "unsuppressed findings: {open:#?}");
    assert!(ledger.unused(&findings).is_empty());
}

/// Test: removing a record re-opens exactly that finding
#[test]
fn test_missing_record_reopens_finding() {
    let mut config = workspace_config();
    config
        .suppressions
        .retain(|r| r.resource_path.to_string() != "/Production/app1-service/load-balancer");
    let ledger = config.compliance_ledger().unwrap();
    let graph = ResourceGraph::synthesize(&config).unwrap();

    let open: Vec<_> = policy::evaluate(&graph)
        .into_iter()
        .filter(|f| !ledger.is_suppressed(&f.resource_path, &f.rule_id))
        .collect();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].rule_id, policy::LB_ACCESS_LOGS);
}

/// Test: production runs two replicas behind the health check
#[test]
fn test_production_service_settings() {
    let graph = ResourceGraph::synthesize(&workspace_config()).unwrap();
    let path = "/Production/app1-service/service".parse().unwrap();
    let service = graph.get(&path).expect("production service");
    assert_eq!(service.properties["desired_count"], 2);
    assert_eq!(service.properties["health_check"]["healthy_status_code"], 200);

    let staging = "/Staging/app1-service/service".parse().unwrap();
    assert_eq!(graph.get(&staging).unwrap().properties["desired_count"], 1);
}

/// Test: annotation output groups policy lines per resource
#[test]
fn test_annotations_from_policy_log() {
    let log = "\
[Error at /Dev/network] NET-OPEN-INGRESS: ingress open
[Warning at /Dev/network] LB-ACCESS-LOGS: disabled
unrelated output
";
    let annotations = parse_annotations(log);
    assert_eq!(annotations.len(), 1);
    assert_eq!(annotations[0].messages.len(), 2);
}
