//! Built-in policy rules evaluated against the resource graph.
//!
//! Every rule inspects one declaration at a time. Findings come out in graph
//! order, then rule order, so two evaluations of the same graph agree.

use serde_json::Value;
use shipyard_state::Severity;

use crate::compliance::PolicyFinding;
use crate::graph::{kinds, ResourceDecl, ResourceGraph};

pub const IAM_WILDCARD: &str = "IAM-WILDCARD";
pub const IAM_MANAGED_POLICY: &str = "IAM-MANAGED-POLICY";
pub const NET_OPEN_INGRESS: &str = "NET-OPEN-INGRESS";
pub const LB_ACCESS_LOGS: &str = "LB-ACCESS-LOGS";
pub const S3_ACCESS_LOGS: &str = "S3-ACCESS-LOGS";
pub const BUILD_ENCRYPTION: &str = "BUILD-ENCRYPTION";

type Check = fn(&ResourceDecl) -> Option<String>;

pub struct PolicyRule {
    pub id: &'static str,
    pub severity: Severity,
    pub description: &'static str,
    check: Check,
}

impl PolicyRule {
    pub fn check(&self, decl: &ResourceDecl) -> Option<String> {
        (self.check)(decl)
    }
}

fn strings(value: &Value) -> impl Iterator<Item = &str> {
    value
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
}

fn wildcard_grant(decl: &ResourceDecl) -> Option<String> {
    if decl.kind != kinds::ROLE {
        return None;
    }
    for statement in decl.properties["statements"].as_array().into_iter().flatten() {
        let action = strings(&statement["actions"]).find(|a| a.contains('*'));
        if let Some(action) = action {
            return Some(format!("role grants wildcard action {action}"));
        }
        if strings(&statement["resources"]).any(|r| r == "*") {
            let actions: Vec<&str> = strings(&statement["actions"]).collect();
            return Some(format!(
                "role grants {} on every resource",
                actions.join(", ")
            ));
        }
    }
    None
}

fn managed_policy(decl: &ResourceDecl) -> Option<String> {
    if decl.kind != kinds::ROLE {
        return None;
    }
    let policies: Vec<&str> = strings(&decl.properties["managed_policies"]).collect();
    (!policies.is_empty()).then(|| format!("role uses managed policies: {}", policies.join(", ")))
}

fn open_ingress(decl: &ResourceDecl) -> Option<String> {
    if decl.kind != kinds::SECURITY_GROUP {
        return None;
    }
    decl.properties["ingress"]
        .as_array()
        .into_iter()
        .flatten()
        .find(|rule| matches!(rule["cidr"].as_str(), Some("0.0.0.0/0") | Some("::/0")))
        .map(|rule| {
            format!(
                "ingress open to {} on port {}",
                rule["cidr"].as_str().unwrap_or_default(),
                rule["port"]
            )
        })
}

fn access_logs_disabled(kind: &str, decl: &ResourceDecl) -> bool {
    decl.kind == kind && decl.properties["access_logs"] != Value::Bool(true)
}

fn lb_access_logs(decl: &ResourceDecl) -> Option<String> {
    access_logs_disabled(kinds::LOAD_BALANCER, decl)
        .then(|| "load balancer access logging disabled".to_string())
}

fn bucket_access_logs(decl: &ResourceDecl) -> Option<String> {
    access_logs_disabled(kinds::BUCKET, decl)
        .then(|| "bucket server access logging disabled".to_string())
}

fn build_encryption(decl: &ResourceDecl) -> Option<String> {
    (decl.kind == kinds::BUILD_PROJECT && decl.properties["encryption_key"].is_null())
        .then(|| "build project has no customer managed encryption key".to_string())
}

pub fn builtin_rules() -> Vec<PolicyRule> {
    vec![
        PolicyRule {
            id: IAM_WILDCARD,
            severity: Severity::High,
            description: "Roles must not grant wildcard actions or resources",
            check: wildcard_grant,
        },
        PolicyRule {
            id: IAM_MANAGED_POLICY,
            severity: Severity::Medium,
            description: "Roles should use inline, least-privilege policies",
            check: managed_policy,
        },
        PolicyRule {
            id: NET_OPEN_INGRESS,
            severity: Severity::High,
            description: "Security groups must not accept traffic from any address",
            check: open_ingress,
        },
        PolicyRule {
            id: LB_ACCESS_LOGS,
            severity: Severity::Medium,
            description: "Load balancers must write access logs",
            check: lb_access_logs,
        },
        PolicyRule {
            id: S3_ACCESS_LOGS,
            severity: Severity::Medium,
            description: "Buckets must write server access logs",
            check: bucket_access_logs,
        },
        PolicyRule {
            id: BUILD_ENCRYPTION,
            severity: Severity::Low,
            description: "Build projects should encrypt artifacts with a managed key",
            check: build_encryption,
        },
    ]
}

/// Every finding of every built-in rule against `graph`.
pub fn evaluate(graph: &ResourceGraph) -> Vec<PolicyFinding> {
    let rules = builtin_rules();
    let mut findings = Vec::new();
    for (path, decl) in graph.iter() {
        for rule in &rules {
            if let Some(message) = rule.check(decl) {
                findings.push(PolicyFinding {
                    resource_path: path.clone(),
                    rule_id: rule.id.to_string(),
                    severity: rule.severity,
                    message,
                });
            }
        }
    }
    findings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShipyardConfig;
    use serde_json::json;

    fn decl(kind: &str, properties: Value) -> ResourceDecl {
        ResourceDecl {
            kind: kind.to_string(),
            properties,
        }
    }

    #[test]
    fn wildcard_resources_and_actions_are_flagged() {
        let scoped = decl(
            kinds::ROLE,
            json!({ "statements": [{ "actions": ["s3:GetObject"], "resources": ["/Pipeline/artifacts-bucket"] }] }),
        );
        assert!(wildcard_grant(&scoped).is_none());

        let any_resource = decl(
            kinds::ROLE,
            json!({ "statements": [{ "actions": ["logs:PutLogEvents"], "resources": ["*"] }] }),
        );
        assert!(wildcard_grant(&any_resource).unwrap().contains("every resource"));

        let any_action = decl(
            kinds::ROLE,
            json!({ "statements": [{ "actions": ["s3:*"], "resources": ["/b"] }] }),
        );
        assert!(wildcard_grant(&any_action).unwrap().contains("s3:*"));
    }

    #[test]
    fn rules_only_apply_to_their_kind() {
        let bucket = decl(kinds::BUCKET, json!({ "access_logs": false }));
        assert!(lb_access_logs(&bucket).is_none());
        assert!(bucket_access_logs(&bucket).is_some());

        let logged = decl(kinds::BUCKET, json!({ "access_logs": true }));
        assert!(bucket_access_logs(&logged).is_none());

        let keyed = decl(kinds::BUILD_PROJECT, json!({ "encryption_key": "key/build" }));
        assert!(build_encryption(&keyed).is_none());
    }

    #[test]
    fn default_graph_findings() {
        let config = ShipyardConfig::from_toml_str(
            r#"
[pipeline]
name = "delivery"

[[services]]
name = "app1"
source_path = "containers/app1"

[[environments]]
name = "dev"
"#,
        )
        .unwrap();
        let graph = ResourceGraph::synthesize(&config).unwrap();
        let findings = evaluate(&graph);

        let has = |path: &str, rule: &str| {
            findings
                .iter()
                .any(|f| f.resource_path.to_string() == path && f.rule_id == rule)
        };
        assert!(has("/Dev/flow-log-role", IAM_WILDCARD));
        assert!(has("/Dev/app1-service/task-execution-role", IAM_MANAGED_POLICY));
        assert!(has("/Dev/app1-service/load-balancer/security-group", NET_OPEN_INGRESS));
        assert!(has("/Dev/app1-service/load-balancer", LB_ACCESS_LOGS));
        assert!(has("/Pipeline/artifacts-bucket", S3_ACCESS_LOGS));
        assert!(has("/Pipeline/steps/app1-build/role", IAM_WILDCARD));
        assert!(has("/Pipeline/steps/policy-check/project", BUILD_ENCRYPTION));
        assert!(!has("/RegistryStage/app1-repository", IAM_WILDCARD));

        assert_eq!(evaluate(&graph), findings);
    }
}
