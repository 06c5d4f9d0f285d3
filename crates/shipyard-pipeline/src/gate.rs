//! Compliance gate: decides whether a set of findings blocks a step.

use serde::{Deserialize, Serialize};
use shipyard_core::annotations::{annotation_line, AnnotationLevel};
use shipyard_core::{ComplianceLedger, PolicyFinding};
use shipyard_state::Severity;

/// Gate evaluation verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateVerdict {
    /// Whether the gate passed.
    pub passed: bool,

    /// Findings covered by a suppression record.
    pub acknowledged: Vec<PolicyFinding>,

    /// Unsuppressed findings at or above the threshold (empty if passed).
    pub violations: Vec<PolicyFinding>,

    /// Unsuppressed findings below the threshold; reported, never blocking.
    pub below_threshold: Vec<PolicyFinding>,

    /// Summary message.
    pub message: String,
}

impl GateVerdict {
    /// One annotation line per unsuppressed finding: violations as errors,
    /// the rest as warnings.
    pub fn annotations(&self) -> Vec<String> {
        let errors = self
            .violations
            .iter()
            .map(|f| (AnnotationLevel::Error, f));
        let warnings = self
            .below_threshold
            .iter()
            .map(|f| (AnnotationLevel::Warning, f));
        errors
            .chain(warnings)
            .map(|(level, f)| {
                annotation_line(
                    level,
                    &f.resource_path,
                    format!("{}: {}", f.rule_id, f.message),
                )
            })
            .collect()
    }
}

pub struct ComplianceGate;

impl ComplianceGate {
    /// Evaluate `findings` against `ledger`.
    ///
    /// Gate rule:
    /// - A finding whose exact `(resource path, rule id)` pair has a record
    ///   is acknowledged.
    /// - Any other finding at or above `threshold` is a violation and fails
    ///   the gate.
    pub fn evaluate(
        ledger: &ComplianceLedger,
        findings: Vec<PolicyFinding>,
        threshold: Severity,
    ) -> GateVerdict {
        let mut acknowledged = Vec::new();
        let mut violations = Vec::new();
        let mut below_threshold = Vec::new();

        for finding in findings {
            if ledger.is_suppressed(&finding.resource_path, &finding.rule_id) {
                acknowledged.push(finding);
            } else if finding.severity >= threshold {
                violations.push(finding);
            } else {
                below_threshold.push(finding);
            }
        }

        let passed = violations.is_empty();
        let message = if passed {
            format!(
                "passed: {} acknowledged, {} below {}",
                acknowledged.len(),
                below_threshold.len(),
                threshold.as_str()
            )
        } else {
            let rules: Vec<String> = violations
                .iter()
                .map(|f| format!("{} on {}", f.rule_id, f.resource_path))
                .collect();
            format!(
                "{} unsuppressed finding(s) at or above {}: {}",
                violations.len(),
                threshold.as_str(),
                rules.join(", ")
            )
        };

        GateVerdict {
            passed,
            acknowledged,
            violations,
            below_threshold,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipyard_core::SuppressionRecord;

    fn finding(path: &str, rule: &str, severity: Severity) -> PolicyFinding {
        PolicyFinding {
            resource_path: path.parse().unwrap(),
            rule_id: rule.to_string(),
            severity,
            message: "detail".to_string(),
        }
    }

    fn ledger() -> ComplianceLedger {
        ComplianceLedger::new(vec![SuppressionRecord {
            resource_path: "/Dev/network".parse().unwrap(),
            rule_id: "NET-OPEN-INGRESS".to_string(),
            reason: "reviewed".to_string(),
        }])
        .unwrap()
    }

    #[test]
    fn suppressed_findings_do_not_block() {
        let verdict = ComplianceGate::evaluate(
            &ledger(),
            vec![finding("/Dev/network", "NET-OPEN-INGRESS", Severity::Critical)],
            Severity::Low,
        );
        assert!(verdict.passed);
        assert_eq!(verdict.acknowledged.len(), 1);
    }

    #[test]
    fn mismatched_rule_fails_closed() {
        let verdict = ComplianceGate::evaluate(
            &ledger(),
            vec![finding("/Dev/network", "IAM-WILDCARD", Severity::High)],
            Severity::High,
        );
        assert!(!verdict.passed);
        assert!(verdict.message.contains("IAM-WILDCARD on /Dev/network"));
        assert_eq!(
            verdict.annotations(),
            vec!["[Error at /Dev/network] IAM-WILDCARD: detail"]
        );
    }

    #[test]
    fn below_threshold_is_reported_not_blocking() {
        let verdict = ComplianceGate::evaluate(
            &ledger(),
            vec![finding("/Dev/cluster", "CVE-1", Severity::Medium)],
            Severity::High,
        );
        assert!(verdict.passed);
        assert_eq!(
            verdict.annotations(),
            vec!["[Warning at /Dev/cluster] CVE-1: detail"]
        );
    }
}
