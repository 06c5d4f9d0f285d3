//! Compliance exception ledger.
//!
//! The ledger is built once from configuration and passed explicitly to the
//! components that check findings against it. Lookups are by the exact
//! `(resource path, rule id)` pair: a finding with no matching record is not
//! suppressed, so unknown findings block promotion until a reviewed record is
//! added.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use shipyard_state::Severity;

use crate::domain::{ResourcePath, Result, ShipyardError};

/// A reviewed, justified exception to one rule on one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuppressionRecord {
    pub resource_path: ResourcePath,
    pub rule_id: String,
    pub reason: String,
}

/// Immutable set of suppression records.
#[derive(Debug, Clone, Default)]
pub struct ComplianceLedger {
    records: Vec<SuppressionRecord>,
    index: HashMap<ResourcePath, HashMap<String, usize>>,
}

impl ComplianceLedger {
    /// Build a ledger. Records need a rule id and a reason; the same
    /// `(path, rule)` pair may appear only once.
    pub fn new(records: Vec<SuppressionRecord>) -> Result<Self> {
        let mut index: HashMap<ResourcePath, HashMap<String, usize>> = HashMap::new();
        for (position, record) in records.iter().enumerate() {
            if record.rule_id.trim().is_empty() {
                return Err(ShipyardError::InvalidSuppression(format!(
                    "empty rule id for {}",
                    record.resource_path
                )));
            }
            if record.reason.trim().is_empty() {
                return Err(ShipyardError::InvalidSuppression(format!(
                    "{} on {} has no reason",
                    record.rule_id, record.resource_path
                )));
            }
            let rules = index.entry(record.resource_path.clone()).or_default();
            if rules.insert(record.rule_id.clone(), position).is_some() {
                return Err(ShipyardError::InvalidSuppression(format!(
                    "{} on {} is recorded twice",
                    record.rule_id, record.resource_path
                )));
            }
        }
        Ok(Self { records, index })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_suppressed(&self, path: &ResourcePath, rule_id: &str) -> bool {
        self.reason_for(path, rule_id).is_some()
    }

    pub fn reason_for(&self, path: &ResourcePath, rule_id: &str) -> Option<&str> {
        let position = self.index.get(path)?.get(rule_id)?;
        Some(self.records[*position].reason.as_str())
    }

    /// Records in the order they were loaded.
    pub fn records(&self) -> &[SuppressionRecord] {
        &self.records
    }

    /// Records whose `(path, rule)` pair was not hit by any of `findings`.
    pub fn unused<'a>(&'a self, findings: &[PolicyFinding]) -> Vec<&'a SuppressionRecord> {
        let hit: HashSet<(&ResourcePath, &str)> = findings
            .iter()
            .map(|f| (&f.resource_path, f.rule_id.as_str()))
            .collect();
        self.records
            .iter()
            .filter(|r| !hit.contains(&(&r.resource_path, r.rule_id.as_str())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// A rule violation attributed to one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyFinding {
    pub resource_path: ResourcePath,
    pub rule_id: String,
    pub severity: Severity,
    pub message: String,
}

impl fmt::Display for PolicyFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}: {}",
            self.resource_path, self.severity, self.rule_id, self.message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str, rule: &str) -> SuppressionRecord {
        SuppressionRecord {
            resource_path: path.parse().unwrap(),
            rule_id: rule.to_string(),
            reason: "reviewed".to_string(),
        }
    }

    #[test]
    fn exact_pair_is_suppressed() {
        let ledger = ComplianceLedger::new(vec![record("/Dev/flow-log-role", "IAM-WILDCARD")])
            .unwrap();
        let path: ResourcePath = "/Dev/flow-log-role".parse().unwrap();
        assert!(ledger.is_suppressed(&path, "IAM-WILDCARD"));
        assert_eq!(ledger.reason_for(&path, "IAM-WILDCARD"), Some("reviewed"));
    }

    #[test]
    fn mismatches_fail_closed() {
        let ledger = ComplianceLedger::new(vec![record("/Dev/flow-log-role", "IAM-WILDCARD")])
            .unwrap();
        let path: ResourcePath = "/Dev/flow-log-role".parse().unwrap();
        let parent: ResourcePath = "/Dev".parse().unwrap();
        let sibling: ResourcePath = "/Staging/flow-log-role".parse().unwrap();
        assert!(!ledger.is_suppressed(&path, "IAM-MANAGED-POLICY"));
        assert!(!ledger.is_suppressed(&parent, "IAM-WILDCARD"));
        assert!(!ledger.is_suppressed(&sibling, "IAM-WILDCARD"));
        assert!(!ComplianceLedger::empty().is_suppressed(&path, "IAM-WILDCARD"));
    }

    #[test]
    fn rejects_incomplete_or_duplicate_records() {
        let mut no_reason = record("/Dev/a", "R1");
        no_reason.reason = " ".to_string();
        assert!(ComplianceLedger::new(vec![no_reason]).is_err());
        assert!(ComplianceLedger::new(vec![record("/Dev/a", "")]).is_err());
        assert!(ComplianceLedger::new(vec![record("/Dev/a", "R1"), record("/Dev/a", "R1")]).is_err());
        assert_eq!(
            ComplianceLedger::new(vec![record("/Dev/a", "R1"), record("/Dev/a", "R2")])
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn unused_lists_records_without_findings() {
        let ledger =
            ComplianceLedger::new(vec![record("/Dev/a", "R1"), record("/Dev/b", "R1")]).unwrap();
        let findings = vec![PolicyFinding {
            resource_path: "/Dev/a".parse().unwrap(),
            rule_id: "R1".to_string(),
            severity: Severity::High,
            message: "x".to_string(),
        }];
        let unused = ledger.unused(&findings);
        assert_eq!(unused.len(), 1);
        assert_eq!(unused[0].resource_path.to_string(), "/Dev/b");
    }
}
