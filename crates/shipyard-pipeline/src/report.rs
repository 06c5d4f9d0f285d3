//! Run reports.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use shipyard_core::DeploymentReport;

use crate::step::FailureKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Passed,
    Failed,
    Cancelled,
    /// Never started because an earlier wave did not pass.
    Skipped,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Passed => "passed",
            Status::Failed => "failed",
            Status::Cancelled => "cancelled",
            Status::Skipped => "skipped",
        }
    }
}

/// Result of one wave member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberReport {
    pub id: String,
    pub kind: String,
    pub status: Status,
    pub failure: Option<FailureKind>,
    pub detail: String,
    #[serde(default)]
    pub rolled_back: bool,
    pub duration_ms: u64,
    #[serde(default)]
    pub deployments: Vec<DeploymentReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaveReport {
    pub name: String,
    pub status: Status,
    pub duration_ms: u64,
    pub members: Vec<MemberReport>,
}

/// Result of a complete pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub run_id: String,
    pub pipeline: String,
    pub source_revision: String,
    pub spec_digest: String,
    pub status: Status,
    pub waves: Vec<WaveReport>,
    pub duration_ms: u64,
}

impl PipelineReport {
    pub fn success(&self) -> bool {
        self.status == Status::Passed
    }

    pub fn wave(&self, name: &str) -> Option<&WaveReport> {
        self.waves.iter().find(|w| w.name == name)
    }

    pub fn member(&self, id: &str) -> Option<&MemberReport> {
        self.waves
            .iter()
            .flat_map(|w| w.members.iter())
            .find(|m| m.id == id)
    }

    pub fn failed_members(&self) -> Vec<&MemberReport> {
        self.waves
            .iter()
            .flat_map(|w| w.members.iter())
            .filter(|m| m.status == Status::Failed)
            .collect()
    }

    /// Plain-text summary for terminals.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "pipeline {} run {} ({}) {} in {}ms",
            self.pipeline,
            self.run_id,
            self.source_revision,
            self.status.as_str(),
            self.duration_ms
        );
        for wave in &self.waves {
            let _ = writeln!(out, "  {} [{}]", wave.name, wave.status.as_str());
            for member in &wave.members {
                let failure = member
                    .failure
                    .map(|k| format!(" {k}"))
                    .unwrap_or_default();
                let _ = writeln!(
                    out,
                    "    {:<28} {}{} {}",
                    member.id,
                    member.status.as_str(),
                    failure,
                    member.detail
                );
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: &str, status: Status) -> MemberReport {
        MemberReport {
            id: id.to_string(),
            kind: "build".to_string(),
            status,
            failure: (status == Status::Failed).then_some(FailureKind::BuildFailure),
            detail: "exit 1".to_string(),
            rolled_back: false,
            duration_ms: 3,
            deployments: Vec::new(),
        }
    }

    #[test]
    fn lists_failed_members_and_renders() {
        let report = PipelineReport {
            run_id: "r1".to_string(),
            pipeline: "delivery".to_string(),
            source_revision: "abc".to_string(),
            spec_digest: "d".repeat(64),
            status: Status::Failed,
            waves: vec![WaveReport {
                name: "BuildWave".to_string(),
                status: Status::Failed,
                duration_ms: 3,
                members: vec![member("app1-build", Status::Failed), member("app2-build", Status::Passed)],
            }],
            duration_ms: 4,
        };
        assert!(!report.success());
        let failed: Vec<&str> = report.failed_members().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(failed, vec!["app1-build"]);
        let text = report.render_text();
        assert!(text.contains("BuildWave [failed]"));
        assert!(text.contains("failed build_failure exit 1"));
    }
}
