//! Service descriptors, artifact references and derived step identifiers.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::error::{Result, ShipyardError};

/// Maximum number of revision characters used in an image tag.
pub const IMAGE_TAG_LEN: usize = 12;

/// One deliverable container service.
///
/// Created once at configuration load and never mutated; every downstream
/// component keys on `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub source_path: PathBuf,
    pub dockerfile_path: PathBuf,
    pub build_context_path: PathBuf,
    /// Name of the registry repository holding this service's images.
    pub registry_identity: String,
}

impl ServiceDescriptor {
    /// Deterministic step identifiers for this service.
    pub fn step_ids(&self) -> ServiceStepIds {
        ServiceStepIds::derive(&self.name)
    }
}

/// Pointer to a built image plus its source provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactReference {
    pub service_name: String,
    pub image_tag: String,
    pub source_revision: String,
}

impl ArtifactReference {
    /// Reference for `service` built from `revision`; the tag is derived
    /// from the revision.
    pub fn for_revision(service: &str, revision: &str) -> Result<Self> {
        Ok(Self {
            service_name: service.to_string(),
            image_tag: tag_for_revision(revision)?,
            source_revision: revision.to_string(),
        })
    }
}

/// Image tag for a source revision: its first [`IMAGE_TAG_LEN`] characters.
pub fn tag_for_revision(revision: &str) -> Result<String> {
    let revision = revision.trim();
    let valid = !revision.is_empty()
        && revision
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !valid {
        return Err(ShipyardError::InvalidRevision {
            revision: revision.to_string(),
        });
    }
    Ok(revision.chars().take(IMAGE_TAG_LEN).collect())
}

/// Identifier of a pipeline step, stable across runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Step kinds known to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Build,
    CodeScan,
    RegistryScan,
    FunctionalTest,
    PolicyCheck,
    ManualApproval,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Build => "build",
            StepKind::CodeScan => "code_scan",
            StepKind::RegistryScan => "registry_scan",
            StepKind::FunctionalTest => "functional_test",
            StepKind::PolicyCheck => "policy_check",
            StepKind::ManualApproval => "manual_approval",
        }
    }
}

/// Id of the single policy check step.
pub const POLICY_CHECK_STEP: &str = "policy-check";

/// Id of the approval step gating an environment.
pub fn approval_step_id(environment: &str) -> StepId {
    StepId::new(format!("approve-{environment}"))
}

/// Per-service step identifiers, computed once from the service name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStepIds {
    pub build: StepId,
    pub code_scan: StepId,
    pub registry_scan: StepId,
    pub test: StepId,
}

impl ServiceStepIds {
    pub fn derive(service: &str) -> Self {
        Self {
            build: StepId::new(format!("{service}-build")),
            code_scan: StepId::new(format!("{service}-code-scan")),
            registry_scan: StepId::new(format!("{service}-registry-scan")),
            test: StepId::new(format!("{service}-test")),
        }
    }

    pub fn all(&self) -> [&StepId; 4] {
        [&self.build, &self.code_scan, &self.registry_scan, &self.test]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_is_revision_prefix() {
        assert_eq!(
            tag_for_revision("0123456789abcdef0123").unwrap(),
            "0123456789ab"
        );
        assert_eq!(tag_for_revision("v1.2").unwrap(), "v1.2");
    }

    #[test]
    fn tag_rejects_unsafe_revisions() {
        assert!(tag_for_revision("").is_err());
        assert!(tag_for_revision("   ").is_err());
        assert!(tag_for_revision("abc def").is_err());
        assert!(tag_for_revision("feature/x").is_err());
    }

    #[test]
    fn step_ids_are_deterministic() {
        let a = ServiceStepIds::derive("app1");
        let b = ServiceStepIds::derive("app1");
        assert_eq!(a, b);
        assert_eq!(a.build.as_str(), "app1-build");
        assert_eq!(a.code_scan.as_str(), "app1-code-scan");
        assert_eq!(a.registry_scan.as_str(), "app1-registry-scan");
        assert_eq!(a.test.as_str(), "app1-test");
        assert_eq!(approval_step_id("production").as_str(), "approve-production");
    }
}
