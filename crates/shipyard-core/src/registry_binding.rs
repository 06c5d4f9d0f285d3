//! Artifact registry binding: persisted pointers from a service name to its
//! repository, its latest accepted image and the verifications it passed.
//!
//! Keys live under two namespaces of the parameter store:
//!
//! - `registry/{service}/repositoryUri`, `registry/{service}/imageTag`,
//!   `registry/{service}/lastBuiltRevision`
//! - `verification/{service}/{codeScan|registryScan|functionalTest}`, holding
//!   the image tag that passed the check
//!
//! The tag and revision are two independent writes. The tag is written
//! first, so a reader may briefly see a new tag with the previous revision;
//! the build step only skips when the stored tag is the one derived from the
//! recorded revision, so a mismatched pair triggers a rebuild.

use serde::{Deserialize, Serialize};
use shipyard_state::{ParameterKey, ParameterStore};
use tracing::debug;

use crate::domain::{ArtifactReference, Result};

pub const REGISTRY_NAMESPACE: &str = "registry";
pub const VERIFICATION_NAMESPACE: &str = "verification";

pub const IMAGE_TAG: &str = "imageTag";
pub const LAST_BUILT_REVISION: &str = "lastBuiltRevision";
pub const REPOSITORY_URI: &str = "repositoryUri";

/// Checks whose success is recorded against an image tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationKind {
    CodeScan,
    RegistryScan,
    FunctionalTest,
}

impl VerificationKind {
    pub const ALL: [VerificationKind; 3] = [
        VerificationKind::CodeScan,
        VerificationKind::RegistryScan,
        VerificationKind::FunctionalTest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationKind::CodeScan => "codeScan",
            VerificationKind::RegistryScan => "registryScan",
            VerificationKind::FunctionalTest => "functionalTest",
        }
    }
}

pub fn registry_key(service: &str, attribute: &str) -> Result<ParameterKey> {
    Ok(ParameterKey::new(REGISTRY_NAMESPACE, service, attribute)?)
}

fn verification_key(service: &str, kind: VerificationKind) -> Result<ParameterKey> {
    Ok(ParameterKey::new(
        VERIFICATION_NAMESPACE,
        service,
        kind.as_str(),
    )?)
}

/// Publish a freshly built artifact: `imageTag`, then `lastBuiltRevision`.
pub async fn record_artifact(store: &dyn ParameterStore, artifact: &ArtifactReference) -> Result<()> {
    let service = &artifact.service_name;
    store
        .put(&registry_key(service, IMAGE_TAG)?, &artifact.image_tag)
        .await?;
    store
        .put(
            &registry_key(service, LAST_BUILT_REVISION)?,
            &artifact.source_revision,
        )
        .await?;
    debug!(service = %service, tag = %artifact.image_tag, "artifact recorded");
    Ok(())
}

pub async fn image_tag(store: &dyn ParameterStore, service: &str) -> Result<Option<String>> {
    Ok(store.get(&registry_key(service, IMAGE_TAG)?).await?)
}

pub async fn last_built_revision(
    store: &dyn ParameterStore,
    service: &str,
) -> Result<Option<String>> {
    Ok(store.get(&registry_key(service, LAST_BUILT_REVISION)?).await?)
}

pub async fn record_repository_uri(
    store: &dyn ParameterStore,
    service: &str,
    uri: &str,
) -> Result<()> {
    store.put(&registry_key(service, REPOSITORY_URI)?, uri).await?;
    Ok(())
}

pub async fn repository_uri(store: &dyn ParameterStore, service: &str) -> Result<Option<String>> {
    Ok(store.get(&registry_key(service, REPOSITORY_URI)?).await?)
}

/// Record that `image_tag` of `service` passed `kind`.
pub async fn record_verification(
    store: &dyn ParameterStore,
    service: &str,
    kind: VerificationKind,
    image_tag: &str,
) -> Result<()> {
    store
        .put(&verification_key(service, kind)?, image_tag)
        .await?;
    Ok(())
}

/// Tag that most recently passed `kind`, if any.
pub async fn verified_tag(
    store: &dyn ParameterStore,
    service: &str,
    kind: VerificationKind,
) -> Result<Option<String>> {
    Ok(store.get(&verification_key(service, kind)?).await?)
}

/// Checks in `required` that `image_tag` has not passed.
pub async fn missing_verifications(
    store: &dyn ParameterStore,
    service: &str,
    image_tag: &str,
    required: &[VerificationKind],
) -> Result<Vec<VerificationKind>> {
    let mut missing = Vec::new();
    for kind in required {
        let verified = verified_tag(store, service, *kind).await?;
        if verified.as_deref() != Some(image_tag) {
            missing.push(*kind);
        }
    }
    Ok(missing)
}
