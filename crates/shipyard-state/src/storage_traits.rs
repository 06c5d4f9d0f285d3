//! Storage trait definitions for Shipyard
//!
//! These traits define the storage abstractions shared by every pipeline member:
//! - `ParameterStore`: persisted key-value store (last-write-wins, no CAS)
//! - `ImageRegistry`: container registry (create repository, push, scan)
//! - `RunLedger`: pipeline run persistence (events, summaries)
//!
//! All traits are async and backend-agnostic. In-memory implementations are
//! provided via the `fakes` module.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// ParameterStore — persisted key-value entries
// ---------------------------------------------------------------------------

/// Key of a persisted parameter: `{namespace}/{scope}/{attribute}`.
///
/// Scope is usually a service name (`registry/app1/imageTag`) so writers of
/// unrelated services never touch the same key. Segments are non-empty and
/// never contain `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ParameterKey {
    namespace: String,
    scope: String,
    attribute: String,
}

impl ParameterKey {
    /// Build a key from its three segments.
    pub fn new(namespace: &str, scope: &str, attribute: &str) -> StorageResult<Self> {
        for segment in [namespace, scope, attribute] {
            if segment.is_empty() || segment.contains('/') {
                return Err(StorageError::InvalidKey {
                    key: format!("{namespace}/{scope}/{attribute}"),
                });
            }
        }
        Ok(Self {
            namespace: namespace.to_string(),
            scope: scope.to_string(),
            attribute: attribute.to_string(),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn attribute(&self) -> &str {
        &self.attribute
    }
}

impl fmt::Display for ParameterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.scope, self.attribute)
    }
}

impl FromStr for ParameterKey {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [namespace, scope, attribute] => Self::new(namespace, scope, attribute),
            _ => Err(StorageError::InvalidKey { key: s.to_string() }),
        }
    }
}

impl TryFrom<String> for ParameterKey {
    type Error = StorageError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ParameterKey> for String {
    fn from(key: ParameterKey) -> Self {
        key.to_string()
    }
}

/// Persisted key-value store.
///
/// Guarantees:
/// - `get` returns the latest completed `put` for the key, or `None`.
/// - `put` is an unconditional overwrite; concurrent writers race and the
///   last one wins. There is no multi-key transaction and no compare-and-swap.
#[async_trait]
pub trait ParameterStore: Send + Sync {
    /// Read the latest value written under `key`.
    async fn get(&self, key: &ParameterKey) -> StorageResult<Option<String>>;

    /// Overwrite the value under `key`.
    async fn put(&self, key: &ParameterKey, value: &str) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// ImageRegistry — container registry contract
// ---------------------------------------------------------------------------

/// Pointer to a pushed image: `{repository}:{tag}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageReference {
    pub repository: String,
    pub tag: String,
}

impl ImageReference {
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

/// Finding severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Informational,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Informational => "INFORMATIONAL",
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INFORMATIONAL" | "INFO" => Ok(Severity::Informational),
            "LOW" => Ok(Severity::Low),
            "MEDIUM" => Ok(Severity::Medium),
            "HIGH" => Ok(Severity::High),
            "CRITICAL" => Ok(Severity::Critical),
            other => Err(StorageError::Serialization(format!(
                "unknown severity: {other}"
            ))),
        }
    }
}

/// A single registry scan finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub rule_id: String,
    pub severity: Severity,
    pub description: String,
}

/// Container registry.
///
/// Guarantees:
/// - `push` only succeeds into a repository created by `create_repository`.
/// - `scan` reports findings for an image previously pushed.
#[async_trait]
pub trait ImageRegistry: Send + Sync {
    /// Create (or look up) a repository by name and return its URI.
    async fn create_repository(&self, name: &str) -> StorageResult<String>;

    /// Push a locally built image into `repository` under `tag`.
    async fn push(
        &self,
        repository: &str,
        local_image: &str,
        tag: &str,
    ) -> StorageResult<ImageReference>;

    /// Scan a pushed image and return its findings.
    async fn scan(&self, reference: &ImageReference) -> StorageResult<Vec<Finding>>;
}

// ---------------------------------------------------------------------------
// RunLedger — pipeline run persistence
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new random RunId
    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Metadata attached to a run at creation time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Pipeline name
    pub pipeline_name: String,
    /// Source revision being delivered
    pub source_revision: Option<String>,
    /// Arbitrary key-value tags
    pub tags: serde_json::Value,
}

/// A single event in a pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    /// Monotonic sequence number within the run
    pub seq: u64,
    /// Event kind (e.g. "wave_started", "member_failed")
    pub kind: String,
    /// Event payload
    pub payload: serde_json::Value,
    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

/// Summary produced when a run reaches a terminal state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Total events recorded
    pub total_events: u64,
    /// Duration in milliseconds
    pub duration_ms: u64,
    /// Whether the run succeeded
    pub success: bool,
}

/// Status of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// Full run record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub spec_digest: ContentDigest,
    pub metadata: RunMetadata,
    pub status: RunStatus,
    pub summary: Option<RunSummary>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Pipeline run ledger.
///
/// Guarantees:
/// - Events are ordered by monotonic `seq` within a run.
/// - A run transitions: Running → Completed | Failed | Cancelled (terminal).
/// - Terminal runs are immutable.
#[async_trait]
pub trait RunLedger: Send + Sync {
    /// Create a new run, returning its unique ID.
    async fn create_run(
        &self,
        spec_digest: &ContentDigest,
        metadata: RunMetadata,
    ) -> StorageResult<RunId>;

    /// Append an event to an active run. Fails if the run is terminal.
    async fn append_event(&self, run_id: &RunId, event: RunEvent) -> StorageResult<()>;

    /// Mark a run as completed with a summary.
    async fn complete_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()>;

    /// Mark a run as failed with a summary.
    async fn fail_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()>;

    /// Mark a run as cancelled.
    async fn cancel_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()>;

    /// Retrieve a run record by ID.
    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord>;

    /// Retrieve all events for a run, ordered by seq.
    async fn get_events(&self, run_id: &RunId) -> StorageResult<Vec<RunEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_key_display_and_parse() {
        let key = ParameterKey::new("registry", "app1", "imageTag").unwrap();
        assert_eq!(key.to_string(), "registry/app1/imageTag");

        let parsed: ParameterKey = "registry/app1/imageTag".parse().unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn parameter_key_rejects_bad_shapes() {
        assert!("registry/app1".parse::<ParameterKey>().is_err());
        assert!("registry/app1/imageTag/extra".parse::<ParameterKey>().is_err());
        assert!("registry//imageTag".parse::<ParameterKey>().is_err());
        assert!(ParameterKey::new("registry", "a/b", "imageTag").is_err());
    }

    #[test]
    fn severity_orders_by_impact() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Low > Severity::Informational);
        assert_eq!("high".parse::<Severity>().unwrap(), Severity::High);
        assert!("urgent".parse::<Severity>().is_err());
    }

    #[test]
    fn image_reference_display() {
        let reference = ImageReference::new("app1-repo", "abc123");
        assert_eq!(reference.to_string(), "app1-repo:abc123");
    }

    #[test]
    fn content_digest_rejects_non_hex() {
        assert!(ContentDigest::try_from("xyz".to_string()).is_err());
        let digest = ContentDigest::from_bytes(b"graph");
        assert_eq!(digest.as_str().len(), 64);
        assert_eq!(digest.short().len(), 12);
    }
}
