//! In-memory implementations of the storage traits
//!
//! Provides `MemoryParameterStore`, `MemoryImageRegistry`, and `MemoryRunLedger`
//! that satisfy the trait contracts without any external dependencies.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryParameterStore
// ---------------------------------------------------------------------------

/// In-memory parameter store backed by a `HashMap<key, value>`.
#[derive(Debug, Default)]
pub struct MemoryParameterStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sorted copy of every entry, keyed by the rendered parameter key.
    pub fn entries(&self) -> BTreeMap<String, String> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[async_trait]
impl ParameterStore for MemoryParameterStore {
    async fn get(&self, key: &ParameterKey) -> StorageResult<Option<String>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.get(&key.to_string()).cloned())
    }

    async fn put(&self, key: &ParameterKey, value: &str) -> StorageResult<()> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryImageRegistry
// ---------------------------------------------------------------------------

const MEMORY_REGISTRY_HOST: &str = "registry.memory.local";

/// In-memory registry: repositories map to the tags pushed into them.
///
/// Scan findings are scripted per image reference with [`set_findings`];
/// pushes into a repository can be made to fail with [`reject_pushes_to`].
///
/// [`set_findings`]: MemoryImageRegistry::set_findings
/// [`reject_pushes_to`]: MemoryImageRegistry::reject_pushes_to
#[derive(Debug, Default)]
pub struct MemoryImageRegistry {
    repositories: Mutex<HashMap<String, Vec<String>>>,
    findings: Mutex<HashMap<String, Vec<Finding>>>,
    rejected: Mutex<HashSet<String>>,
}

impl MemoryImageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the findings returned by `scan` for `reference`.
    pub fn set_findings(&self, reference: &ImageReference, findings: Vec<Finding>) {
        let mut all = self.findings.lock().unwrap();
        all.insert(reference.to_string(), findings);
    }

    /// Make every subsequent push into `repository` fail.
    pub fn reject_pushes_to(&self, repository: &str) {
        let mut rejected = self.rejected.lock().unwrap();
        rejected.insert(repository.to_string());
    }

    /// Tags pushed into `repository`, oldest first.
    pub fn tags(&self, repository: &str) -> Vec<String> {
        let repositories = self.repositories.lock().unwrap();
        repositories.get(repository).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl ImageRegistry for MemoryImageRegistry {
    async fn create_repository(&self, name: &str) -> StorageResult<String> {
        let mut repositories = self.repositories.lock().unwrap();
        repositories.entry(name.to_string()).or_default();
        Ok(format!("{MEMORY_REGISTRY_HOST}/{name}"))
    }

    async fn push(
        &self,
        repository: &str,
        _local_image: &str,
        tag: &str,
    ) -> StorageResult<ImageReference> {
        if self.rejected.lock().unwrap().contains(repository) {
            return Err(StorageError::Registry(format!(
                "push to {repository} rejected"
            )));
        }
        let mut repositories = self.repositories.lock().unwrap();
        let tags = repositories
            .get_mut(repository)
            .ok_or_else(|| StorageError::RepositoryNotFound {
                name: repository.to_string(),
            })?;
        if !tags.iter().any(|t| t == tag) {
            tags.push(tag.to_string());
        }
        Ok(ImageReference::new(repository, tag))
    }

    async fn scan(&self, reference: &ImageReference) -> StorageResult<Vec<Finding>> {
        let known = {
            let repositories = self.repositories.lock().unwrap();
            repositories
                .get(&reference.repository)
                .map(|tags| tags.iter().any(|t| *t == reference.tag))
                .unwrap_or(false)
        };
        if !known {
            return Err(StorageError::ImageNotFound {
                reference: reference.to_string(),
            });
        }
        let findings = self.findings.lock().unwrap();
        Ok(findings
            .get(&reference.to_string())
            .cloned()
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// MemoryRunLedger
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct RunState {
    record: RunRecord,
    events: Vec<RunEvent>,
}

/// In-memory run ledger backed by a `HashMap<RunId, RunState>`.
#[derive(Debug, Default)]
pub struct MemoryRunLedger {
    runs: Mutex<HashMap<String, RunState>>,
}

impl MemoryRunLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn finish(
        &self,
        run_id: &RunId,
        status: RunStatus,
        summary: RunSummary,
    ) -> StorageResult<()> {
        let mut runs = self.runs.lock().unwrap();
        let state = runs
            .get_mut(&run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        ensure_running(run_id, &state.record.status)?;
        state.record.status = status;
        state.record.summary = Some(summary);
        state.record.completed_at = Some(Utc::now());
        Ok(())
    }
}

fn ensure_running(run_id: &RunId, status: &RunStatus) -> StorageResult<()> {
    if status.is_terminal() {
        return Err(StorageError::InvalidRunState {
            run_id: run_id.0.clone(),
            status: format!("{:?}", status),
            expected: "Running".to_string(),
        });
    }
    Ok(())
}

#[async_trait]
impl RunLedger for MemoryRunLedger {
    async fn create_run(
        &self,
        spec_digest: &ContentDigest,
        metadata: RunMetadata,
    ) -> StorageResult<RunId> {
        let run_id = RunId::new();
        let record = RunRecord {
            run_id: run_id.clone(),
            spec_digest: spec_digest.clone(),
            metadata,
            status: RunStatus::Running,
            summary: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        let mut runs = self.runs.lock().unwrap();
        runs.insert(
            run_id.0.clone(),
            RunState {
                record,
                events: Vec::new(),
            },
        );
        Ok(run_id)
    }

    async fn append_event(&self, run_id: &RunId, event: RunEvent) -> StorageResult<()> {
        let mut runs = self.runs.lock().unwrap();
        let state = runs
            .get_mut(&run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        ensure_running(run_id, &state.record.status)?;
        state.events.push(event);
        Ok(())
    }

    async fn complete_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.finish(run_id, RunStatus::Completed, summary)
    }

    async fn fail_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.finish(run_id, RunStatus::Failed, summary)
    }

    async fn cancel_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.finish(run_id, RunStatus::Cancelled, summary)
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        let runs = self.runs.lock().unwrap();
        runs.get(&run_id.0)
            .map(|s| s.record.clone())
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })
    }

    async fn get_events(&self, run_id: &RunId) -> StorageResult<Vec<RunEvent>> {
        let runs = self.runs.lock().unwrap();
        let state = runs
            .get(&run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        let mut events = state.events.clone();
        events.sort_by_key(|e| e.seq);
        Ok(events)
    }
}
