//! SurrealDB-backed `ParameterStore` and `RunLedger`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::storage_traits::{
    ContentDigest, ParameterKey, ParameterStore, RunEvent, RunId, RunLedger, RunMetadata,
    RunRecord, RunStatus, RunSummary, StorageResult,
};
use crate::SurrealHandle;

/// SurrealDB-backed implementation of [`ParameterStore`].
#[derive(Clone)]
pub struct SurrealParameterStore {
    handle: Arc<SurrealHandle>,
}

impl SurrealParameterStore {
    pub fn new(handle: Arc<SurrealHandle>) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl ParameterStore for SurrealParameterStore {
    async fn get(&self, key: &ParameterKey) -> StorageResult<Option<String>> {
        self.handle.parameter_get(key).await
    }

    async fn put(&self, key: &ParameterKey, value: &str) -> StorageResult<()> {
        self.handle.parameter_put(key, value).await
    }
}

/// SurrealDB-backed implementation of [`RunLedger`].
#[derive(Clone)]
pub struct SurrealRunLedger {
    handle: Arc<SurrealHandle>,
}

impl SurrealRunLedger {
    pub fn new(handle: Arc<SurrealHandle>) -> Self {
        Self { handle }
    }

    async fn fetch_running(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        let record = self.handle.run_get(run_id).await?;
        if record.status.is_terminal() {
            return Err(StorageError::InvalidRunState {
                run_id: run_id.0.clone(),
                status: format!("{:?}", record.status),
                expected: "Running".to_string(),
            });
        }
        Ok(record)
    }

    async fn finish(
        &self,
        run_id: &RunId,
        status: RunStatus,
        summary: RunSummary,
    ) -> StorageResult<()> {
        let mut record = self.fetch_running(run_id).await?;
        record.status = status;
        record.summary = Some(summary);
        record.completed_at = Some(Utc::now());
        self.handle.run_put(&record).await
    }
}

#[async_trait]
impl RunLedger for SurrealRunLedger {
    async fn create_run(
        &self,
        spec_digest: &ContentDigest,
        metadata: RunMetadata,
    ) -> StorageResult<RunId> {
        let record = RunRecord {
            run_id: RunId::new(),
            spec_digest: spec_digest.clone(),
            metadata,
            status: RunStatus::Running,
            summary: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        self.handle.run_put(&record).await?;
        Ok(record.run_id)
    }

    async fn append_event(&self, run_id: &RunId, event: RunEvent) -> StorageResult<()> {
        self.fetch_running(run_id).await?;
        self.handle.run_event_append(run_id, &event).await
    }

    async fn complete_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.finish(run_id, RunStatus::Completed, summary).await
    }

    async fn fail_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.finish(run_id, RunStatus::Failed, summary).await
    }

    async fn cancel_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.finish(run_id, RunStatus::Cancelled, summary).await
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        self.handle.run_get(run_id).await
    }

    async fn get_events(&self, run_id: &RunId) -> StorageResult<Vec<RunEvent>> {
        self.handle.run_get(run_id).await?;
        self.handle.run_events(run_id).await
    }
}
