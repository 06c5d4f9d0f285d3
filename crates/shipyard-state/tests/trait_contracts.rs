//! Trait contract tests for ParameterStore, ImageRegistry, and RunLedger.
//!
//! The same behavioral contract is checked against the in-memory fakes and,
//! where a SurrealDB implementation exists, against an in-memory SurrealDB.

use std::sync::Arc;

use chrono::Utc;
use shipyard_state::fakes::{MemoryImageRegistry, MemoryParameterStore, MemoryRunLedger};
use shipyard_state::storage_traits::*;
use shipyard_state::{
    is_in_memory, StorageError, SurrealHandle, SurrealParameterStore, SurrealRunLedger,
};

fn key(scope: &str, attribute: &str) -> ParameterKey {
    ParameterKey::new("registry", scope, attribute).unwrap()
}

fn meta() -> RunMetadata {
    RunMetadata {
        pipeline_name: "delivery".to_string(),
        source_revision: Some("0123456789abcdef".to_string()),
        tags: serde_json::json!({"mode": "normal"}),
    }
}

fn event(seq: u64, kind: &str) -> RunEvent {
    RunEvent {
        seq,
        kind: kind.to_string(),
        payload: serde_json::json!({"seq": seq}),
        timestamp: Utc::now(),
    }
}

fn summary(success: bool) -> RunSummary {
    RunSummary {
        total_events: 2,
        duration_ms: 10,
        success,
    }
}

// ===========================================================================
// ParameterStore contract
// ===========================================================================

async fn parameter_store_contract(store: &dyn ParameterStore) {
    let tag = key("app1", "imageTag");
    assert_eq!(store.get(&tag).await.unwrap(), None);

    store.put(&tag, "abc123").await.unwrap();
    assert_eq!(store.get(&tag).await.unwrap().as_deref(), Some("abc123"));

    // last write wins
    store.put(&tag, "def456").await.unwrap();
    assert_eq!(store.get(&tag).await.unwrap().as_deref(), Some("def456"));

    // scopes are independent
    assert_eq!(store.get(&key("app2", "imageTag")).await.unwrap(), None);
}

#[tokio::test]
async fn memory_parameter_store_contract() {
    let store = MemoryParameterStore::new();
    parameter_store_contract(&store).await;
    assert_eq!(
        store.entries().get("registry/app1/imageTag").map(String::as_str),
        Some("def456")
    );
}

#[tokio::test]
async fn surreal_parameter_store_contract() {
    let handle = Arc::new(SurrealHandle::setup_db().await.unwrap());
    let store = SurrealParameterStore::new(handle);
    parameter_store_contract(&store).await;
}

#[tokio::test]
async fn surreal_parameter_store_visible_across_instances() {
    let handle = Arc::new(SurrealHandle::setup_db().await.unwrap());
    let writer = SurrealParameterStore::new(handle.clone());
    let reader = SurrealParameterStore::new(handle);

    writer.put(&key("app1", "repositoryUri"), "r/app1").await.unwrap();
    assert_eq!(
        reader.get(&key("app1", "repositoryUri")).await.unwrap().as_deref(),
        Some("r/app1")
    );
}

#[tokio::test]
async fn persistent_connection_refuses_in_memory_urls() {
    assert!(is_in_memory("mem://"));
    assert!(is_in_memory("memory"));
    assert!(!is_in_memory("surrealkv://.shipyard/state"));

    let err = SurrealHandle::connect_persistent("mem://").await.err().unwrap();
    assert!(matches!(err, StorageError::Connection(_)));
    assert!(err.to_string().contains("SURREALDB_URL"));
}

#[tokio::test]
async fn persistent_connection_creates_local_state_directory() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state");
    let url = format!("surrealkv://{}", path.display());

    let handle = Arc::new(SurrealHandle::connect_persistent(&url).await.unwrap());
    assert!(path.is_dir());
    let store = SurrealParameterStore::new(handle);
    parameter_store_contract(&store).await;
}

// ===========================================================================
// ImageRegistry contract (memory)
// ===========================================================================

#[tokio::test]
async fn registry_push_requires_repository() {
    let registry = MemoryImageRegistry::new();
    let err = registry.push("app1", "app1:local", "abc").await.unwrap_err();
    assert!(matches!(err, StorageError::RepositoryNotFound { .. }));
}

#[tokio::test]
async fn registry_push_then_scan_returns_scripted_findings() {
    let registry = MemoryImageRegistry::new();
    let uri = registry.create_repository("app1").await.unwrap();
    assert!(uri.ends_with("/app1"));

    let reference = registry.push("app1", "app1:local", "abc").await.unwrap();
    assert_eq!(reference, ImageReference::new("app1", "abc"));
    assert!(registry.scan(&reference).await.unwrap().is_empty());

    registry.set_findings(
        &reference,
        vec![Finding {
            rule_id: "CVE-2024-0001".to_string(),
            severity: Severity::High,
            description: "openssl".to_string(),
        }],
    );
    let findings = registry.scan(&reference).await.unwrap();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].severity, Severity::High);
}

#[tokio::test]
async fn registry_scan_unknown_image_fails() {
    let registry = MemoryImageRegistry::new();
    registry.create_repository("app1").await.unwrap();
    let err = registry
        .scan(&ImageReference::new("app1", "missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::ImageNotFound { .. }));
}

#[tokio::test]
async fn registry_rejected_push_fails_without_recording_tag() {
    let registry = MemoryImageRegistry::new();
    registry.create_repository("app1").await.unwrap();
    registry.reject_pushes_to("app1");
    assert!(registry.push("app1", "app1:local", "abc").await.is_err());
    assert!(registry.tags("app1").is_empty());
}

// ===========================================================================
// RunLedger contract
// ===========================================================================

async fn run_ledger_contract(ledger: &dyn RunLedger) {
    let digest = ContentDigest::from_bytes(b"pipeline");
    let run_id = ledger.create_run(&digest, meta()).await.unwrap();

    let record = ledger.get_run(&run_id).await.unwrap();
    assert_eq!(record.status, RunStatus::Running);
    assert_eq!(record.spec_digest, digest);
    assert_eq!(record.metadata.pipeline_name, "delivery");

    ledger
        .append_event(&run_id, event(1, "pipeline_started"))
        .await
        .unwrap();
    ledger
        .append_event(&run_id, event(2, "wave_started"))
        .await
        .unwrap();

    let events = ledger.get_events(&run_id).await.unwrap();
    let kinds: Vec<&str> = events.iter().map(|e| e.kind.as_str()).collect();
    assert_eq!(kinds, vec!["pipeline_started", "wave_started"]);

    ledger.complete_run(&run_id, summary(true)).await.unwrap();
    let record = ledger.get_run(&run_id).await.unwrap();
    assert_eq!(record.status, RunStatus::Completed);
    assert!(record.summary.unwrap().success);
    assert!(record.completed_at.is_some());

    // terminal runs are immutable
    let err = ledger
        .append_event(&run_id, event(3, "late"))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidRunState { .. }));
    assert!(ledger.fail_run(&run_id, summary(false)).await.is_err());
}

async fn run_ledger_unknown_run(ledger: &dyn RunLedger) {
    let missing = RunId::new();
    assert!(matches!(
        ledger.get_run(&missing).await.unwrap_err(),
        StorageError::RunNotFound { .. }
    ));
    assert!(ledger.get_events(&missing).await.is_err());
    assert!(ledger.cancel_run(&missing, summary(false)).await.is_err());
}

#[tokio::test]
async fn memory_run_ledger_contract() {
    let ledger = MemoryRunLedger::new();
    run_ledger_contract(&ledger).await;
    run_ledger_unknown_run(&ledger).await;
}

#[tokio::test]
async fn surreal_run_ledger_contract() {
    let handle = Arc::new(SurrealHandle::setup_db().await.unwrap());
    let ledger = SurrealRunLedger::new(handle);
    run_ledger_contract(&ledger).await;
    run_ledger_unknown_run(&ledger).await;
}

#[tokio::test]
async fn memory_run_ledger_orders_events_by_seq() {
    let ledger = MemoryRunLedger::new();
    let run_id = ledger
        .create_run(&ContentDigest::from_bytes(b"p"), meta())
        .await
        .unwrap();
    ledger.append_event(&run_id, event(2, "b")).await.unwrap();
    ledger.append_event(&run_id, event(1, "a")).await.unwrap();

    let seqs: Vec<u64> = ledger
        .get_events(&run_id)
        .await
        .unwrap()
        .iter()
        .map(|e| e.seq)
        .collect();
    assert_eq!(seqs, vec![1, 2]);
}

#[tokio::test]
async fn cancelled_run_is_terminal() {
    let ledger = MemoryRunLedger::new();
    let run_id = ledger
        .create_run(&ContentDigest::from_bytes(b"p"), meta())
        .await
        .unwrap();
    ledger.cancel_run(&run_id, summary(false)).await.unwrap();
    assert_eq!(
        ledger.get_run(&run_id).await.unwrap().status,
        RunStatus::Cancelled
    );
    assert!(ledger.complete_run(&run_id, summary(true)).await.is_err());
}
