//! Manual approval gate.
//!
//! The step announces that its run is waiting, then suspends until an
//! [`ApprovalSource`] delivers a decision for that run. Without a configured
//! `approval_timeout_secs` it waits indefinitely; cancelling the run always
//! releases it and reports the step as cancelled, not rejected. A decision
//! only counts for the run it names, so a stale approval from an earlier run
//! never releases a later one.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipyard_core::{approval_step_id, StepId, StepKind};
use shipyard_state::{ParameterKey, ParameterStore};
use tokio::sync::watch;
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::step::{ExecutionContext, FailureKind, Step, StepOutcome};

pub const APPROVAL_NAMESPACE: &str = "approval";
const PENDING_PREFIX: &str = "pending:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalVerdict {
    Approved,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub run_id: String,
    pub decision: ApprovalVerdict,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub approver: Option<String>,
    pub decided_at: DateTime<Utc>,
}

/// Where approval decisions come from.
#[async_trait]
pub trait ApprovalSource: Send + Sync {
    /// Record that `step` of run `run_id` is waiting for a decision.
    async fn request(&self, pipeline: &str, step: &StepId, run_id: &str) -> Result<()>;

    /// Resolve once a decision for `run_id` exists.
    async fn wait(&self, pipeline: &str, step: &StepId, run_id: &str) -> Result<ApprovalDecision>;
}

// ---------------------------------------------------------------------------
// Store-backed approvals (`shipyard approve`)
// ---------------------------------------------------------------------------

/// Approvals exchanged through the persisted store under
/// `approval/{pipeline}/{step}`: `pending:{run_id}` while waiting, then the
/// JSON decision.
pub struct StoreApproval {
    store: Arc<dyn ParameterStore>,
    poll: Duration,
}

impl StoreApproval {
    pub fn new(store: Arc<dyn ParameterStore>, poll: Duration) -> Self {
        Self { store, poll }
    }

    pub fn key(pipeline: &str, step: &StepId) -> Result<ParameterKey> {
        Ok(ParameterKey::new(APPROVAL_NAMESPACE, pipeline, step.as_str())?)
    }

    /// Run id waiting on `step`, if any.
    pub async fn pending_run(
        store: &dyn ParameterStore,
        pipeline: &str,
        step: &StepId,
    ) -> Result<Option<String>> {
        let value = store.get(&Self::key(pipeline, step)?).await?;
        Ok(value.and_then(|v| v.strip_prefix(PENDING_PREFIX).map(str::to_string)))
    }

    /// Decide the pending approval of `step`. Fails when nothing is pending.
    pub async fn decide(
        store: &dyn ParameterStore,
        pipeline: &str,
        step: &StepId,
        decision: ApprovalVerdict,
        reason: Option<String>,
        approver: Option<String>,
    ) -> Result<ApprovalDecision> {
        let run_id = Self::pending_run(store, pipeline, step)
            .await?
            .ok_or_else(|| {
                PipelineError::InvalidApproval(format!("no approval pending for {pipeline}/{step}"))
            })?;
        let decision = ApprovalDecision {
            run_id,
            decision,
            reason,
            approver,
            decided_at: Utc::now(),
        };
        store
            .put(&Self::key(pipeline, step)?, &serde_json::to_string(&decision)?)
            .await?;
        Ok(decision)
    }
}

#[async_trait]
impl ApprovalSource for StoreApproval {
    async fn request(&self, pipeline: &str, step: &StepId, run_id: &str) -> Result<()> {
        let key = Self::key(pipeline, step)?;
        self.store
            .put(&key, &format!("{PENDING_PREFIX}{run_id}"))
            .await?;
        Ok(())
    }

    async fn wait(&self, pipeline: &str, step: &StepId, run_id: &str) -> Result<ApprovalDecision> {
        let key = Self::key(pipeline, step)?;
        loop {
            if let Some(value) = self.store.get(&key).await? {
                if !value.starts_with(PENDING_PREFIX) {
                    // anything else under the key must be a decision
                    let decision: ApprovalDecision = serde_json::from_str(&value)
                        .map_err(|e| PipelineError::InvalidApproval(format!("{key}: {e}")))?;
                    if decision.run_id == run_id {
                        return Ok(decision);
                    }
                }
            }
            tokio::time::sleep(self.poll).await;
        }
    }
}

// ---------------------------------------------------------------------------
// In-process approvals
// ---------------------------------------------------------------------------

/// Approvals delivered in-process, for embedding and tests.
pub struct ChannelApproval {
    pending: watch::Sender<BTreeMap<StepId, String>>,
    decisions: watch::Sender<BTreeMap<StepId, ApprovalDecision>>,
}

impl Default for ChannelApproval {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelApproval {
    pub fn new() -> Self {
        Self {
            pending: watch::Sender::new(BTreeMap::new()),
            decisions: watch::Sender::new(BTreeMap::new()),
        }
    }

    /// Resolve once `step` is waiting; returns the waiting run id.
    pub async fn wait_pending(&self, step: &StepId) -> String {
        let mut rx = self.pending.subscribe();
        loop {
            if let Some(run_id) = rx.borrow_and_update().get(step).cloned() {
                return run_id;
            }
            if rx.changed().await.is_err() {
                return String::new();
            }
        }
    }

    pub fn decide(
        &self,
        step: &StepId,
        decision: ApprovalVerdict,
        reason: Option<String>,
        approver: Option<String>,
    ) -> Result<ApprovalDecision> {
        let run_id = self.pending.borrow().get(step).cloned().ok_or_else(|| {
            PipelineError::InvalidApproval(format!("no approval pending for {step}"))
        })?;
        let decision = ApprovalDecision {
            run_id,
            decision,
            reason,
            approver,
            decided_at: Utc::now(),
        };
        self.decisions.send_modify(|all| {
            all.insert(step.clone(), decision.clone());
        });
        Ok(decision)
    }
}

#[async_trait]
impl ApprovalSource for ChannelApproval {
    async fn request(&self, _pipeline: &str, step: &StepId, run_id: &str) -> Result<()> {
        self.pending.send_modify(|all| {
            all.insert(step.clone(), run_id.to_string());
        });
        Ok(())
    }

    async fn wait(&self, _pipeline: &str, step: &StepId, run_id: &str) -> Result<ApprovalDecision> {
        let mut rx = self.decisions.subscribe();
        loop {
            let found = rx
                .borrow_and_update()
                .get(step)
                .filter(|d| d.run_id == run_id)
                .cloned();
            if let Some(decision) = found {
                return Ok(decision);
            }
            rx.changed()
                .await
                .map_err(|_| PipelineError::InvalidApproval("approval channel closed".into()))?;
        }
    }
}

// ---------------------------------------------------------------------------
// The step
// ---------------------------------------------------------------------------

/// Manual approval gating the deployment of `environment`.
pub struct ApprovalStep {
    id: StepId,
    environment: String,
}

impl ApprovalStep {
    pub fn new(environment: &str) -> Self {
        Self {
            id: approval_step_id(environment),
            environment: environment.to_string(),
        }
    }
}

#[async_trait]
impl Step for ApprovalStep {
    fn id(&self) -> &StepId {
        &self.id
    }

    fn kind(&self) -> StepKind {
        StepKind::ManualApproval
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<StepOutcome> {
        let pipeline = ctx.pipeline_name();
        ctx.approvals.request(pipeline, &self.id, &ctx.run_id).await?;
        info!(
            step = %self.id,
            environment = %self.environment,
            "waiting for approval: shipyard approve {pipeline} {}",
            self.id
        );

        let timeout = ctx.config.pipeline.approval_timeout_secs;
        let expiry = async {
            match timeout {
                Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            decision = ctx.approvals.wait(pipeline, &self.id, &ctx.run_id) => {
                let decision = decision?;
                let who = decision.approver.as_deref().unwrap_or("unknown");
                Ok(match decision.decision {
                    ApprovalVerdict::Approved => StepOutcome::passed(format!(
                        "{} approved by {who}",
                        self.environment
                    )),
                    ApprovalVerdict::Rejected => StepOutcome::failed(
                        FailureKind::ApprovalRejected,
                        format!(
                            "rejected by {who}: {}",
                            decision.reason.as_deref().unwrap_or("no reason given")
                        ),
                    ),
                })
            }
            _ = ctx.cancel.cancelled() => Ok(StepOutcome::failed(
                FailureKind::Cancelled,
                "run cancelled while waiting for approval",
            )),
            _ = expiry => Ok(StepOutcome::failed(
                FailureKind::ApprovalExpired,
                format!("no decision within {}s", timeout.unwrap_or_default()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipyard_state::fakes::MemoryParameterStore;

    #[tokio::test]
    async fn store_decision_must_name_the_waiting_run() {
        let store: Arc<dyn ParameterStore> = Arc::new(MemoryParameterStore::new());
        let approvals = StoreApproval::new(store.clone(), Duration::from_millis(10));
        let step = approval_step_id("production");

        assert!(StoreApproval::decide(
            store.as_ref(),
            "delivery",
            &step,
            ApprovalVerdict::Approved,
            None,
            None
        )
        .await
        .is_err());

        approvals.request("delivery", &step, "run-1").await.unwrap();
        assert_eq!(
            StoreApproval::pending_run(store.as_ref(), "delivery", &step)
                .await
                .unwrap()
                .as_deref(),
            Some("run-1")
        );

        let decided = StoreApproval::decide(
            store.as_ref(),
            "delivery",
            &step,
            ApprovalVerdict::Approved,
            None,
            Some("ops".to_string()),
        )
        .await
        .unwrap();
        assert_eq!(decided.run_id, "run-1");

        let decision = approvals.wait("delivery", &step, "run-1").await.unwrap();
        assert_eq!(decision.decision, ApprovalVerdict::Approved);

        // a later run does not see the earlier decision
        let stale = tokio::time::timeout(
            Duration::from_millis(50),
            approvals.wait("delivery", &step, "run-2"),
        )
        .await;
        assert!(stale.is_err());
    }

    #[tokio::test]
    async fn channel_decision_releases_waiter() {
        let approvals = Arc::new(ChannelApproval::new());
        let step = approval_step_id("production");

        let waiter = {
            let approvals = approvals.clone();
            let step = step.clone();
            tokio::spawn(async move {
                approvals.request("delivery", &step, "run-9").await.unwrap();
                approvals.wait("delivery", &step, "run-9").await
            })
        };

        assert_eq!(approvals.wait_pending(&step).await, "run-9");
        approvals
            .decide(
                &step,
                ApprovalVerdict::Rejected,
                Some("change freeze".to_string()),
                None,
            )
            .unwrap();

        let decision = waiter.await.unwrap().unwrap();
        assert_eq!(decision.decision, ApprovalVerdict::Rejected);
        assert_eq!(decision.reason.as_deref(), Some("change freeze"));
    }
}
