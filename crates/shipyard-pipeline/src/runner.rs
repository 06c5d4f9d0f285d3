//! Wave runner: executes a pipeline and records the run.
//!
//! Waves run strictly in order. The members of a wave are spawned together
//! and the runner waits for every one of them to reach a terminal outcome
//! before deciding the wave. The first wave that does not pass halts the
//! run; later waves are recorded as skipped and never start.
//!
//! Cancelling the context's token aborts the in-flight members of the
//! current wave. Effects of completed waves are left in place.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::FutureExt;
use serde_json::{json, Value};
use shipyard_core::obs;
use shipyard_state::{RunEvent, RunId, RunLedger, RunMetadata, RunSummary};
use tokio::task::JoinSet;
use tracing::{info, warn, Instrument, Span};

use crate::error::Result;
use crate::pipeline::{Pipeline, Wave};
use crate::report::{MemberReport, PipelineReport, Status, WaveReport};
use crate::spec::PipelineSpec;
use crate::stage::StageOutcome;
use crate::step::{ExecutionContext, FailureKind, StepOutcome};

/// Appends events to the run ledger with a monotonically increasing `seq`.
/// A ledger that refuses an event is logged, never fatal to the run.
struct Recorder {
    ledger: Arc<dyn RunLedger>,
    run_id: RunId,
    seq: u64,
}

impl Recorder {
    async fn record(&mut self, kind: &str, payload: Value) {
        self.seq += 1;
        let event = RunEvent {
            seq: self.seq,
            kind: kind.to_string(),
            payload,
            timestamp: Utc::now(),
        };
        if let Err(err) = self.ledger.append_event(&self.run_id, event).await {
            obs::emit_ledger_error(&self.run_id.0, &err);
        }
    }
}

pub struct PipelineRunner {
    ledger: Arc<dyn RunLedger>,
}

impl PipelineRunner {
    pub fn new(ledger: Arc<dyn RunLedger>) -> Self {
        Self { ledger }
    }

    /// Execute `pipeline`.
    ///
    /// `Err` is returned only when the run cannot be recorded at all; member
    /// failures are reported in the [`PipelineReport`].
    pub async fn run(&self, pipeline: &Pipeline, ctx: ExecutionContext) -> Result<PipelineReport> {
        let spec = PipelineSpec::from_pipeline(pipeline);
        let spec_digest = spec.digest()?;
        let wave_names: Vec<&str> = pipeline.waves().iter().map(Wave::name).collect();
        let metadata = RunMetadata {
            pipeline_name: pipeline.name().to_string(),
            source_revision: Some(ctx.source_revision.clone()),
            tags: json!({
                "mode": ctx.mode.as_str(),
                "waves": wave_names,
            }),
        };
        let run_id = self.ledger.create_run(&spec_digest, metadata).await?;

        let mut ctx = ctx;
        ctx.run_id = run_id.0.clone();
        let span = obs::run_span(&run_id.0);
        let recorder = Recorder {
            ledger: self.ledger.clone(),
            run_id,
            seq: 0,
        };
        Ok(self
            .drive(pipeline, Arc::new(ctx), recorder, spec_digest.to_string())
            .instrument(span)
            .await)
    }

    async fn drive(
        &self,
        pipeline: &Pipeline,
        ctx: Arc<ExecutionContext>,
        mut recorder: Recorder,
        spec_digest: String,
    ) -> PipelineReport {
        let started = Instant::now();
        let run_id = ctx.run_id.clone();

        obs::emit_pipeline_started(
            &run_id,
            pipeline.name(),
            &ctx.source_revision,
            pipeline.waves().len(),
        );
        recorder
            .record(
                "pipeline_started",
                json!({
                    "pipeline": pipeline.name(),
                    "revision": &ctx.source_revision,
                    "mode": ctx.mode.as_str(),
                    "spec_digest": &spec_digest,
                }),
            )
            .await;

        let mut waves = Vec::with_capacity(pipeline.waves().len());
        let mut halted: Option<(Status, String)> = None;

        for wave in pipeline.waves() {
            if halted.is_none() && ctx.cancel.is_cancelled() {
                halted = Some((Status::Cancelled, "run cancelled".to_string()));
            }
            if let Some((_, reason)) = &halted {
                recorder
                    .record(
                        "wave_skipped",
                        json!({ "wave": wave.name(), "reason": reason }),
                    )
                    .await;
                waves.push(skipped_wave(wave));
                continue;
            }

            let report = run_wave(wave, &ctx, &mut recorder).await;
            if report.status != Status::Passed {
                let reason = format!("wave {} {}", wave.name(), report.status.as_str());
                halted = Some((report.status, reason));
            }
            waves.push(report);
        }

        let status = halted.map(|(status, _)| status).unwrap_or(Status::Passed);
        let duration_ms = started.elapsed().as_millis() as u64;
        recorder
            .record(
                "pipeline_finished",
                json!({ "status": status.as_str(), "duration_ms": duration_ms }),
            )
            .await;

        let summary = RunSummary {
            total_events: recorder.seq,
            duration_ms,
            success: status == Status::Passed,
        };
        let finalised = match status {
            Status::Passed => self.ledger.complete_run(&recorder.run_id, summary).await,
            Status::Cancelled => self.ledger.cancel_run(&recorder.run_id, summary).await,
            Status::Failed | Status::Skipped => {
                self.ledger.fail_run(&recorder.run_id, summary).await
            }
        };
        if let Err(err) = finalised {
            obs::emit_ledger_error(&run_id, &err);
        }
        obs::emit_pipeline_finished(&run_id, status.as_str(), duration_ms, recorder.seq);

        PipelineReport {
            run_id,
            pipeline: pipeline.name().to_string(),
            source_revision: ctx.source_revision.clone(),
            spec_digest,
            status,
            waves,
            duration_ms,
        }
    }
}

async fn run_wave(wave: &Wave, ctx: &Arc<ExecutionContext>, recorder: &mut Recorder) -> WaveReport {
    let started = Instant::now();
    let members = wave.members();
    obs::emit_wave_started(&ctx.run_id, wave.name(), members.len());
    recorder
        .record(
            "wave_started",
            json!({ "wave": wave.name(), "members": wave.member_ids() }),
        )
        .await;

    let mut tasks = JoinSet::new();
    for (index, member) in members.iter().cloned().enumerate() {
        recorder
            .record(
                "member_started",
                json!({ "wave": wave.name(), "member": member.id(), "kind": member.kind() }),
            )
            .await;
        let ctx = ctx.clone();
        tasks.spawn(
            async move {
                let begun = Instant::now();
                let outcome = AssertUnwindSafe(member.run(&ctx))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        StepOutcome::failed(
                            FailureKind::Infrastructure,
                            format!("member panicked: {}", panic_message(panic.as_ref())),
                        )
                        .into()
                    });
                (index, outcome, begun.elapsed().as_millis() as u64)
            }
            .instrument(Span::current()),
        );
    }

    let mut slots: Vec<Option<MemberReport>> = vec![None; members.len()];
    let mut cancelled = false;
    loop {
        tokio::select! {
            joined = tasks.join_next() => match joined {
                None => break,
                Some(Ok((index, outcome, duration_ms))) => {
                    let member = &members[index];
                    let report = member_report(member.id(), member.kind(), outcome, duration_ms);
                    obs::emit_member_finished(
                        &ctx.run_id,
                        wave.name(),
                        &report.id,
                        report.status == Status::Passed,
                        &report.detail,
                    );
                    let kind = if report.status == Status::Passed {
                        "member_passed"
                    } else {
                        "member_failed"
                    };
                    recorder.record(kind, member_payload(wave.name(), &report)).await;
                    slots[index] = Some(report);
                }
                // aborted on cancellation; filled in below
                Some(Err(err)) if err.is_cancelled() => {}
                Some(Err(err)) => warn!(wave = %wave.name(), error = %err, "wave member task failed"),
            },
            _ = ctx.cancel.cancelled(), if !cancelled => {
                info!(wave = %wave.name(), "cancelling in-flight members");
                cancelled = true;
                tasks.abort_all();
            }
        }
    }

    let mut reports = Vec::with_capacity(members.len());
    for (slot, member) in slots.into_iter().zip(members) {
        let report = match slot {
            Some(report) => report,
            None => {
                let (status, detail) = if cancelled {
                    (Status::Cancelled, "cancelled before completion")
                } else {
                    (Status::Failed, "member task ended without an outcome")
                };
                let report = MemberReport {
                    id: member.id().to_string(),
                    kind: member.kind().to_string(),
                    status,
                    failure: (status == Status::Failed).then_some(FailureKind::Infrastructure),
                    detail: detail.to_string(),
                    rolled_back: false,
                    duration_ms: started.elapsed().as_millis() as u64,
                    deployments: Vec::new(),
                };
                recorder
                    .record("member_failed", member_payload(wave.name(), &report))
                    .await;
                report
            }
        };
        reports.push(report);
    }

    let status = if reports.iter().any(|m| m.status == Status::Cancelled) {
        Status::Cancelled
    } else if reports.iter().any(|m| m.status == Status::Failed) {
        Status::Failed
    } else {
        Status::Passed
    };
    let duration_ms = started.elapsed().as_millis() as u64;
    obs::emit_wave_finished(&ctx.run_id, wave.name(), status == Status::Passed, duration_ms);
    recorder
        .record(
            "wave_finished",
            json!({ "wave": wave.name(), "status": status.as_str(), "duration_ms": duration_ms }),
        )
        .await;

    WaveReport {
        name: wave.name().to_string(),
        status,
        duration_ms,
        members: reports,
    }
}

fn member_report(id: &str, kind: &str, outcome: StageOutcome, duration_ms: u64) -> MemberReport {
    let status = match outcome.outcome.failure_kind() {
        None => Status::Passed,
        Some(FailureKind::Cancelled) => Status::Cancelled,
        Some(_) => Status::Failed,
    };
    MemberReport {
        id: id.to_string(),
        kind: kind.to_string(),
        status,
        failure: outcome.outcome.failure_kind(),
        detail: outcome.outcome.detail().to_string(),
        rolled_back: outcome.rolled_back,
        duration_ms,
        deployments: outcome.deployments,
    }
}

fn member_payload(wave: &str, report: &MemberReport) -> Value {
    json!({
        "wave": wave,
        "member": &report.id,
        "kind": &report.kind,
        "status": report.status.as_str(),
        "failure": report.failure,
        "detail": &report.detail,
        "rolled_back": report.rolled_back,
        "duration_ms": report.duration_ms,
    })
}

fn skipped_wave(wave: &Wave) -> WaveReport {
    WaveReport {
        name: wave.name().to_string(),
        status: Status::Skipped,
        duration_ms: 0,
        members: wave
            .members()
            .iter()
            .map(|member| MemberReport {
                id: member.id().to_string(),
                kind: member.kind().to_string(),
                status: Status::Skipped,
                failure: None,
                detail: "not started".to_string(),
                rolled_back: false,
                duration_ms: 0,
                deployments: Vec::new(),
            })
            .collect(),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
