//! Structured lifecycle events for pipeline runs.
//!
//! Every function emits one `tracing` event with a stable `event` field so
//! log pipelines can filter on it. [`run_span`] tags everything logged
//! during a run with its `run_id`.

use tracing::{info, warn, Span};

/// Span that tags every event of one run with its `run_id`.
///
/// Attach it to the run future with `tracing::Instrument` so it survives
/// `.await` points:
///
/// ```ignore
/// runner.execute(&pipeline).instrument(run_span(&run_id)).await
/// ```
pub fn run_span(run_id: &str) -> Span {
    tracing::info_span!("shipyard.run", run_id = %run_id)
}

pub fn emit_pipeline_started(run_id: &str, pipeline: &str, revision: &str, waves: usize) {
    info!(
        event = "pipeline.started",
        run_id = %run_id,
        pipeline = %pipeline,
        revision = %revision,
        waves,
    );
}

pub fn emit_wave_started(run_id: &str, wave: &str, members: usize) {
    info!(event = "wave.started", run_id = %run_id, wave = %wave, members);
}

pub fn emit_member_finished(run_id: &str, wave: &str, member: &str, passed: bool, detail: &str) {
    if passed {
        info!(
            event = "member.finished",
            run_id = %run_id,
            wave = %wave,
            member = %member,
            passed,
            detail = %detail,
        );
    } else {
        warn!(
            event = "member.finished",
            run_id = %run_id,
            wave = %wave,
            member = %member,
            passed,
            detail = %detail,
        );
    }
}

pub fn emit_wave_finished(run_id: &str, wave: &str, passed: bool, duration_ms: u64) {
    info!(
        event = "wave.finished",
        run_id = %run_id,
        wave = %wave,
        passed,
        duration_ms,
    );
}

/// A new replica set failed its health threshold and was removed.
pub fn emit_rollback(environment: &str, service: &str, failed_set: &str, serving: Option<&str>) {
    warn!(
        event = "deployment.rolled_back",
        environment = %environment,
        service = %service,
        failed_set = %failed_set,
        serving = serving.unwrap_or("none"),
    );
}

pub fn emit_policy_evaluated(
    scope: &str,
    findings: usize,
    acknowledged: usize,
    violations: usize,
    passed: bool,
) {
    info!(
        event = "policy.evaluated",
        scope = %scope,
        findings,
        acknowledged,
        violations,
        passed,
    );
}

pub fn emit_pipeline_finished(run_id: &str, status: &str, duration_ms: u64, total_events: u64) {
    info!(
        event = "pipeline.finished",
        run_id = %run_id,
        status = %status,
        duration_ms,
        total_events,
    );
}

/// The run ledger could not be finalised.
pub fn emit_ledger_error(run_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "run.ledger_error", run_id = %run_id, error = %error);
}
