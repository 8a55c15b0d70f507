//! Structured lifecycle events for a safepush run.
//!
//! Every emitter logs one `info!` event with an `event` field so the JSON
//! output of [`crate::telemetry::init_tracing`] can be filtered by kind.

use tracing::info;

/// Span scoping everything a task logs. Attach to futures with
/// `tracing::Instrument`.
pub fn task_span(task: &str) -> tracing::Span {
    tracing::info_span!("safepush.task", task = %task)
}

/// RAII guard that enters a task-scoped span for as long as it lives.
/// Synchronous code only; the guard is not `Send`.
pub struct TaskSpan {
    _span: tracing::span::EnteredSpan,
}

impl TaskSpan {
    pub fn enter(task: &str) -> Self {
        Self {
            _span: task_span(task).entered(),
        }
    }
}

pub fn emit_task_started(task: &str) {
    info!(event = "task.started", task = %task);
}

pub fn emit_task_finished(task: &str, duration_ms: u64, success: bool) {
    info!(
        event = "task.finished",
        task = %task,
        duration_ms = duration_ms,
        success = success,
    );
}

pub fn emit_prediction_submitted(job_id: &str, model: &str, training: bool) {
    info!(
        event = "prediction.submitted",
        job_id = %job_id,
        model = %model,
        training = training,
    );
}

/// `status` is the terminal state name, or `timed_out`.
pub fn emit_prediction_finished(job_id: &str, status: &str, duration_ms: u64) {
    info!(
        event = "prediction.finished",
        job_id = %job_id,
        status = %status,
        duration_ms = duration_ms,
    );
}

pub fn emit_schema_checked(input_schema: &str, violations: usize) {
    info!(
        event = "schema.checked",
        input_schema = %input_schema,
        violations = violations,
        passed = violations == 0,
    );
}

pub fn emit_fuzz_generated(iteration: usize, total: usize, deterministic: bool) {
    info!(
        event = "fuzz.generated",
        iteration = iteration,
        total = total,
        deterministic = deterministic,
    );
}
