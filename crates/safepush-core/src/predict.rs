//! Prediction runner: submit one job and poll it to a terminal state.
//!
//! `Submitted → Polling → {Succeeded, Failed, Canceled, TimedOut}`.
//!
//! Terminal failures come back as data in [`PredictionOutcome`] so callers
//! that expect a failure can assert on the message. A local timeout is also
//! an outcome; it never cancels the remote job.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::debug;

use crate::context::{Mode, Target};
use crate::error::{HarnessError, Result};
use crate::metrics::METRICS;
use crate::obs::{emit_prediction_finished, emit_prediction_submitted};
use crate::registry::{Job, JobStatus, Registry, RegistryError, RegistryResult, SubmitTarget, VersionRef};
use crate::schema::OutputShape;
use crate::value::truncate;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_PREDICT_TIMEOUT: Duration = Duration::from_secs(300);

/// How a prediction ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PredictionOutcome {
    Succeeded { job_id: String, output: Value },
    Failed { job_id: String, error: String },
    Canceled { job_id: String },
    /// The local wait ran out. The remote job may still be running.
    TimedOut { job_id: String, elapsed: Duration },
}

impl PredictionOutcome {
    pub fn job_id(&self) -> &str {
        match self {
            PredictionOutcome::Succeeded { job_id, .. }
            | PredictionOutcome::Failed { job_id, .. }
            | PredictionOutcome::Canceled { job_id }
            | PredictionOutcome::TimedOut { job_id, .. } => job_id,
        }
    }

    pub fn output(&self) -> Option<&Value> {
        match self {
            PredictionOutcome::Succeeded { output, .. } => Some(output),
            _ => None,
        }
    }

    /// Error message of a failed or canceled prediction.
    pub fn error(&self) -> Option<String> {
        match self {
            PredictionOutcome::Failed { error, .. } => Some(error.clone()),
            PredictionOutcome::Canceled { .. } => Some("prediction was canceled".to_string()),
            _ => None,
        }
    }

    /// The output, with every other outcome turned into an error.
    pub fn into_output(self) -> Result<Value> {
        match self {
            PredictionOutcome::Succeeded { output, .. } => Ok(output),
            PredictionOutcome::Failed { error, .. } => Err(HarnessError::PredictionFailed(error)),
            PredictionOutcome::Canceled { job_id } => Err(HarnessError::PredictionFailed(format!(
                "prediction {job_id} was canceled"
            ))),
            PredictionOutcome::TimedOut { job_id, elapsed } => Err(HarnessError::PredictionTimeout {
                job_id,
                elapsed_secs: elapsed.as_secs_f64(),
            }),
        }
    }
}

/// One prediction to run.
#[derive(Debug, Clone, Copy)]
pub struct PredictionRequest<'a> {
    pub target: &'a Target,
    pub inputs: &'a Map<String, Value>,
    pub mode: &'a Mode,
    pub timeout: Duration,
    pub output_shape: OutputShape,
}

/// Submits jobs and polls them at a fixed interval.
#[derive(Clone)]
pub struct PredictionRunner {
    registry: Arc<dyn Registry>,
    poll_interval: Duration,
}

impl PredictionRunner {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    /// Submit and poll until a terminal state or the timeout.
    ///
    /// The timeout is checked before every re-fetch, and the last sleep is
    /// shortened so the wait never overshoots the bound by a full interval.
    pub async fn run(&self, request: PredictionRequest<'_>) -> Result<PredictionOutcome> {
        let shown = Value::Object(request.inputs.clone());
        debug!(
            target = %request.target,
            training = request.mode.is_training(),
            "running prediction with inputs: {}",
            shown
        );

        let start = Instant::now();
        let mut job = self.submit(request.target, request.inputs, request.mode).await?;
        METRICS.inc_predictions();
        emit_prediction_submitted(&job.id, &request.target.to_string(), request.mode.is_training());

        while !job.status.is_terminal() {
            if let Some(outcome) = timed_out(&job, start, request.timeout) {
                return Ok(outcome);
            }
            let remaining = request.timeout.saturating_sub(start.elapsed());
            tokio::time::sleep(self.poll_interval.min(remaining)).await;
            if let Some(outcome) = timed_out(&job, start, request.timeout) {
                return Ok(outcome);
            }
            job = self.registry.get_status(&job.id).await?;
            debug!(job_id = %job.id, status = job.status.as_str(), "polled prediction");
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        emit_prediction_finished(&job.id, job.status.as_str(), duration_ms);

        Ok(match job.status {
            JobStatus::Succeeded => {
                let output = finish_output(job.output.unwrap_or(Value::Null), request.output_shape);
                debug!(job_id = %job.id, "got output: {}", truncate(&output, 500));
                PredictionOutcome::Succeeded {
                    job_id: job.id,
                    output,
                }
            }
            JobStatus::Failed => PredictionOutcome::Failed {
                error: job.error.unwrap_or_else(|| "unknown error".to_string()),
                job_id: job.id,
            },
            _ => PredictionOutcome::Canceled { job_id: job.id },
        })
    }

    async fn submit(&self, target: &Target, inputs: &Map<String, Value>, mode: &Mode) -> Result<Job> {
        if mode.is_training() {
            let version = self.resolve_version(target).await?;
            return Ok(self
                .registry
                .submit(&SubmitTarget::Version(version), inputs, mode)
                .await?);
        }

        let by_version = async {
            let version = self.resolve_version(target).await?;
            self.registry
                .submit(&SubmitTarget::Version(version), inputs, mode)
                .await
        };
        match by_version.await {
            Err(e) if e.is_not_found() => {
                // Public models don't expose their versions; address the model itself.
                debug!(model = %target.model, "version lookup not found, submitting by model");
                Ok(self
                    .registry
                    .submit(&SubmitTarget::Model(target.model.clone()), inputs, mode)
                    .await?)
            }
            other => Ok(other?),
        }
    }

    async fn resolve_version(&self, target: &Target) -> RegistryResult<VersionRef> {
        if let Some(id) = &target.version {
            return Ok(VersionRef {
                model: target.model.clone(),
                id: id.clone(),
            });
        }
        self.registry
            .list_versions(&target.model)
            .await?
            .into_iter()
            .next()
            .map(|v| VersionRef {
                model: target.model.clone(),
                id: v.id,
            })
            .ok_or_else(|| RegistryError::NotFound {
                what: format!("versions of {}", target.model),
            })
    }
}

fn timed_out(job: &Job, start: Instant, timeout: Duration) -> Option<PredictionOutcome> {
    let elapsed = start.elapsed();
    if elapsed < timeout {
        return None;
    }
    emit_prediction_finished(&job.id, "timed_out", elapsed.as_millis() as u64);
    Some(PredictionOutcome::TimedOut {
        job_id: job.id.clone(),
        elapsed,
    })
}

/// Join streamed string chunks into one string.
fn finish_output(output: Value, shape: OutputShape) -> Value {
    match (shape, output) {
        (OutputShape::Iterator, Value::Array(items)) if items.iter().all(Value::is_string) => {
            Value::String(items.iter().filter_map(Value::as_str).collect())
        }
        (_, output) => output,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn iterator_chunks_are_joined() {
        let out = finish_output(json!(["Hel", "lo", "!"]), OutputShape::Iterator);
        assert_eq!(out, json!("Hello!"));
    }

    #[test]
    fn plain_arrays_are_left_alone() {
        let out = finish_output(json!(["a", "b"]), OutputShape::Plain);
        assert_eq!(out, json!(["a", "b"]));
        let out = finish_output(json!([1, "b"]), OutputShape::Iterator);
        assert_eq!(out, json!([1, "b"]));
    }

    #[test]
    fn into_output_maps_outcomes() {
        let ok = PredictionOutcome::Succeeded {
            job_id: "j".into(),
            output: json!("x"),
        };
        assert_eq!(ok.into_output().unwrap(), json!("x"));

        let failed = PredictionOutcome::Failed {
            job_id: "j".into(),
            error: "CUDA OOM".into(),
        };
        assert_eq!(failed.error().as_deref(), Some("CUDA OOM"));
        assert!(matches!(
            failed.into_output(),
            Err(HarnessError::PredictionFailed(msg)) if msg == "CUDA OOM"
        ));

        let timed_out = PredictionOutcome::TimedOut {
            job_id: "j".into(),
            elapsed: Duration::from_millis(3500),
        };
        let err = timed_out.into_output().unwrap_err();
        assert_eq!(err.to_string(), "prediction j timed out after 3.5s");
        assert!(matches!(
            err,
            HarnessError::PredictionTimeout { elapsed_secs, .. } if elapsed_secs == 3.5
        ));
    }
}
