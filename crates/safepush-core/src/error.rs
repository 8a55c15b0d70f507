//! Error taxonomy for safepush.
//!
//! Every failure a run can surface is a [`HarnessError`], so callers can
//! treat "the run failed" as one kind. Collaborator errors ([`RegistryError`],
//! [`JudgmentError`]) convert into it via `#[from]`.

use crate::judge::JudgmentError;
use crate::registry::RegistryError;

/// Errors produced by a safepush run.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// Caller misuse. Never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("judgment error: {0}")]
    Judgment(#[from] JudgmentError),

    /// The local wait exceeded its bound. The remote job may still be running.
    #[error("prediction {job_id} timed out after {elapsed_secs:.1}s")]
    PredictionTimeout { job_id: String, elapsed_secs: f64 },

    #[error("prediction failed: {0}")]
    PredictionFailed(String),

    #[error("{}", render_list("Schema is not backwards compatible:", violations))]
    IncompatibleSchema { violations: Vec<String> },

    #[error("{}", render_list("Schema failed linting:", errors))]
    SchemaLint { errors: Vec<String> },

    #[error("schema error: {0}")]
    Schema(String),

    #[error("Outputs don't match:\n\ntest output:\n{candidate}\n\nmodel output:\n{reference}\n\n{reason}")]
    OutputsMismatched {
        candidate: String,
        reference: String,
        reason: String,
    },

    #[error("Test case failed: {0}")]
    TestCaseFailed(String),

    #[error("Fuzz failed: {0}")]
    FuzzFailed(String),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("media error: {0}")]
    Media(String),

    #[error("task {task} panicked")]
    TaskPanicked { task: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for safepush operations.
pub type Result<T> = std::result::Result<T, HarnessError>;

fn render_list(header: &str, lines: &[String]) -> String {
    let mut out = header.to_string();
    for line in lines {
        out.push_str("\n* ");
        out.push_str(line);
    }
    out
}
