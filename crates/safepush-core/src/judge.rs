//! Judgment capability: an external natural-language/vision decision service.
//!
//! [`JudgmentClient`] is the raw capability. [`Judge`] wraps it with a fixed
//! number of immediate retries (no backoff); the last attempt's error
//! propagates.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::metrics::METRICS;

/// Attempts per judgment call, first try included.
pub const DEFAULT_JUDGMENT_ATTEMPTS: u32 = 3;

/// Errors produced by the judgment capability.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JudgmentError {
    /// The response could not be parsed into the expected shape.
    #[error("failed to parse judgment output as {expected}: {output}")]
    Unparsable { expected: String, output: String },

    /// Generated payloads kept missing required keys.
    #[error("failed to generate a payload with the required keys after {attempts} attempts, missing: {}", missing.join(", "))]
    IncompletePayload { attempts: u32, missing: Vec<String> },

    #[error("judgment service error: {0}")]
    Service(String),
}

/// A local file handed to the judgment capability alongside a prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub path: PathBuf,
    /// Sniffed media type, e.g. `image/png`.
    pub media_type: String,
}

/// External decision service.
#[async_trait]
pub trait JudgmentClient: Send + Sync {
    /// Answer a yes/no question.
    async fn classify_boolean(
        &self,
        prompt: &str,
        attachments: &[Attachment],
    ) -> Result<bool, JudgmentError>;

    /// Produce a JSON value for a generation request.
    async fn generate_json(
        &self,
        prompt: &str,
        attachments: &[Attachment],
    ) -> Result<Value, JudgmentError>;
}

/// Parse a strict `YES` / `NO` answer.
pub fn parse_yes_no(output: &str) -> Result<bool, JudgmentError> {
    match output.trim() {
        "YES" => Ok(true),
        "NO" => Ok(false),
        other => Err(JudgmentError::Unparsable {
            expected: "YES/NO".to_string(),
            output: other.to_string(),
        }),
    }
}

/// Parse a JSON object answer.
pub fn parse_json_object(output: &str) -> Result<Value, JudgmentError> {
    match serde_json::from_str::<Value>(output.trim()) {
        Ok(v @ Value::Object(_)) => Ok(v),
        _ => Err(JudgmentError::Unparsable {
            expected: "JSON object".to_string(),
            output: output.to_string(),
        }),
    }
}

/// Retrying front-end over a [`JudgmentClient`].
#[derive(Clone)]
pub struct Judge {
    client: Arc<dyn JudgmentClient>,
    attempts: u32,
}

impl Judge {
    pub fn new(client: Arc<dyn JudgmentClient>) -> Self {
        Self {
            client,
            attempts: DEFAULT_JUDGMENT_ATTEMPTS,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub async fn boolean(
        &self,
        prompt: &str,
        attachments: &[Attachment],
    ) -> Result<bool, JudgmentError> {
        let prompt = prompt.trim();
        debug!(attachments = attachments.len(), "judgment prompt: {prompt}");
        let answer = retry(self.attempts, || {
            METRICS.inc_judgment_calls();
            self.client.classify_boolean(prompt, attachments)
        })
        .await?;
        debug!(answer, "judgment answer");
        Ok(answer)
    }

    pub async fn json_object(
        &self,
        prompt: &str,
        attachments: &[Attachment],
    ) -> Result<Value, JudgmentError> {
        let prompt = prompt.trim();
        debug!(attachments = attachments.len(), "generation prompt: {prompt}");
        let value = retry(self.attempts, || {
            METRICS.inc_judgment_calls();
            self.client.generate_json(prompt, attachments)
        })
        .await?;
        debug!("generation answer: {value}");
        Ok(value)
    }
}

async fn retry<T, F, Fut>(attempts: u32, mut op: F) -> Result<T, JudgmentError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, JudgmentError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                warn!(error = %e, "judgment call failed, retrying attempt {attempt}/{attempts}");
                attempt += 1;
            }
            Err(e) => {
                warn!(error = %e, "judgment call failed, giving up after {attempts} attempts");
                return Err(e);
            }
        }
    }
}
