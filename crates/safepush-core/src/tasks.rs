//! Task variants scheduled by [`crate::scheduler::TaskScheduler`].
//!
//! - [`CompareOutputs`]: candidate and live outputs must be equivalent
//! - [`RunUserTestCase`]: one user test case against its checker
//! - [`GenerateFuzzInputs`]: the fuzz producer, strictly sequential
//! - [`RunFuzzIteration`]: one fuzz consumer
//!
//! Each task maps its own failures onto the error taxonomy.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::info;

use crate::checkers::OutputChecker;
use crate::context::{RunContext, Target};
use crate::error::{HarnessError, Result};
use crate::fuzz::{FuzzHistory, FuzzInputGenerator, GenerationRequest, SEED_INPUT};
use crate::inputs::WeightedInputs;
use crate::obs::emit_fuzz_generated;
use crate::oracle::OutputEquivalenceOracle;
use crate::predict::{PredictionOutcome, PredictionRequest, PredictionRunner};
use crate::scheduler::Task;
use crate::schema::SchemaDocument;
use crate::value::truncate;

/// How long a fuzz consumer waits for the producer.
pub const DEFAULT_QUEUE_WAIT: Duration = Duration::from_secs(60);

/// Collaborators shared by every task of one run.
#[derive(Clone)]
pub struct TaskEnv {
    pub context: Arc<RunContext>,
    pub runner: PredictionRunner,
    pub oracle: OutputEquivalenceOracle,
    pub generator: FuzzInputGenerator,
    pub predict_timeout: Duration,
    pub queue_wait: Duration,
}

impl TaskEnv {
    async fn predict(&self, target: &Target, inputs: &Map<String, Value>) -> Result<PredictionOutcome> {
        let mode = self.context.mode();
        self.runner
            .run(PredictionRequest {
                target,
                inputs,
                mode: &mode,
                timeout: self.predict_timeout,
                output_shape: self.context.output_shape,
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// CompareOutputs
// ---------------------------------------------------------------------------

/// Runs the same inputs on the candidate and the live model and compares.
///
/// Inputs come from the first test case when there is one, and the run is
/// deterministic iff those inputs carry a seed. Otherwise required-only
/// inputs are generated with seed 1.
pub struct CompareOutputs {
    pub env: TaskEnv,
    pub first_test_case_inputs: Option<Map<String, Value>>,
    /// Live schema, used for generation.
    pub schema: SchemaDocument,
    pub fixed: Map<String, Value>,
    pub disabled: Vec<String>,
}

#[async_trait]
impl Task for CompareOutputs {
    fn name(&self) -> String {
        "compare-outputs".to_string()
    }

    async fn run(self: Box<Self>) -> Result<()> {
        let (inputs, deterministic) = match &self.first_test_case_inputs {
            Some(inputs) => (inputs.clone(), inputs.contains_key(SEED_INPUT)),
            None => {
                let history = FuzzHistory::new();
                let generated = self
                    .env
                    .generator
                    .generate(GenerationRequest {
                        schema: &self.schema,
                        only_required: true,
                        fixed: &self.fixed,
                        disabled: &self.disabled,
                        seed: Some(1),
                        history: &history,
                        fuzz_prompt: None,
                    })
                    .await?;
                (generated.inputs, generated.deterministic)
            }
        };

        let shown = Value::Object(inputs.clone());
        info!(
            deterministic,
            "checking outputs match between live and candidate, with inputs: {}",
            shown
        );
        let ctx = &self.env.context;
        let candidate = self.env.predict(&ctx.candidate, &inputs).await?.into_output()?;
        let reference = self.env.predict(&ctx.live_target(), &inputs).await?.into_output()?;

        let verdict = self
            .env
            .oracle
            .compare(&candidate, &reference, deterministic)
            .await?;
        if !verdict.matches {
            return Err(HarnessError::OutputsMismatched {
                candidate: candidate.to_string(),
                reference: reference.to_string(),
                reason: verdict.reason,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RunUserTestCase
// ---------------------------------------------------------------------------

/// Runs one user-authored test case on the candidate.
pub struct RunUserTestCase {
    pub env: TaskEnv,
    pub index: usize,
    pub inputs: Map<String, Value>,
    pub checker: Box<dyn OutputChecker>,
}

#[async_trait]
impl Task for RunUserTestCase {
    fn name(&self) -> String {
        format!("test-case-{}", self.index)
    }

    async fn run(self: Box<Self>) -> Result<()> {
        let shown = Value::Object(self.inputs.clone());
        info!("running test case with inputs: {}", shown);
        let outcome = self.env.predict(&self.env.context.candidate, &self.inputs).await?;
        if let PredictionOutcome::TimedOut { elapsed, .. } = &outcome {
            return Err(HarnessError::TestCaseFailed(format!(
                "Prediction timed out after {:.1}s",
                elapsed.as_secs_f64()
            )));
        }
        let error = outcome.error();
        self.checker
            .check(outcome.output(), error.as_deref())
            .await
    }
}

// ---------------------------------------------------------------------------
// Fuzz producer / consumers
// ---------------------------------------------------------------------------

/// Generates `iterations` payloads in order, each aware of the previous ones.
pub struct GenerateFuzzInputs {
    pub env: TaskEnv,
    /// Candidate schema.
    pub schema: SchemaDocument,
    pub iterations: usize,
    pub inputs: WeightedInputs,
    pub disabled: Vec<String>,
    pub fuzz_prompt: Option<String>,
    pub rng_seed: Option<u64>,
    sender: mpsc::Sender<Map<String, Value>>,
}

/// Pulls one payload and runs it on the candidate.
pub struct RunFuzzIteration {
    pub env: TaskEnv,
    pub index: usize,
    receiver: Arc<Mutex<mpsc::Receiver<Map<String, Value>>>>,
}

/// Wire one producer to `iterations` consumers through a queue of capacity
/// `iterations`.
pub fn fuzz_pipeline(
    env: TaskEnv,
    schema: SchemaDocument,
    iterations: usize,
    inputs: WeightedInputs,
    disabled: Vec<String>,
    fuzz_prompt: Option<String>,
) -> (GenerateFuzzInputs, Vec<RunFuzzIteration>) {
    let (sender, receiver) = mpsc::channel(iterations.max(1));
    let receiver = Arc::new(Mutex::new(receiver));
    let consumers = (0..iterations)
        .map(|index| RunFuzzIteration {
            env: env.clone(),
            index,
            receiver: Arc::clone(&receiver),
        })
        .collect();
    let producer = GenerateFuzzInputs {
        env,
        schema,
        iterations,
        inputs,
        disabled,
        fuzz_prompt,
        rng_seed: None,
        sender,
    };
    (producer, consumers)
}

#[async_trait]
impl Task for GenerateFuzzInputs {
    fn name(&self) -> String {
        "fuzz-inputs".to_string()
    }

    async fn run(self: Box<Self>) -> Result<()> {
        let mut rng = match self.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut history = FuzzHistory::new();

        for iteration in 0..self.iterations {
            let fixed = self.inputs.sample(&mut rng)?;
            let mut disabled = self.disabled.clone();
            disabled.extend(fixed.omitted);

            let generated = self
                .env
                .generator
                .generate(GenerationRequest {
                    schema: &self.schema,
                    only_required: false,
                    fixed: &fixed.values,
                    disabled: &disabled,
                    seed: None,
                    history: &history,
                    fuzz_prompt: self.fuzz_prompt.as_deref(),
                })
                .await?;
            emit_fuzz_generated(iteration + 1, self.iterations, generated.deterministic);

            self.sender
                .send(generated.inputs.clone())
                .await
                .map_err(|_| HarnessError::FuzzFailed("fuzz input queue closed".to_string()))?;
            history.push(generated.inputs);
        }
        Ok(())
    }
}

#[async_trait]
impl Task for RunFuzzIteration {
    fn name(&self) -> String {
        format!("fuzz-{}", self.index)
    }

    async fn run(self: Box<Self>) -> Result<()> {
        let next = async { self.receiver.lock().await.recv().await };
        let inputs = tokio::time::timeout(self.env.queue_wait, next)
            .await
            .map_err(|_| HarnessError::FuzzFailed("Timed out waiting for fuzz inputs".to_string()))?
            .ok_or_else(|| HarnessError::FuzzFailed("No fuzz inputs were generated".to_string()))?;

        let shown = Value::Object(inputs.clone());
        info!("fuzzing with inputs: {}", shown);
        match self.env.predict(&self.env.context.candidate, &inputs).await? {
            PredictionOutcome::TimedOut { .. } => {
                Err(HarnessError::FuzzFailed("Prediction timed out".to_string()))
            }
            PredictionOutcome::Failed { error, .. } => {
                Err(HarnessError::FuzzFailed(format!("Prediction failed: {error}")))
            }
            PredictionOutcome::Canceled { .. } => Err(HarnessError::FuzzFailed(
                "Prediction failed: prediction was canceled".to_string(),
            )),
            PredictionOutcome::Succeeded { output, .. } if is_empty_output(&output) => {
                Err(HarnessError::FuzzFailed("No output".to_string()))
            }
            PredictionOutcome::Succeeded { output, .. } => {
                info!("fuzz output: {}", truncate(&output, 200));
                Ok(())
            }
        }
    }
}

/// Null, an empty string, or an empty collection.
fn is_empty_output(output: &Value) -> bool {
    match output {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_outputs() {
        assert!(is_empty_output(&json!(null)));
        assert!(is_empty_output(&json!("")));
        assert!(is_empty_output(&json!([])));
        assert!(is_empty_output(&json!({})));
        assert!(!is_empty_output(&json!(0)));
        assert!(!is_empty_output(&json!(false)));
        assert!(!is_empty_output(&json!("x")));
    }
}
