//! End-to-end release check for one configuration.
//!
//! Per section (training first, then inference): fetch and lint the
//! candidate schema, gate on backward compatibility with the live schema,
//! then schedule output comparison, user test cases and the fuzz pipeline.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::checkers::checker_for;
use crate::config::{FuzzConfig, HarnessConfig, TestCaseConfig};
use crate::context::{ModelRef, RunContext, Target};
use crate::error::{HarnessError, Result};
use crate::fuzz::FuzzInputGenerator;
use crate::judge::Judge;
use crate::media::MediaFetcher;
use crate::metrics::METRICS;
use crate::oracle::OutputEquivalenceOracle;
use crate::predict::{PredictionRunner, DEFAULT_POLL_INTERVAL};
use crate::registry::Registry;
use crate::scheduler::{Task, TaskScheduler};
use crate::schema::{check_backwards_compatible, fetch_schemas, lint_schema, SchemaDocument};
use crate::tasks::{fuzz_pipeline, CompareOutputs, RunUserTestCase, TaskEnv, DEFAULT_QUEUE_WAIT};

/// One `[predict]` or `[train]` section, normalised.
struct Section<'a> {
    name: &'static str,
    train_destination: Option<ModelRef>,
    timeout: Duration,
    compare_outputs: bool,
    test_cases: &'a [TestCaseConfig],
    fuzz: Option<&'a FuzzConfig>,
}

/// Runs configured release checks against a registry.
pub struct Harness {
    registry: Arc<dyn Registry>,
    judge: Judge,
    fetcher: Arc<dyn MediaFetcher>,
    poll_interval: Duration,
    queue_wait: Duration,
}

impl Harness {
    pub fn new(registry: Arc<dyn Registry>, judge: Judge, fetcher: Arc<dyn MediaFetcher>) -> Self {
        Self {
            registry,
            judge,
            fetcher,
            poll_interval: DEFAULT_POLL_INTERVAL,
            queue_wait: DEFAULT_QUEUE_WAIT,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_queue_wait(mut self, queue_wait: Duration) -> Self {
        self.queue_wait = queue_wait;
        self
    }

    /// Validate `config` and run its training section, then its predict section.
    pub async fn run(&self, config: &HarnessConfig) -> Result<()> {
        let result = self.run_sections(config).await;
        METRICS.flush();
        match &result {
            Ok(()) => info!("all checks passed"),
            Err(e) => warn!(error = %e, "release checks failed"),
        }
        result
    }

    async fn run_sections(&self, config: &HarnessConfig) -> Result<()> {
        config.validate()?;

        if let Some(train) = &config.train {
            let section = Section {
                name: "train",
                train_destination: config.train_destination()?,
                timeout: train.timeout(),
                compare_outputs: false,
                test_cases: &train.test_cases,
                fuzz: train.fuzz.as_ref(),
            };
            self.run_section(config, section).await?;
        }

        if let Some(predict) = &config.predict {
            let section = Section {
                name: "predict",
                train_destination: None,
                timeout: predict.timeout(),
                compare_outputs: predict.compare_outputs,
                test_cases: &predict.test_cases,
                fuzz: predict.fuzz.as_ref(),
            };
            self.run_section(config, section).await?;
        }
        Ok(())
    }

    async fn run_section(&self, config: &HarnessConfig, section: Section<'_>) -> Result<()> {
        let model = config.model_ref()?;
        let candidate = config.candidate_ref()?;
        info!(section = section.name, model = %model, candidate = %candidate, "running section");

        let ctx = RunContext::new(model, Target::latest(candidate), section.train_destination.clone())?;
        let mode = ctx.mode();

        let candidate_schema = fetch_schemas(self.registry.as_ref(), &ctx.candidate, &mode)
            .await?
            .ok_or_else(|| {
                HarnessError::InvalidArgument(format!(
                    "candidate model {} has no version",
                    ctx.candidate.model
                ))
            })?;
        info!("linting candidate schema");
        lint_schema(&candidate_schema)?;

        let live_schema = fetch_schemas(self.registry.as_ref(), &ctx.live_target(), &mode).await?;
        match &live_schema {
            Some(live) if !config.ignore_schema_compatibility => {
                info!("checking schema backwards compatibility");
                check_backwards_compatible(live, &candidate_schema).into_result()?;
            }
            Some(_) => warn!("ignoring schema compatibility"),
            None => info!(model = %ctx.model, "live model has no version yet"),
        }

        let ctx = Arc::new(ctx.with_output_shape(candidate_schema.output_shape()));
        let oracle = OutputEquivalenceOracle::new(self.judge.clone(), Arc::clone(&self.fetcher));
        let env = TaskEnv {
            context: ctx,
            runner: PredictionRunner::new(Arc::clone(&self.registry)).with_poll_interval(self.poll_interval),
            oracle: oracle.clone(),
            generator: FuzzInputGenerator::new(self.judge.clone()),
            predict_timeout: section.timeout,
            queue_wait: self.queue_wait,
        };

        let tasks = self.build_tasks(&env, &section, &candidate_schema, live_schema.as_ref(), &oracle)?;
        let scheduler = TaskScheduler::new(config.parallelism)?;
        info!(section = section.name, tasks = tasks.len(), parallelism = scheduler.parallelism(), "scheduling tasks");
        scheduler.run(tasks).await
    }

    fn build_tasks(
        &self,
        env: &TaskEnv,
        section: &Section<'_>,
        candidate_schema: &SchemaDocument,
        live_schema: Option<&SchemaDocument>,
        oracle: &OutputEquivalenceOracle,
    ) -> Result<Vec<Box<dyn Task>>> {
        let mut tasks: Vec<Box<dyn Task>> = Vec::new();

        let weighted = section.fuzz.map(FuzzConfig::weighted_inputs).transpose()?.unwrap_or_default();
        let disabled = section.fuzz.map(|f| f.disabled_inputs.clone()).unwrap_or_default();

        // The producer goes first so consumers never hold every slot.
        let consumers = match section.fuzz.filter(|f| f.iterations > 0) {
            Some(fuzz) => {
                let (producer, consumers) = fuzz_pipeline(
                    env.clone(),
                    candidate_schema.clone(),
                    fuzz.iterations,
                    weighted.clone(),
                    disabled.clone(),
                    fuzz.prompt.clone(),
                );
                tasks.push(Box::new(producer));
                consumers
            }
            None => Vec::new(),
        };

        if let (Some(live), true) = (live_schema, section.compare_outputs) {
            let first = weighted.first_values();
            let mut compare_disabled = disabled.clone();
            compare_disabled.extend(first.omitted);
            tasks.push(Box::new(CompareOutputs {
                env: env.clone(),
                first_test_case_inputs: section.test_cases.first().map(|t| t.inputs.clone()),
                schema: live.clone(),
                fixed: first.values,
                disabled: compare_disabled,
            }));
        }

        for (index, test_case) in section.test_cases.iter().enumerate() {
            let expectation = test_case.expectation()?;
            tasks.push(Box::new(RunUserTestCase {
                env: env.clone(),
                index,
                inputs: test_case.inputs.clone(),
                checker: checker_for(expectation.as_ref(), oracle),
            }));
        }

        tasks.extend(consumers.into_iter().map(|c| Box::new(c) as Box<dyn Task>));
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeModel, FakeRegistry, MemoryMediaFetcher, ScriptedJudge};
    use serde_json::{json, Map};

    impl Default for Section<'_> {
        fn default() -> Self {
            Self {
                name: "predict",
                train_destination: None,
                timeout: Duration::from_secs(crate::config::DEFAULT_TIMEOUT_SECS),
                compare_outputs: true,
                test_cases: &[],
                fuzz: None,
            }
        }
    }

    fn schema() -> serde_json::Value {
        json!({"components": {"schemas": {
            "Input": {"type": "object", "properties": {
                "prompt": {"type": "string", "description": "Prompt"}
            }, "required": ["prompt"]},
            "Output": {"type": "string"}
        }}})
    }

    #[tokio::test]
    async fn task_order_puts_producer_first_and_consumers_last() {
        let registry = Arc::new(FakeRegistry::new().with_model(
            ModelRef::new("acme", "m-test"),
            FakeModel::new().with_version("v1", schema()),
        ));
        let judge = Judge::new(Arc::new(ScriptedJudge::new()));
        let harness = Harness::new(registry.clone(), judge.clone(), Arc::new(MemoryMediaFetcher::new()));
        let doc = SchemaDocument::from_openapi(&schema(), &crate::context::Mode::Inference).unwrap();
        let ctx = RunContext::new(
            ModelRef::new("acme", "m"),
            Target::latest(ModelRef::new("acme", "m-test")),
            None,
        )
        .unwrap();
        let oracle = OutputEquivalenceOracle::new(judge.clone(), Arc::new(MemoryMediaFetcher::new()));
        let env = TaskEnv {
            context: Arc::new(ctx),
            runner: PredictionRunner::new(registry),
            oracle: oracle.clone(),
            generator: FuzzInputGenerator::new(judge),
            predict_timeout: Duration::from_secs(1),
            queue_wait: Duration::from_secs(1),
        };
        let test_cases = vec![TestCaseConfig {
            inputs: Map::new(),
            ..Default::default()
        }];
        let fuzz = FuzzConfig {
            iterations: 2,
            ..Default::default()
        };
        let section = Section {
            test_cases: &test_cases,
            fuzz: Some(&fuzz),
            ..Default::default()
        };
        let names: Vec<String> = harness
            .build_tasks(&env, &section, &doc, Some(&doc), &oracle)
            .unwrap()
            .iter()
            .map(|t| t.name())
            .collect();
        assert_eq!(
            names,
            vec!["fuzz-inputs", "compare-outputs", "test-case-0", "fuzz-0", "fuzz-1"]
        );
    }
}
