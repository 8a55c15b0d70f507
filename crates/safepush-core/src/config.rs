//! Run configuration, loaded from TOML.
//!
//! ```toml
//! model = "acme/sdxl"
//! parallelism = 4
//!
//! [predict]
//! predict_timeout = 300
//!
//! [[predict.test_cases]]
//! inputs = { prompt = "a cat", seed = 1 }
//! match_prompt = "an image of a cat"
//!
//! [predict.fuzz]
//! iterations = 10
//! inputs = ["lora=(omit)^50%"]
//! disabled_inputs = ["debug"]
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::checkers::Expectation;
use crate::context::ModelRef;
use crate::error::{HarnessError, Result};
use crate::inputs::{parse_inputs, WeightedInputs};

pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_FUZZ_ITERATIONS: usize = 10;
pub const DEFAULT_PARALLELISM: usize = 4;

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_iterations() -> usize {
    DEFAULT_FUZZ_ITERATIONS
}

fn default_parallelism() -> usize {
    DEFAULT_PARALLELISM
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct HarnessConfig {
    /// Live model, `owner/name`.
    pub model: String,
    /// Candidate model; `<model>-test` when unset.
    #[serde(default)]
    pub test_model: Option<String>,
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default)]
    pub ignore_schema_compatibility: bool,
    #[serde(default)]
    pub predict: Option<PredictConfig>,
    #[serde(default)]
    pub train: Option<TrainConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PredictConfig {
    #[serde(default = "default_true")]
    pub compare_outputs: bool,
    #[serde(default = "default_timeout")]
    pub predict_timeout: u64,
    #[serde(default)]
    pub test_cases: Vec<TestCaseConfig>,
    #[serde(default)]
    pub fuzz: Option<FuzzConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TrainConfig {
    /// Destination model for trained versions; `<test_model>-dest` when unset.
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default = "default_timeout")]
    pub train_timeout: u64,
    #[serde(default)]
    pub test_cases: Vec<TestCaseConfig>,
    #[serde(default)]
    pub fuzz: Option<FuzzConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct TestCaseConfig {
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub exact_string: Option<String>,
    #[serde(default)]
    pub match_url: Option<String>,
    #[serde(default)]
    pub match_prompt: Option<String>,
    #[serde(default)]
    pub error_contains: Option<String>,
}

impl TestCaseConfig {
    /// The single expectation, if any. Setting more than one is an error.
    pub fn expectation(&self) -> Result<Option<Expectation>> {
        let mut set = [
            self.exact_string.clone().map(Expectation::ExactString),
            self.match_url.clone().map(Expectation::MatchUrl),
            self.match_prompt.clone().map(Expectation::MatchPrompt),
            self.error_contains.clone().map(Expectation::ErrorContains),
        ]
        .into_iter()
        .flatten();
        let first = set.next();
        if set.next().is_some() {
            return Err(HarnessError::InvalidArgument(
                "At most one of 'exact_string', 'match_url', 'match_prompt', or 'error_contains' must be set"
                    .to_string(),
            ));
        }
        Ok(first)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FuzzConfig {
    /// Values pinned in every payload.
    #[serde(default)]
    pub fixed_inputs: Map<String, Value>,
    /// Weighted `key=value^weight%` entries.
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub disabled_inputs: Vec<String>,
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    /// Extra guidance for input generation.
    #[serde(default)]
    pub prompt: Option<String>,
}

impl Default for FuzzConfig {
    fn default() -> Self {
        Self {
            fixed_inputs: Map::new(),
            inputs: Vec::new(),
            disabled_inputs: Vec::new(),
            iterations: DEFAULT_FUZZ_ITERATIONS,
            prompt: None,
        }
    }
}

impl FuzzConfig {
    /// Fixed inputs and weighted entries. A key may appear in only one of them.
    pub fn weighted_inputs(&self) -> Result<WeightedInputs> {
        WeightedInputs::from_fixed(&self.fixed_inputs).merge(parse_inputs(&self.inputs)?)
    }
}

impl HarnessConfig {
    /// A config for `model` with every section defaulted.
    pub fn for_model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            test_model: None,
            parallelism: DEFAULT_PARALLELISM,
            ignore_schema_compatibility: false,
            predict: None,
            train: None,
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| HarnessError::InvalidArgument(format!("invalid config: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn model_ref(&self) -> Result<ModelRef> {
        ModelRef::parse(&self.model)
    }

    pub fn candidate_ref(&self) -> Result<ModelRef> {
        match &self.test_model {
            Some(m) => ModelRef::parse(m),
            None => Ok(self.model_ref()?.default_candidate()),
        }
    }

    /// Training destination, defaulting to `<candidate>-dest`.
    pub fn train_destination(&self) -> Result<Option<ModelRef>> {
        let Some(train) = &self.train else {
            return Ok(None);
        };
        let destination = match &train.destination {
            Some(d) => ModelRef::parse(d)?,
            None => {
                let candidate = self.candidate_ref()?;
                ModelRef::new(candidate.owner, format!("{}-dest", candidate.name))
            }
        };
        Ok(Some(destination))
    }

    /// Check everything that can be checked without the network.
    pub fn validate(&self) -> Result<()> {
        let model = self.model_ref()?;
        let candidate = self.candidate_ref()?;
        if model == candidate {
            return Err(HarnessError::InvalidArgument(
                "Can't use the same model as test model".to_string(),
            ));
        }
        if self.parallelism == 0 {
            return Err(HarnessError::InvalidArgument(
                "parallelism must be at least 1".to_string(),
            ));
        }
        self.train_destination()?;

        let sections = [
            self.predict.as_ref().map(|p| ("predict", &p.test_cases, p.fuzz.as_ref())),
            self.train.as_ref().map(|t| ("train", &t.test_cases, t.fuzz.as_ref())),
        ];
        for (section, test_cases, fuzz) in sections.into_iter().flatten() {
            for (i, test_case) in test_cases.iter().enumerate() {
                test_case.expectation().map_err(|e| {
                    HarnessError::InvalidArgument(format!("{section}.test_cases[{i}]: {e}"))
                })?;
            }
            if let Some(fuzz) = fuzz {
                let weighted = fuzz.weighted_inputs()?;
                let conflict = weighted
                    .keys()
                    .find(|k| fuzz.disabled_inputs.iter().any(|d| d == k))
                    .map(str::to_string);
                if let Some(key) = conflict {
                    return Err(HarnessError::InvalidArgument(format!(
                        "{section}.fuzz: input {key} is both set and disabled"
                    )));
                }
            }
        }
        Ok(())
    }
}

impl PredictConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.predict_timeout)
    }
}

impl TrainConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.train_timeout)
    }
}
