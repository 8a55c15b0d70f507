//! Run context shared read-only by every task of a run.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, Result};
use crate::schema::OutputShape;

/// `owner/name` reference to a model in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModelRef {
    pub owner: String,
    pub name: String,
}

impl ModelRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// Parse `owner/name`. Owners allow `[a-z0-9_-]`, names `[a-z0-9-]`.
    pub fn parse(s: &str) -> Result<Self> {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        let re = PATTERN.get_or_init(|| {
            Regex::new(r"^([a-z0-9_-]+)/([a-z0-9-]+)$").expect("model ref pattern is valid")
        });
        let caps = re.captures(s).ok_or_else(|| {
            HarnessError::InvalidArgument(format!("Invalid model reference format: {s}"))
        })?;
        Ok(Self::new(&caps[1], &caps[2]))
    }

    /// Default candidate model for `owner/name`: `owner/name-test`.
    pub fn default_candidate(&self) -> Self {
        Self::new(self.owner.clone(), format!("{}-test", self.name))
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl FromStr for ModelRef {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ModelRef {
    type Error = HarnessError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<ModelRef> for String {
    fn from(m: ModelRef) -> Self {
        m.to_string()
    }
}

/// A model plus an optional pinned version. Without a pin the latest listed
/// version is used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub model: ModelRef,
    pub version: Option<String>,
}

impl Target {
    pub fn latest(model: ModelRef) -> Self {
        Self {
            model,
            version: None,
        }
    }

    pub fn pinned(model: ModelRef, version: impl Into<String>) -> Self {
        Self {
            model,
            version: Some(version.into()),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{}:{}", self.model, v),
            None => write!(f, "{}", self.model),
        }
    }
}

/// Execution mode of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Inference,
    Training { destination: ModelRef },
}

impl Mode {
    pub fn is_training(&self) -> bool {
        matches!(self, Mode::Training { .. })
    }

    /// Name of the input schema selected by this mode.
    pub fn input_schema_name(&self) -> &'static str {
        if self.is_training() {
            "TrainingInput"
        } else {
            "Input"
        }
    }

    /// Name of the output schema selected by this mode.
    pub fn output_schema_name(&self) -> &'static str {
        if self.is_training() {
            "TrainingOutput"
        } else {
            "Output"
        }
    }
}

/// Immutable handle shared by all tasks of one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Currently live model.
    pub model: ModelRef,
    /// Candidate under test.
    pub candidate: Target,
    pub train_destination: Option<ModelRef>,
    /// Shape of the candidate's declared output.
    pub output_shape: OutputShape,
}

impl RunContext {
    pub fn new(model: ModelRef, candidate: Target, train_destination: Option<ModelRef>) -> Result<Self> {
        if model == candidate.model {
            return Err(HarnessError::InvalidArgument(
                "Can't use the same model as test model".to_string(),
            ));
        }
        Ok(Self {
            model,
            candidate,
            train_destination,
            output_shape: OutputShape::Plain,
        })
    }

    pub fn with_output_shape(mut self, shape: OutputShape) -> Self {
        self.output_shape = shape;
        self
    }

    pub fn is_training(&self) -> bool {
        self.train_destination.is_some()
    }

    pub fn mode(&self) -> Mode {
        match &self.train_destination {
            Some(destination) => Mode::Training {
                destination: destination.clone(),
            },
            None => Mode::Inference,
        }
    }

    pub fn live_target(&self) -> Target {
        Target::latest(self.model.clone())
    }
}
