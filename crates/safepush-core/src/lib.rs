//! safepush Core Library
//!
//! Pre-release safety checks for hosted inference models: schema
//! compatibility, output equivalence against the live model, user test
//! cases and fuzzing, run under bounded parallelism.

pub mod checkers;
pub mod config;
pub mod context;
pub mod error;
pub mod fakes;
pub mod fuzz;
pub mod inputs;
pub mod judge;
pub mod media;
pub mod metrics;
pub mod obs;
pub mod oracle;
pub mod orchestrator;
pub mod predict;
pub mod registry;
pub mod scheduler;
pub mod schema;
pub mod tasks;
pub mod telemetry;
pub mod value;

pub use checkers::{checker_for, Expectation, OutputChecker};
pub use config::{FuzzConfig, HarnessConfig, PredictConfig, TestCaseConfig, TrainConfig};
pub use context::{Mode, ModelRef, RunContext, Target};
pub use error::{HarnessError, Result};
pub use fuzz::{FuzzHistory, FuzzInputGenerator, GeneratedInputs, GenerationRequest};
pub use inputs::{parse_inputs, FixedInputs, InputValue, WeightedInputs, WeightedValue};
pub use judge::{Attachment, Judge, JudgmentClient, JudgmentError};
pub use media::{HttpMediaFetcher, MediaFetcher, MediaKind};
pub use oracle::{EquivalenceVerdict, OutputEquivalenceOracle};
pub use orchestrator::Harness;
pub use predict::{PredictionOutcome, PredictionRequest, PredictionRunner};
pub use registry::{
    Job, JobMode, JobStatus, Registry, RegistryError, SubmitTarget, Version, VersionRef,
};
pub use scheduler::{RunReport, Task, TaskScheduler};
pub use schema::{
    check_backwards_compatible, fetch_schemas, lint_schema, CompatVerdict,
    OutputShape, SchemaDocument, Violation,
};
pub use value::OutputValue;

pub use metrics::METRICS;
pub use obs::{
    emit_fuzz_generated, emit_prediction_finished, emit_prediction_submitted,
    emit_schema_checked, emit_task_finished, emit_task_started, TaskSpan,
};
pub use telemetry::init_tracing;

/// safepush version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
