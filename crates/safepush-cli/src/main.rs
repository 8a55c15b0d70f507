//! safepush - pre-release safety checks for hosted inference models
//!
//! The `safepush` command exposes the offline checks of the harness.
//!
//! ## Commands
//!
//! - `check-schema`: Check that a new OpenAPI schema is backwards compatible
//! - `lint-schema`: Check that every input carries a description
//! - `inputs`: Resolve weighted `key=value^w%` input entries
//! - `validate-config`: Parse and validate a harness configuration file

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{info, Level};

use safepush_core::inputs::InputValue;
use safepush_core::{
    check_backwards_compatible, lint_schema, parse_inputs, HarnessConfig, Mode, ModelRef,
    SchemaDocument, TaskSpan,
};

#[derive(Parser)]
#[command(name = "safepush")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Pre-release safety checks for hosted inference models", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that a new schema is backwards compatible with an old one
    CheckSchema {
        /// OpenAPI document of the live version (JSON)
        #[arg(long)]
        old: PathBuf,

        /// OpenAPI document of the candidate version (JSON)
        #[arg(long)]
        new: PathBuf,

        /// Compare the training schemas instead of the prediction schemas
        #[arg(long)]
        train: bool,

        /// Print the verdict as JSON
        #[arg(long = "output-json")]
        output_json: bool,
    },

    /// Check that every input property has a description
    LintSchema {
        /// OpenAPI document (JSON)
        file: PathBuf,

        /// Lint the training schema instead of the prediction schema
        #[arg(long)]
        train: bool,
    },

    /// Resolve weighted input entries and print each key's candidates
    Inputs {
        /// Input entry: key=value, optionally suffixed with ^<weight>%
        #[arg(short = 'i', long = "input", required = true)]
        inputs: Vec<String>,

        /// Print the resolution as JSON
        #[arg(long = "output-json")]
        output_json: bool,
    },

    /// Parse and validate a harness configuration file (TOML)
    ValidateConfig {
        /// Path to the configuration file
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    safepush_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::CheckSchema {
            old,
            new,
            train,
            output_json,
        } => cmd_check_schema(&old, &new, train, output_json),
        Commands::LintSchema { file, train } => cmd_lint_schema(&file, train),
        Commands::Inputs {
            inputs,
            output_json,
        } => cmd_inputs(&inputs, output_json),
        Commands::ValidateConfig { file } => cmd_validate_config(&file),
    }
}

fn cmd_check_schema(old: &Path, new: &Path, train: bool, json: bool) -> Result<()> {
    let _span = TaskSpan::enter("check-schema");
    let mode = schema_mode(train);
    let old_schema = read_schema(old, &mode)?;
    let new_schema = read_schema(new, &mode)?;

    let verdict = check_backwards_compatible(&old_schema, &new_schema);
    if json {
        println!("{}", serde_json::to_string_pretty(&verdict)?);
    } else if verdict.passed() {
        println!("Schema is backwards compatible");
    }
    verdict
        .into_result()
        .context("Schema compatibility check failed")
}

fn cmd_lint_schema(file: &Path, train: bool) -> Result<()> {
    let _span = TaskSpan::enter("lint-schema");
    let schema = read_schema(file, &schema_mode(train))?;
    lint_schema(&schema).with_context(|| format!("Linting {:?} failed", file))?;
    println!("{} inputs, all described", schema.input_properties().len());
    Ok(())
}

#[derive(Debug, Serialize)]
struct ResolvedCandidate {
    value: Option<Value>,
    omitted: bool,
    weight_percent: f64,
}

fn cmd_inputs(entries: &[String], json: bool) -> Result<()> {
    let weighted = parse_inputs(entries).context("Invalid input entries")?;

    let mut resolved = serde_json::Map::new();
    for key in weighted.keys() {
        let candidates: Vec<ResolvedCandidate> = weighted
            .get(key)
            .unwrap_or_default()
            .iter()
            .map(|wv| match &wv.value {
                InputValue::Value(v) => ResolvedCandidate {
                    value: Some(v.clone()),
                    omitted: false,
                    weight_percent: wv.weight_percent,
                },
                InputValue::Omitted => ResolvedCandidate {
                    value: None,
                    omitted: true,
                    weight_percent: wv.weight_percent,
                },
            })
            .collect();
        resolved.insert(key.to_string(), serde_json::to_value(&candidates)?);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&resolved)?);
        return Ok(());
    }
    for (key, candidates) in &resolved {
        println!("{}:", key);
        for c in candidates.as_array().into_iter().flatten() {
            let value = if c["omitted"] == Value::Bool(true) {
                "(omitted)".to_string()
            } else {
                c["value"].to_string()
            };
            println!("  {:>6.2}%  {}", c["weight_percent"].as_f64().unwrap_or(0.0), value);
        }
    }
    Ok(())
}

fn cmd_validate_config(file: &Path) -> Result<()> {
    let _span = TaskSpan::enter("validate-config");
    let config = load_config(file)?;
    info!(model = %config.model, "configuration loaded");

    println!("Model:      {}", config.model_ref()?);
    println!("Candidate:  {}", config.candidate_ref()?);
    if let Some(destination) = config.train_destination()? {
        println!("Train dest: {}", destination);
    }
    if let Some(predict) = &config.predict {
        println!(
            "Predict:    {} test cases, fuzz iterations {}",
            predict.test_cases.len(),
            predict.fuzz.as_ref().map_or(0, |f| f.iterations)
        );
    }
    if let Some(train) = &config.train {
        println!(
            "Train:      {} test cases, fuzz iterations {}",
            train.test_cases.len(),
            train.fuzz.as_ref().map_or(0, |f| f.iterations)
        );
    }
    println!("Parallelism: {}", config.parallelism);
    Ok(())
}

fn load_config(path: &Path) -> Result<HarnessConfig> {
    let config = HarnessConfig::load(path)
        .with_context(|| format!("Failed to load configuration from {:?}", path))?;
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {:?}", path))?;
    Ok(config)
}

/// Only the selected schema pair matters offline, so the destination is a placeholder.
fn schema_mode(train: bool) -> Mode {
    if train {
        Mode::Training {
            destination: ModelRef::new("local", "destination"),
        }
    } else {
        Mode::Inference
    }
}

fn read_schema(path: &Path, mode: &Mode) -> Result<SchemaDocument> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read schema file: {:?}", path))?;
    let doc: Value =
        serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {:?}", path))?;
    SchemaDocument::from_openapi(&doc, mode)
        .with_context(|| format!("Failed to select schemas from {:?}", path))
}
