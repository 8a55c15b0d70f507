//! Fuzz input generation through the judgment capability.
//!
//! Payload synthesis is delegated to [`Judge::json_object`] with the
//! schema, overrides, omissions and prior payloads spelled out in the
//! prompt. Results missing a required key are regenerated, up to a fixed
//! budget.

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::error::Result;
use crate::judge::{Judge, JudgmentError};
use crate::metrics::METRICS;
use crate::schema::SchemaDocument;
use crate::value::truncate;

/// Generation attempts before giving up on a payload.
pub const DEFAULT_GENERATION_ATTEMPTS: u32 = 5;

/// Input that makes a prediction reproducible when supplied.
pub const SEED_INPUT: &str = "seed";

/// Public media the generator may use for `format: uri` inputs.
const EXAMPLE_MEDIA: &[(&str, &[&str])] = &[
    (
        "Videos",
        &[
            "https://storage.googleapis.com/cog-safe-push-public/harry-truman.webm",
            "https://storage.googleapis.com/cog-safe-push-public/mariner-launch.ogv",
        ],
    ),
    (
        "Images",
        &[
            "https://storage.googleapis.com/cog-safe-push-public/skull.jpg",
            "https://storage.googleapis.com/cog-safe-push-public/fast-car.jpg",
            "https://storage.googleapis.com/cog-safe-push-public/forest.png",
            "https://storage.googleapis.com/cog-safe-push-public/face.gif",
        ],
    ),
    (
        "Music audio",
        &[
            "https://storage.googleapis.com/cog-safe-push-public/folk-music.mp3",
            "https://storage.googleapis.com/cog-safe-push-public/ocarina.ogg",
        ],
    ),
    (
        "Speech",
        &[
            "https://storage.googleapis.com/cog-safe-push-public/chekhov-article.ogg",
            "https://storage.googleapis.com/cog-safe-push-public/de-experiment-german-word.ogg",
        ],
    ),
];

/// Payloads generated so far in one fuzz run, oldest first. Append-only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FuzzHistory(Vec<Map<String, Value>>);

impl FuzzHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, payload: Map<String, Value>) {
        self.0.push(payload);
    }

    pub fn entries(&self) -> &[Map<String, Value>] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Parameters of one generation.
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    pub schema: &'a SchemaDocument,
    /// Ask for required inputs only.
    pub only_required: bool,
    /// Values forced into the payload.
    pub fixed: &'a Map<String, Value>,
    /// Keys stripped from the payload.
    pub disabled: &'a [String],
    pub seed: Option<i64>,
    pub history: &'a FuzzHistory,
    /// Extra free-text guidance.
    pub fuzz_prompt: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedInputs {
    pub inputs: Map<String, Value>,
    /// A declared seed input was supplied.
    pub deterministic: bool,
}

#[derive(Clone)]
pub struct FuzzInputGenerator {
    judge: Judge,
    attempts: u32,
}

impl FuzzInputGenerator {
    pub fn new(judge: Judge) -> Self {
        Self {
            judge,
            attempts: DEFAULT_GENERATION_ATTEMPTS,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub async fn generate(&self, request: GenerationRequest<'_>) -> Result<GeneratedInputs> {
        let deterministic = request.schema.has_input(SEED_INPUT) && request.seed.is_some();
        let schema = if deterministic {
            request.schema.without_input(SEED_INPUT)
        } else {
            request.schema.clone()
        };

        let fixed: Map<String, Value> = request
            .fixed
            .iter()
            .filter(|(k, _)| !request.disabled.contains(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        // Keys we fill in afterwards need not come back from generation.
        let required: Vec<String> = schema
            .required_inputs()
            .into_iter()
            .filter(|k| k != SEED_INPUT && !fixed.contains_key(k) && !request.disabled.contains(k))
            .collect();

        let prompt = build_prompt(&schema, &fixed, request.disabled, &required, &request);

        let mut missing = Vec::new();
        let mut not_an_object = None;
        for attempt in 1..=self.attempts {
            let mut inputs = match self.judge.json_object(&prompt, &[]).await? {
                Value::Object(inputs) => inputs,
                other => {
                    warn!(
                        attempt,
                        attempts = self.attempts,
                        "generated payload is not a JSON object: {}",
                        truncate(&other, 200)
                    );
                    not_an_object = Some(other);
                    continue;
                }
            };
            not_an_object = None;

            missing = required
                .iter()
                .filter(|k| !inputs.contains_key(k.as_str()))
                .cloned()
                .collect();
            if !missing.is_empty() {
                warn!(
                    attempt,
                    attempts = self.attempts,
                    missing = ?missing,
                    "generated payload is missing required inputs"
                );
                continue;
            }

            if let (true, Some(seed)) = (deterministic, request.seed) {
                inputs.insert(SEED_INPUT.to_string(), Value::from(seed));
            }
            for (k, v) in &fixed {
                inputs.insert(k.clone(), v.clone());
            }
            for k in request.disabled {
                inputs.remove(k);
            }
            // Explicit nulls are rejected for optional inputs.
            inputs.retain(|_, v| !v.is_null());

            METRICS.inc_fuzz_inputs();
            let shown = Value::Object(inputs.clone());
            debug!(deterministic, "generated inputs: {}", shown);
            return Ok(GeneratedInputs {
                inputs,
                deterministic,
            });
        }

        let err = match not_an_object {
            Some(output) => JudgmentError::Unparsable {
                expected: "JSON object".to_string(),
                output: output.to_string(),
            },
            None => JudgmentError::IncompletePayload {
                attempts: self.attempts,
                missing,
            },
        };
        Err(err.into())
    }
}

fn build_prompt(
    schema: &SchemaDocument,
    fixed: &Map<String, Value>,
    disabled: &[String],
    required: &[String],
    request: &GenerationRequest<'_>,
) -> String {
    let input_name = schema.input_name();
    let example_input = json!({
        "type": "object",
        "title": input_name,
        "properties": {
            "text": {"type": "string", "description": "Text to greet."},
            "my_int": {"type": "integer", "description": "An integer."},
            "my_float": {"type": "number", "description": "A float."},
            "my_bool": {"type": "boolean", "description": "A bool."},
            "my_constrained_int": {
                "type": "integer", "minimum": 2, "maximum": 10,
                "description": "A constrained integer."
            },
            "my_choice": {
                "allOf": [{"type": "string", "enum": ["foo", "bar", "baz"]}],
                "description": "A choice."
            }
        },
        "required": ["text", "my_int", "my_float", "my_bool", "my_constrained_int", "my_choice"]
    });
    let mut example_schema = Map::new();
    example_schema.insert(input_name.to_string(), example_input);
    let example_schema = Value::Object(example_schema);
    let example_payload = json!({
        "text": "world",
        "my_int": 10,
        "my_float": 2.5,
        "my_bool": true,
        "my_constrained_int": 9,
        "my_choice": "foo"
    });
    let pretty = |v: &Value| serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string());

    let mut prompt = format!(
        "Below is an example of an OpenAPI schema for a model:\n\n{}\n\n\
         A valid JSON payload for that input schema would be:\n\n{}\n\n\
         Now, given the following OpenAPI schemas:\n\n{}\n\n\
         Generate a JSON payload for the {input_name} schema.\n\n\
         If inputs have format=uri, use one of the following media URLs, picking one that suits the input:\n",
        pretty(&example_schema),
        pretty(&example_payload),
        pretty(&schema.to_json()),
    );
    for (category, urls) in EXAMPLE_MEDIA {
        prompt.push_str(&format!("{category}:\n"));
        for url in *urls {
            prompt.push_str(&format!("* {url}\n"));
        }
    }
    prompt.push_str(
        "\nIf the schema has default values for some of the inputs, either use the defaults or come up with new values.\n\n",
    );

    if !fixed.is_empty() {
        prompt.push_str(&format!(
            "The following key/values must be present in the payload if they exist in the schema: {}\n",
            Value::Object(fixed.clone())
        ));
    }
    if !disabled.is_empty() {
        prompt.push_str(&format!(
            "The following keys must not be present in the payload: {}\n",
            json!(disabled)
        ));
    }

    let required = required.join(", ");
    if request.only_required {
        prompt.push_str(&format!("Only include the following required keys: {required}"));
    } else {
        prompt.push_str(&format!(
            "Include the following required keys (and preferably some optional keys too): {required}"
        ));
    }

    if !request.history.is_empty() {
        prompt.push_str(
            "\n\nReturn a new combination of inputs that you haven't used before, ideally one that is \
             quite different from the inputs you've used before. You have previously used these inputs:",
        );
        for previous in request.history.entries() {
            prompt.push_str(&format!("\n* {}", Value::Object(previous.clone())));
        }
    }

    if let Some(extra) = request.fuzz_prompt.filter(|p| !p.trim().is_empty()) {
        prompt.push_str(&format!("\n\n{}", extra.trim()));
    }
    prompt
}
