//! Input/output schemas of a model version.
//!
//! - [`deref`] : `$ref` resolution against the document root
//! - [`compat`]: rule-based backward-compatibility diff
//! - [`lint`]  : description lint for input properties

pub mod compat;
pub mod deref;
pub mod lint;

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tracing::debug;

use crate::context::{Mode, Target};
use crate::error::{HarnessError, Result};
use crate::registry::{latest_version, Registry, VersionRef};

pub use compat::{check_backwards_compatible, CompatRule, CompatVerdict, Violation};
pub use deref::{dereference, MAX_REF_DEPTH};
pub use lint::lint_schema;

/// Framework schemas that say nothing about a model's own interface.
const FRAMEWORK_SCHEMAS: &[&str] = &[
    "HTTPValidationError",
    "PredictionRequest",
    "PredictionResponse",
    "Status",
    "TrainingRequest",
    "TrainingResponse",
    "ValidationError",
    "WebhookEvent",
];

/// Whether outputs arrive whole or as a stream of chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputShape {
    #[default]
    Plain,
    /// Streamed chunks that are joined into one string.
    Iterator,
}

/// Dereferenced schemas of one version, restricted to the inference or the
/// training pair.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaDocument {
    schemas: BTreeMap<String, Value>,
    input_name: &'static str,
    output_name: &'static str,
}

impl SchemaDocument {
    /// Build from a full OpenAPI document (`components.schemas` is selected).
    pub fn from_openapi(doc: &Value, mode: &Mode) -> Result<Self> {
        let resolved = dereference(doc)?;
        let schemas = resolved
            .pointer("/components/schemas")
            .and_then(Value::as_object)
            .ok_or_else(|| HarnessError::Schema("document has no components.schemas".to_string()))?;
        Self::from_schemas(schemas, mode)
    }

    /// Build from an already extracted `components.schemas` mapping.
    /// References are resolved as if it sat at `#/components/schemas`.
    pub fn from_components(schemas: &Map<String, Value>, mode: &Mode) -> Result<Self> {
        let doc = serde_json::json!({"components": {"schemas": schemas}});
        Self::from_openapi(&doc, mode)
    }

    fn from_schemas(schemas: &Map<String, Value>, mode: &Mode) -> Result<Self> {
        let input_name = mode.input_schema_name();
        let output_name = mode.output_schema_name();
        let excluded: &[&str] = if mode.is_training() {
            &["Input", "Output"]
        } else {
            &["TrainingInput", "TrainingOutput"]
        };

        let schemas: BTreeMap<String, Value> = schemas
            .iter()
            .filter(|(name, _)| {
                !FRAMEWORK_SCHEMAS.contains(&name.as_str()) && !excluded.contains(&name.as_str())
            })
            .map(|(name, schema)| (name.clone(), schema.clone()))
            .collect();

        if !schemas.contains_key(input_name) {
            return Err(HarnessError::Schema(format!("schema {input_name} is missing")));
        }
        if !schemas.contains_key(output_name) {
            return Err(HarnessError::Schema(format!("schema {output_name} is missing")));
        }

        Ok(Self {
            schemas,
            input_name,
            output_name,
        })
    }

    pub fn input_name(&self) -> &'static str {
        self.input_name
    }

    pub fn output_name(&self) -> &'static str {
        self.output_name
    }

    pub fn schemas(&self) -> &BTreeMap<String, Value> {
        &self.schemas
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.schemas.get(name)
    }

    pub fn input_schema(&self) -> &Value {
        &self.schemas[self.input_name]
    }

    pub fn output_schema(&self) -> &Value {
        &self.schemas[self.output_name]
    }

    /// Input properties, empty when none are declared.
    pub fn input_properties(&self) -> Map<String, Value> {
        self.input_schema()
            .get("properties")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }

    pub fn required_inputs(&self) -> Vec<String> {
        self.input_schema()
            .get("required")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_input(&self, name: &str) -> bool {
        self.input_properties().contains_key(name)
    }

    /// Copy with one input property (and its `required` entry) removed.
    pub fn without_input(&self, name: &str) -> Self {
        let mut out = self.clone();
        if let Some(Value::Object(input)) = out.schemas.get_mut(self.input_name) {
            if let Some(Value::Object(props)) = input.get_mut("properties") {
                props.remove(name);
            }
            if let Some(Value::Array(required)) = input.get_mut("required") {
                required.retain(|v| v.as_str() != Some(name));
            }
        }
        out
    }

    /// `Iterator` when the output is declared as a streamed array.
    pub fn output_shape(&self) -> OutputShape {
        let output = self.output_schema();
        let is_array = output.get("type").and_then(Value::as_str) == Some("array");
        let is_iterator =
            output.get("x-cog-array-type").and_then(Value::as_str) == Some("iterator");
        if is_array && is_iterator {
            OutputShape::Iterator
        } else {
            OutputShape::Plain
        }
    }

    /// The schemas as one JSON object, as sent to the judgment capability.
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.schemas
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

/// Fetch and select the schemas of `target` (latest version unless pinned).
///
/// Models whose versions are not listable are read through their latest
/// deployed version instead. Returns `None` when the model has no version yet.
pub async fn fetch_schemas(
    registry: &dyn Registry,
    target: &Target,
    mode: &Mode,
) -> Result<Option<SchemaDocument>> {
    let doc = match &target.version {
        Some(id) => {
            let version = VersionRef {
                model: target.model.clone(),
                id: id.clone(),
            };
            Some(registry.get_schema(&version).await?)
        }
        None => match latest_version(registry, &target.model).await {
            Ok(Some(version)) => Some(registry.get_schema(&version).await?),
            Ok(None) => None,
            Err(e) if e.is_not_found() => {
                debug!(model = %target.model, "versions not listable, reading the deployed schema");
                registry.latest_schema(&target.model).await?
            }
            Err(e) => return Err(e.into()),
        },
    };
    doc.map(|doc| SchemaDocument::from_openapi(&doc, mode)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ModelRef;
    use crate::fakes::{FakeModel, FakeRegistry};
    use serde_json::json;

    fn openapi() -> Value {
        json!({
            "components": {"schemas": {
                "Input": {
                    "type": "object",
                    "properties": {
                        "prompt": {"type": "string", "description": "Prompt"},
                        "seed": {"type": "integer", "description": "Seed"},
                        "choice": {"allOf": [{"$ref": "#/components/schemas/choice"}]}
                    },
                    "required": ["prompt", "seed"]
                },
                "Output": {"type": "array", "items": {"type": "string"}, "x-cog-array-type": "iterator"},
                "TrainingInput": {"type": "object", "properties": {}},
                "TrainingOutput": {"type": "object"},
                "choice": {"type": "string", "enum": ["a", "b"]},
                "PredictionRequest": {"type": "object"},
                "Status": {"type": "string"}
            }}
        })
    }

    #[test]
    fn inference_selection_strips_framework_and_training() {
        let doc = SchemaDocument::from_openapi(&openapi(), &Mode::Inference).unwrap();
        let names: Vec<_> = doc.schemas().keys().cloned().collect();
        assert_eq!(names, vec!["Input", "Output", "choice"]);
        assert_eq!(doc.required_inputs(), vec!["prompt", "seed"]);
        assert_eq!(
            doc.input_properties()["choice"]["allOf"][0]["enum"],
            json!(["a", "b"])
        );
    }

    #[test]
    fn training_selection_keeps_training_pair() {
        let mode = Mode::Training {
            destination: ModelRef::new("acme", "dest"),
        };
        let doc = SchemaDocument::from_openapi(&openapi(), &mode).unwrap();
        assert!(doc.get("TrainingInput").is_some());
        assert!(doc.get("Input").is_none());
        assert_eq!(doc.input_name(), "TrainingInput");
    }

    #[test]
    fn iterator_output_is_detected() {
        let doc = SchemaDocument::from_openapi(&openapi(), &Mode::Inference).unwrap();
        assert_eq!(doc.output_shape(), OutputShape::Iterator);
    }

    #[test]
    fn without_input_drops_property_and_requirement() {
        let doc = SchemaDocument::from_openapi(&openapi(), &Mode::Inference).unwrap();
        let stripped = doc.without_input("seed");
        assert!(!stripped.has_input("seed"));
        assert_eq!(stripped.required_inputs(), vec!["prompt"]);
        assert!(doc.has_input("seed"));
    }

    #[test]
    fn missing_input_schema_is_an_error() {
        let doc = json!({"components": {"schemas": {"Output": {"type": "string"}}}});
        assert!(SchemaDocument::from_openapi(&doc, &Mode::Inference).is_err());
    }

    fn model() -> ModelRef {
        ModelRef::new("acme", "sdxl")
    }

    #[tokio::test]
    async fn unlisted_versions_fall_back_to_deployed_schema() {
        let registry = FakeRegistry::new().with_model(
            model(),
            FakeModel::new().with_version("v1", openapi()).public_only(),
        );
        let doc = fetch_schemas(&registry, &Target::latest(model()), &Mode::Inference)
            .await
            .unwrap()
            .expect("deployed schema");
        assert!(doc.has_input("prompt"));
    }

    #[tokio::test]
    async fn model_without_versions_has_no_schema() {
        let registry = FakeRegistry::new()
            .with_model(model(), FakeModel::new())
            .with_model(ModelRef::new("acme", "public"), FakeModel::new().public_only());
        for m in [model(), ModelRef::new("acme", "public")] {
            let doc = fetch_schemas(&registry, &Target::latest(m), &Mode::Inference)
                .await
                .unwrap();
            assert!(doc.is_none());
        }
    }

    #[tokio::test]
    async fn unknown_model_is_an_error() {
        let registry = FakeRegistry::new();
        let err = fetch_schemas(&registry, &Target::latest(model()), &Mode::Inference)
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::Registry(e) if e.is_not_found()));
    }
}
