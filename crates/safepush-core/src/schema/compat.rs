//! Backward-compatibility check between the live and the candidate schemas.
//!
//! Evaluates every input field of the live (old) schema against the
//! candidate (new) one, then new-only fields, then the output type. All
//! violations are collected into a [`CompatVerdict`]; nothing short-circuits.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::SchemaDocument;
use crate::error::{HarnessError, Result};
use crate::obs::emit_schema_checked;

/// The rule a [`Violation`] broke.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompatRule {
    MissingInput,
    ChangedType,
    AddedMinimum,
    RaisedMinimum,
    AddedMaximum,
    LoweredMaximum,
    ChangedFormat,
    ChangedChoiceType,
    MissingChoices,
    NewRequiredInput,
    MissingOutputType,
    ChangedOutputType,
}

/// One human-readable incompatibility.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Violation {
    pub rule: CompatRule,
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// The outcome of a compatibility check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompatVerdict {
    /// Violations in discovery order (empty when passed).
    pub violations: Vec<Violation>,
}

impl CompatVerdict {
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn messages(&self) -> Vec<String> {
        self.violations.iter().map(|v| v.message.clone()).collect()
    }

    /// `Err(IncompatibleSchema)` listing every violation, or `Ok(())`.
    pub fn into_result(self) -> Result<()> {
        if self.passed() {
            Ok(())
        } else {
            Err(HarnessError::IncompatibleSchema {
                violations: self.messages(),
            })
        }
    }
}

struct Collector<'a> {
    input_name: &'a str,
    violations: Vec<Violation>,
}

impl Collector<'_> {
    fn push(&mut self, rule: CompatRule, message: String) {
        self.violations.push(Violation { rule, message });
    }

    fn field(&mut self, rule: CompatRule, name: &str, what: &str) {
        let message = format!("{} {} {}", self.input_name, name, what);
        self.push(rule, message);
    }
}

/// Check that `new` (candidate) accepts every call `old` (live) accepts.
pub fn check_backwards_compatible(old: &SchemaDocument, new: &SchemaDocument) -> CompatVerdict {
    let mut c = Collector {
        input_name: old.input_name(),
        violations: Vec::new(),
    };

    let old_inputs = old.input_properties();
    let new_inputs = new.input_properties();

    for (name, old_spec) in &old_inputs {
        let Some(new_spec) = new_inputs.get(name) else {
            c.push(CompatRule::MissingInput, format!("Missing input {name}"));
            continue;
        };

        if let Some(old_choice) = choice_schema(old_spec) {
            check_choices(&mut c, name, old_choice, choice_schema(new_spec).unwrap_or(new_spec));
        } else if let Some(old_type) = old_spec.get("type") {
            check_typed_field(&mut c, name, old_type, old_spec, new_spec);
        }
    }

    for (name, new_spec) in &new_inputs {
        if !old_inputs.contains_key(name) && new_spec.get("default").is_none() {
            c.field(CompatRule::NewRequiredInput, name, "is new and is required");
        }
    }

    check_output(&mut c, old, new);

    emit_schema_checked(old.input_name(), c.violations.len());
    CompatVerdict {
        violations: c.violations,
    }
}

fn check_typed_field(c: &mut Collector<'_>, name: &str, old_type: &Value, old: &Value, new: &Value) {
    let new_type = new.get("type");
    if new_type != Some(old_type) {
        c.field(
            CompatRule::ChangedType,
            name,
            &format!(
                "has changed type from {} to {}",
                render_type(Some(old_type)),
                render_type(new_type)
            ),
        );
        return;
    }

    match (number(old, "minimum"), number(new, "minimum")) {
        (None, Some(_)) => c.field(CompatRule::AddedMinimum, name, "has added a minimum constraint"),
        (Some(old_min), Some(new_min)) if new_min > old_min => {
            c.field(CompatRule::RaisedMinimum, name, "has a higher minimum")
        }
        _ => {}
    }

    match (number(old, "maximum"), number(new, "maximum")) {
        (None, Some(_)) => c.field(CompatRule::AddedMaximum, name, "has added a maximum constraint"),
        (Some(old_max), Some(new_max)) if new_max < old_max => {
            c.field(CompatRule::LoweredMaximum, name, "has a lower maximum")
        }
        _ => {}
    }

    if format_of(old) != format_of(new) {
        c.field(CompatRule::ChangedFormat, name, "has changed format");
    }
    // Default changes are allowed.
}

fn check_choices(c: &mut Collector<'_>, name: &str, old: &Value, new: &Value) {
    let old_type = old.get("type");
    let new_type = new.get("type");
    if old_type != new_type {
        c.field(
            CompatRule::ChangedChoiceType,
            name,
            &format!(
                "choices has changed type from {} to {}",
                render_type(old_type),
                render_type(new_type)
            ),
        );
        return;
    }

    let new_choices = enum_values(new);
    let missing: Vec<String> = enum_values(old)
        .into_iter()
        .filter(|v| !new_choices.contains(v))
        .map(|v| render_choice(&v))
        .collect();
    if !missing.is_empty() {
        c.field(
            CompatRule::MissingChoices,
            name,
            &format!("is missing choices: {}", missing.join(", ")),
        );
    }
}

fn check_output(c: &mut Collector<'_>, old: &SchemaDocument, new: &SchemaDocument) {
    let output_name = old.output_name();
    let old_type = old.output_schema().get("type");
    let new_type = new.output_schema().get("type");

    if new_type.is_none() {
        c.push(
            CompatRule::MissingOutputType,
            format!("'type' is not in the test model's {output_name} schema: {}", new.output_schema()),
        );
    }
    if old_type.is_none() {
        c.push(
            CompatRule::MissingOutputType,
            format!("'type' is not in the live model's {output_name} schema: {}", old.output_schema()),
        );
    }
    if let (Some(old_type), Some(new_type)) = (old_type, new_type) {
        if old_type != new_type {
            c.push(CompatRule::ChangedOutputType, format!("{output_name} has changed type"));
        }
    }
}

/// The enumeration schema behind a choice field: the first `allOf` entry
/// after dereferencing, or the field itself when it carries `enum`.
fn choice_schema(spec: &Value) -> Option<&Value> {
    if let Some(first) = spec
        .get("allOf")
        .and_then(Value::as_array)
        .and_then(|items| items.first())
    {
        if first.get("enum").is_some() {
            return Some(first);
        }
    }
    spec.get("enum").map(|_| spec)
}

fn enum_values(spec: &Value) -> Vec<Value> {
    spec.get("enum")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn number(spec: &Value, key: &str) -> Option<f64> {
    spec.get(key).and_then(Value::as_f64)
}

fn format_of(spec: &Value) -> &str {
    spec.get("format").and_then(Value::as_str).unwrap_or("")
}

fn render_type(t: Option<&Value>) -> String {
    match t {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "none".to_string(),
    }
}

fn render_choice(v: &Value) -> String {
    match v {
        Value::String(s) => format!("'{s}'"),
        other => other.to_string(),
    }
}
