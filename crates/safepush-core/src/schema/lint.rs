//! Schema lint: every input property needs a description.

use serde_json::Value;

use super::SchemaDocument;
use crate::error::{HarnessError, Result};

/// Lint the selected input schema. Errors list every offending property.
pub fn lint_schema(schema: &SchemaDocument) -> Result<()> {
    let errors: Vec<String> = schema
        .input_properties()
        .iter()
        .filter(|(_, spec)| {
            spec.get("description")
                .and_then(Value::as_str)
                .map_or(true, |d| d.trim().is_empty())
        })
        .map(|(name, _)| format!("{name}: Missing description"))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(HarnessError::SchemaLint { errors })
    }
}
