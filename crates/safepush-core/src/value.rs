//! Canonical runtime shape of a prediction output.
//!
//! Outputs arrive as JSON. [`OutputValue`] closes them into the variants the
//! equivalence oracle dispatches on; booleans never alias integers and
//! integers never alias floats.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum OutputValue {
    String(String),
    Bool(bool),
    Integer(i64),
    Float(f64),
    Mapping(BTreeMap<String, OutputValue>),
    Sequence(Vec<OutputValue>),
    /// Anything else (null, integers outside `i64`).
    Other(Value),
}

impl OutputValue {
    /// Name of the variant, used in mismatch reasons and warnings.
    pub fn shape(&self) -> &'static str {
        match self {
            OutputValue::String(_) => "string",
            OutputValue::Bool(_) => "boolean",
            OutputValue::Integer(_) => "integer",
            OutputValue::Float(_) => "float",
            OutputValue::Mapping(_) => "mapping",
            OutputValue::Sequence(_) => "sequence",
            OutputValue::Other(_) => "other",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            OutputValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&Value> for OutputValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::String(s) => OutputValue::String(s.clone()),
            Value::Bool(b) => OutputValue::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    OutputValue::Integer(i)
                } else if n.is_f64() {
                    OutputValue::Float(n.as_f64().unwrap_or(f64::NAN))
                } else {
                    OutputValue::Other(value.clone())
                }
            }
            Value::Object(map) => OutputValue::Mapping(
                map.iter()
                    .map(|(k, v)| (k.clone(), OutputValue::from(v)))
                    .collect(),
            ),
            Value::Array(items) => OutputValue::Sequence(items.iter().map(OutputValue::from).collect()),
            Value::Null => OutputValue::Other(Value::Null),
        }
    }
}

impl From<Value> for OutputValue {
    fn from(value: Value) -> Self {
        OutputValue::from(&value)
    }
}

impl From<&OutputValue> for Value {
    fn from(value: &OutputValue) -> Self {
        match value {
            OutputValue::String(s) => Value::String(s.clone()),
            OutputValue::Bool(b) => Value::Bool(*b),
            OutputValue::Integer(i) => Value::from(*i),
            OutputValue::Float(f) => Value::from(*f),
            OutputValue::Mapping(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from(v)))
                    .collect(),
            ),
            OutputValue::Sequence(items) => Value::Array(items.iter().map(Value::from).collect()),
            OutputValue::Other(v) => v.clone(),
        }
    }
}

impl fmt::Display for OutputValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputValue::String(s) => write!(f, "{s}"),
            other => write!(f, "{}", Value::from(other)),
        }
    }
}

/// Render at most `max_len` characters of `value`, with a trailing `...` when cut.
pub fn truncate(value: &impl fmt::Display, max_len: usize) -> String {
    let s = value.to_string();
    if s.chars().count() <= max_len {
        return s;
    }
    let mut out: String = s.chars().take(max_len).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numbers_keep_their_shape() {
        assert_eq!(OutputValue::from(json!(3)), OutputValue::Integer(3));
        assert_eq!(OutputValue::from(json!(3.0)), OutputValue::Float(3.0));
        assert_eq!(OutputValue::from(json!(true)), OutputValue::Bool(true));
        assert_eq!(OutputValue::from(json!(u64::MAX)).shape(), "other");
    }

    #[test]
    fn null_is_other() {
        assert_eq!(OutputValue::from(json!(null)).shape(), "other");
    }

    #[test]
    fn nested_round_trip_to_json() {
        let raw = json!({"a": [1, 2.5, "x"], "b": {"c": false}});
        let v = OutputValue::from(&raw);
        assert_eq!(Value::from(&v), raw);
    }

    #[test]
    fn truncate_long_values() {
        assert_eq!(truncate(&"hello", 10), "hello");
        assert_eq!(truncate(&"hello world", 5), "hello...");
    }
}
