//! Internal `$ref` resolution.
//!
//! Every `{"$ref": "#/..."}` object is replaced in place by the value its JSON
//! pointer names in the document root. Resolved values are themselves
//! resolved, so chains of references collapse. Sibling keys next to a `$ref`
//! are laid over the resolved object.

use serde_json::{Map, Value};

use crate::error::{HarnessError, Result};

/// Nesting limit for reference chains. Real cycles are not expected.
pub const MAX_REF_DEPTH: usize = 64;

/// Dereference every internal reference in `doc` against `doc` itself.
///
/// A document without references is returned unchanged.
pub fn dereference(doc: &Value) -> Result<Value> {
    resolve(doc, doc, 0)
}

fn resolve(value: &Value, root: &Value, depth: usize) -> Result<Value> {
    if depth > MAX_REF_DEPTH {
        return Err(HarnessError::Schema(format!(
            "reference nesting exceeds {MAX_REF_DEPTH} levels"
        )));
    }
    match value {
        Value::Object(map) => match map.get("$ref") {
            Some(Value::String(reference)) => {
                let target = lookup(root, reference)?;
                let resolved = resolve(target, root, depth + 1)?;
                merge_siblings(resolved, map, root, depth)
            }
            _ => {
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), resolve(v, root, depth)?);
                }
                Ok(Value::Object(out))
            }
        },
        Value::Array(items) => items
            .iter()
            .map(|v| resolve(v, root, depth))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}

fn lookup<'a>(root: &'a Value, reference: &str) -> Result<&'a Value> {
    let pointer = reference.strip_prefix('#').ok_or_else(|| {
        HarnessError::Schema(format!("only internal references are supported: {reference}"))
    })?;
    root.pointer(pointer)
        .ok_or_else(|| HarnessError::Schema(format!("unresolvable reference: {reference}")))
}

fn merge_siblings(
    resolved: Value,
    original: &Map<String, Value>,
    root: &Value,
    depth: usize,
) -> Result<Value> {
    let siblings: Vec<_> = original.iter().filter(|(k, _)| k.as_str() != "$ref").collect();
    if siblings.is_empty() {
        return Ok(resolved);
    }
    match resolved {
        Value::Object(mut obj) => {
            for (k, v) in siblings {
                obj.insert(k.clone(), resolve(v, root, depth)?);
            }
            Ok(Value::Object(obj))
        }
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> Value {
        json!({
            "components": {
                "schemas": {
                    "Input": {
                        "properties": {
                            "choice": {
                                "allOf": [{"$ref": "#/components/schemas/choice"}],
                                "description": "A choice"
                            },
                            "nested": {"$ref": "#/components/schemas/alias"}
                        }
                    },
                    "choice": {"type": "string", "enum": ["A", "B"]},
                    "alias": {"$ref": "#/components/schemas/choice"}
                }
            }
        })
    }

    #[test]
    fn resolves_refs_in_place() {
        let out = dereference(&doc()).unwrap();
        let props = &out["components"]["schemas"]["Input"]["properties"];
        assert_eq!(props["choice"]["allOf"][0]["enum"], json!(["A", "B"]));
        assert_eq!(props["choice"]["description"], "A choice");
    }

    #[test]
    fn resolves_nested_refs() {
        let out = dereference(&doc()).unwrap();
        let nested = &out["components"]["schemas"]["Input"]["properties"]["nested"];
        assert_eq!(nested, &json!({"type": "string", "enum": ["A", "B"]}));
        assert!(!out.to_string().contains("$ref"));
    }

    #[test]
    fn repeated_refs_do_not_overflow() {
        let mut props = Map::new();
        for i in 0..200 {
            props.insert(format!("f{i}"), json!({"$ref": "#/defs/leaf"}));
        }
        let doc = json!({"defs": {"leaf": {"type": "integer"}}, "props": props});
        let out = dereference(&doc).unwrap();
        assert_eq!(out["props"]["f199"]["type"], "integer");
    }

    #[test]
    fn dereferencing_is_idempotent() {
        let once = dereference(&doc()).unwrap();
        let twice = dereference(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn cycles_are_reported_not_overflowed() {
        let doc = json!({"a": {"$ref": "#/b"}, "b": {"$ref": "#/a"}});
        let err = dereference(&doc).unwrap_err();
        assert!(err.to_string().contains("nesting"));
    }

    #[test]
    fn unknown_pointer_is_an_error() {
        let doc = json!({"a": {"$ref": "#/missing"}});
        assert!(dereference(&doc).is_err());
        let doc = json!({"a": {"$ref": "other.json#/x"}});
        assert!(dereference(&doc).is_err());
    }
}
