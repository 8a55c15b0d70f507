//! Weighted input values: `key=value^<weight>%` entries.
//!
//! Each key resolves to one or more candidate values. Explicit weights must
//! be in (0, 100] and sum to at most 100 per key; unweighted entries split the
//! remainder evenly. Output comparison uses the first value per key, fuzzing
//! samples one value per key per payload.

use std::collections::BTreeMap;

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde_json::{Map, Value};

use crate::error::{HarnessError, Result};

/// Literal that means "leave this key out of the payload".
pub const OMIT: &str = "(omit)";

#[derive(Debug, Clone, PartialEq)]
pub enum InputValue {
    Value(Value),
    Omitted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeightedValue {
    pub value: InputValue,
    pub weight_percent: f64,
}

/// Concrete values for one payload, plus the keys to leave out.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FixedInputs {
    pub values: Map<String, Value>,
    pub omitted: Vec<String>,
}

/// Candidate values per input key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeightedInputs(BTreeMap<String, Vec<WeightedValue>>);

impl WeightedInputs {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&[WeightedValue]> {
        self.0.get(key).map(Vec::as_slice)
    }

    /// Every key pinned to a single value at 100%.
    pub fn from_fixed(values: &Map<String, Value>) -> Self {
        Self(
            values
                .iter()
                .map(|(k, v)| {
                    (
                        k.clone(),
                        vec![WeightedValue {
                            value: InputValue::Value(v.clone()),
                            weight_percent: 100.0,
                        }],
                    )
                })
                .collect(),
        )
    }

    /// Union of two disjoint input sets. A key present on both sides is an
    /// error, since neither set of weights could be kept as written.
    pub fn merge(mut self, other: WeightedInputs) -> Result<Self> {
        for (key, values) in other.0 {
            if self.0.contains_key(&key) {
                return Err(HarnessError::InvalidArgument(format!(
                    "input {key} is given both as a fixed and as a weighted input"
                )));
            }
            self.0.insert(key, values);
        }
        Ok(self)
    }

    /// The first candidate of every key.
    pub fn first_values(&self) -> FixedInputs {
        let mut out = FixedInputs::default();
        for (key, values) in &self.0 {
            match values.first().map(|wv| &wv.value) {
                Some(InputValue::Value(v)) => {
                    out.values.insert(key.clone(), v.clone());
                }
                Some(InputValue::Omitted) => out.omitted.push(key.clone()),
                None => {}
            }
        }
        out
    }

    /// One candidate per key, drawn according to the weights.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<FixedInputs> {
        let mut out = FixedInputs::default();
        for (key, values) in &self.0 {
            let dist = WeightedIndex::new(values.iter().map(|wv| wv.weight_percent)).map_err(|e| {
                HarnessError::InvalidArgument(format!("invalid weights for input {key}: {e}"))
            })?;
            match &values[dist.sample(rng)].value {
                InputValue::Value(v) => {
                    out.values.insert(key.clone(), v.clone());
                }
                InputValue::Omitted => out.omitted.push(key.clone()),
            }
        }
        Ok(out)
    }
}

/// Parse `key=value[^weight%]` entries. The same key may repeat.
pub fn parse_inputs<S: AsRef<str>>(entries: &[S]) -> Result<WeightedInputs> {
    let mut raw: BTreeMap<String, Vec<(InputValue, Option<f64>)>> = BTreeMap::new();
    for entry in entries {
        let entry = entry.as_ref();
        let (key, weighted) = entry
            .trim()
            .split_once('=')
            .ok_or_else(|| HarnessError::InvalidArgument(format!("Invalid input format: {entry}")))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(HarnessError::InvalidArgument(format!(
                "Invalid input format: {entry}"
            )));
        }
        let (value, weight) = parse_input_weight_percent(weighted)?;
        raw.entry(key.to_string())
            .or_default()
            .push((parse_input_value(value.trim()), weight));
    }
    make_weighted(raw)
}

/// `true`/`false` (any case), then integer, then float, else string.
pub fn parse_input_value(s: &str) -> InputValue {
    if s == OMIT {
        return InputValue::Omitted;
    }
    let value = match s.to_ascii_lowercase().as_str() {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => {
            if let Ok(i) = s.parse::<i64>() {
                Value::from(i)
            } else if let Some(f) = s
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .and_then(serde_json::Number::from_f64)
            {
                Value::Number(f)
            } else {
                Value::String(s.to_string())
            }
        }
    };
    InputValue::Value(value)
}

/// Split a trailing `^<weight>%` off `s`.
pub fn parse_input_weight_percent(s: &str) -> Result<(&str, Option<f64>)> {
    let Some((value, suffix)) = s.rsplit_once('^') else {
        return Ok((s, None));
    };
    let Some(percent) = suffix.strip_suffix('%') else {
        return Ok((s, None));
    };
    let weight: f64 = percent.trim().parse().map_err(|_| {
        HarnessError::InvalidArgument(format!("Failed to parse input value weight {percent}"))
    })?;
    if weight <= 0.0 {
        return Err(HarnessError::InvalidArgument(format!(
            "Invalid value weight {percent}, must be greater than 0"
        )));
    }
    if weight > 100.0 {
        return Err(HarnessError::InvalidArgument(format!(
            "Invalid value weight {percent}, must be less or equal to 100"
        )));
    }
    Ok((value, Some(weight)))
}

/// Resolve unweighted entries to an even share of each key's remainder.
pub fn make_weighted(raw: BTreeMap<String, Vec<(InputValue, Option<f64>)>>) -> Result<WeightedInputs> {
    let mut out = BTreeMap::new();
    for (key, entries) in raw {
        let explicit: f64 = entries.iter().filter_map(|(_, w)| *w).sum();
        if explicit > 100.0 + f64::EPSILON {
            return Err(HarnessError::InvalidArgument(format!(
                "Weights for input {key} sum to {explicit}%, more than 100%"
            )));
        }
        let unweighted = entries.iter().filter(|(_, w)| w.is_none()).count();
        let share = if unweighted > 0 {
            (100.0 - explicit).max(0.0) / unweighted as f64
        } else {
            0.0
        };
        let values = entries
            .into_iter()
            .map(|(value, weight)| WeightedValue {
                value,
                weight_percent: weight.unwrap_or(share),
            })
            .collect();
        out.insert(key, values);
    }
    Ok(WeightedInputs(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    #[test]
    fn values_parse_in_order() {
        assert_eq!(parse_input_value("True"), InputValue::Value(json!(true)));
        assert_eq!(parse_input_value("42"), InputValue::Value(json!(42)));
        assert_eq!(parse_input_value("0.5"), InputValue::Value(json!(0.5)));
        assert_eq!(parse_input_value("hello"), InputValue::Value(json!("hello")));
        assert_eq!(parse_input_value("(omit)"), InputValue::Omitted);
    }

    #[test]
    fn weight_suffix() {
        assert_eq!(parse_input_weight_percent("a^50%").unwrap(), ("a", Some(50.0)));
        assert_eq!(parse_input_weight_percent("a^b").unwrap(), ("a^b", None));
        assert_eq!(parse_input_weight_percent("plain").unwrap(), ("plain", None));
        assert!(parse_input_weight_percent("a^0%").is_err());
        assert!(parse_input_weight_percent("a^101%").is_err());
        assert!(parse_input_weight_percent("a^x%").is_err());
    }

    #[test]
    fn unweighted_entry_takes_the_remainder() {
        let inputs = parse_inputs(&["style=a^50%", "style=b"]).unwrap();
        let values = inputs.get("style").unwrap();
        assert_eq!(values[0].weight_percent, 50.0);
        assert_eq!(values[1].weight_percent, 50.0);
    }

    #[test]
    fn remainder_is_split_evenly() {
        let inputs = parse_inputs(&["k=a^40%", "k=b", "k=c"]).unwrap();
        let weights: Vec<f64> = inputs.get("k").unwrap().iter().map(|v| v.weight_percent).collect();
        assert_eq!(weights, vec![40.0, 30.0, 30.0]);
    }

    #[test]
    fn overweight_key_is_rejected() {
        assert!(parse_inputs(&["k=a^60%", "k=b^50%"]).is_err());
        assert!(parse_inputs(&["no-equals-sign"]).is_err());
    }

    #[test]
    fn first_values_and_omissions() {
        let inputs = parse_inputs(&["lora=(omit)^50%", "lora=x", "steps=20", "steps=30"]).unwrap();
        let fixed = inputs.first_values();
        assert_eq!(fixed.values, json!({"steps": 20}).as_object().unwrap().clone());
        assert_eq!(fixed.omitted, vec!["lora"]);
    }

    #[test]
    fn sampling_follows_weights() {
        let inputs = parse_inputs(&["k=a^80%", "k=b"]).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let draws = 10_000;
        let a = (0..draws)
            .filter(|_| inputs.sample(&mut rng).unwrap().values["k"] == json!("a"))
            .count();
        let ratio = a as f64 / draws as f64;
        assert!((ratio - 0.8).abs() < 0.03, "ratio was {ratio}");
    }

    #[test]
    fn merge_fixed_and_parsed() {
        let fixed = WeightedInputs::from_fixed(json!({"steps": 4}).as_object().unwrap());
        let parsed = parse_inputs(&["style=oil^70%", "style=ink", "prompt=cat"]).unwrap();
        let merged = fixed.merge(parsed).unwrap();
        assert_eq!(merged.get("steps").unwrap()[0].value, InputValue::Value(json!(4)));
        let style: Vec<f64> = merged.get("style").unwrap().iter().map(|v| v.weight_percent).collect();
        assert_eq!(style, vec![70.0, 30.0]);
        assert_eq!(merged.get("prompt").unwrap()[0].weight_percent, 100.0);
    }

    #[test]
    fn merge_rejects_key_on_both_sides() {
        let fixed = WeightedInputs::from_fixed(json!({"steps": 4}).as_object().unwrap());
        let parsed = parse_inputs(&["steps=8^90%", "prompt=cat"]).unwrap();
        let err = fixed.merge(parsed).unwrap_err();
        assert!(err.to_string().contains("input steps is given both"), "{err}");
    }
}
