// Tagged result values for transform evaluation.

use std::collections::BTreeMap;

/// Result of evaluating a transform (sub)expression.
///
/// `Undefined` is distinct from `Null`: it is what a missing field path
/// evaluates to, and it disappears when the value is materialised as JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Object(BTreeMap<String, Value>),
    List(Vec<Value>),
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
    Undefined,
}

impl Value {
    pub fn from_json(value: &serde_json::Value) -> Value {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Num(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Materialise as JSON. `Undefined` yields `None`; inside objects the
    /// key is dropped, inside lists the element is dropped.
    pub fn into_json(self) -> Option<serde_json::Value> {
        match self {
            Value::Undefined => None,
            Value::Null => Some(serde_json::Value::Null),
            Value::Bool(b) => Some(serde_json::Value::Bool(b)),
            Value::Num(n) => Some(number_to_json(n)),
            Value::Str(s) => Some(serde_json::Value::String(s)),
            Value::List(items) => Some(serde_json::Value::Array(
                items.into_iter().filter_map(Value::into_json).collect(),
            )),
            Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (k, v) in map {
                    if let Some(json) = v.into_json() {
                        out.insert(k, json);
                    }
                }
                Some(serde_json::Value::Object(out))
            }
        }
    }

    /// Truthiness for conditionals: empty, zero, null and undefined are
    /// false, everything else is true.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Num(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Object(map) => !map.is_empty(),
            Value::Null | Value::Undefined => false,
        }
    }

    pub const fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }
}

/// Render an f64 the way JSON renders it: integral values without the
/// trailing `.0`.
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

fn number_to_json(n: f64) -> serde_json::Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        serde_json::Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_round_trip() {
        let json = json!({"a": 1, "b": [true, "x"], "c": null});
        let value = Value::from_json(&json);
        assert_eq!(value.into_json().unwrap(), json);
    }

    #[test]
    fn undefined_keys_are_dropped_from_objects() {
        let value = Value::Object(BTreeMap::from([
            ("keep".to_owned(), Value::Num(1.0)),
            ("drop".to_owned(), Value::Undefined),
        ]));
        assert_eq!(value.into_json().unwrap(), json!({"keep": 1}));
    }

    #[test]
    fn integral_numbers_render_without_decimal_point() {
        assert_eq!(format_number(1374.0), "1374");
        assert_eq!(format_number(13.5), "13.5");
        assert_eq!(Value::Num(7.0).into_json().unwrap(), json!(7));
    }

    #[test]
    fn truthiness() {
        assert!(Value::Bool(true).is_truthy());
        assert!(Value::Str("x".to_owned()).is_truthy());
        assert!(!Value::Str(String::new()).is_truthy());
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Undefined.is_truthy());
        assert!(!Value::Num(0.0).is_truthy());
    }
}
