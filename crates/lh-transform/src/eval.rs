// Evaluator: walks an expression tree against a JSON payload.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::TransformError;
use crate::parser::{BinOp, Expr};
use crate::value::{Value, format_number};

/// Evaluate `expr` against `payload`.
///
/// Missing field paths evaluate to [`Value::Undefined`]; arithmetic on
/// non-numbers is an error.
pub fn apply(expr: &Expr, payload: &serde_json::Value) -> Result<Value, TransformError> {
    match expr {
        Expr::Str(s) => Ok(Value::Str(s.clone())),
        Expr::Num(n) => Ok(Value::Num(*n)),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Null => Ok(Value::Null),
        Expr::Object(fields) => {
            let mut out = BTreeMap::new();
            for (key, value) in fields {
                out.insert(key.clone(), apply(value, payload)?);
            }
            Ok(Value::Object(out))
        }
        Expr::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(apply(item, payload)?);
            }
            Ok(Value::List(out))
        }
        Expr::Path(parts) => Ok(lookup_path(payload, parts)),
        Expr::Neg(inner) => match apply(inner, payload)? {
            Value::Num(n) => Ok(Value::Num(-n)),
            Value::Undefined => Ok(Value::Undefined),
            other => Err(TransformError::TypeMismatch(format!(
                "cannot negate {}",
                kind_name(&other)
            ))),
        },
        Expr::Binary { op, lhs, rhs } => {
            let left = apply(lhs, payload)?;
            let right = apply(rhs, payload)?;
            binary(op, left, right)
        }
        Expr::Cond {
            cond,
            then,
            otherwise,
        } => {
            if apply(cond, payload)?.is_truthy() {
                apply(then, payload)
            } else {
                apply(otherwise, payload)
            }
        }
        Expr::Call { name, args } => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(apply(arg, payload)?);
            }
            call(name, values)
        }
    }
}

fn lookup_path(payload: &serde_json::Value, parts: &[String]) -> Value {
    let mut current = payload;
    for part in parts {
        match current.get(part) {
            Some(next) => current = next,
            None => return Value::Undefined,
        }
    }
    Value::from_json(current)
}

fn binary(op: &BinOp, left: Value, right: Value) -> Result<Value, TransformError> {
    match op {
        BinOp::Concat => Ok(Value::Str(format!(
            "{}{}",
            concat_text(&left),
            concat_text(&right)
        ))),
        BinOp::Eq => Ok(eq(&left, &right).map_or(Value::Undefined, Value::Bool)),
        BinOp::Ne => Ok(eq(&left, &right).map_or(Value::Undefined, |b| Value::Bool(!b))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => order(op, &left, &right),
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div => arith(op, &left, &right),
    }
}

/// Equality: same-kind values compare by value, mismatched kinds are simply
/// unequal, and an undefined operand makes the whole comparison undefined.
fn eq(left: &Value, right: &Value) -> Option<bool> {
    if left.is_undefined() || right.is_undefined() {
        return None;
    }
    Some(match (left, right) {
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::Num(a), Value::Num(b)) => a == b,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Null, Value::Null) => true,
        (Value::List(a), Value::List(b)) => a == b,
        (Value::Object(a), Value::Object(b)) => a == b,
        _ => false,
    })
}

fn order(op: &BinOp, left: &Value, right: &Value) -> Result<Value, TransformError> {
    if left.is_undefined() || right.is_undefined() {
        return Ok(Value::Undefined);
    }
    let ordering = match (left, right) {
        (Value::Num(a), Value::Num(b)) => a.partial_cmp(b),
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        _ => {
            return Err(TransformError::TypeMismatch(format!(
                "cannot order {} against {}",
                kind_name(left),
                kind_name(right)
            )));
        }
    };
    let Some(ordering) = ordering else {
        return Ok(Value::Bool(false));
    };
    let result = match op {
        BinOp::Lt => ordering.is_lt(),
        BinOp::Le => ordering.is_le(),
        BinOp::Gt => ordering.is_gt(),
        BinOp::Ge => ordering.is_ge(),
        _ => unreachable!("order called with non-ordering op"),
    };
    Ok(Value::Bool(result))
}

fn arith(op: &BinOp, left: &Value, right: &Value) -> Result<Value, TransformError> {
    if left.is_undefined() || right.is_undefined() {
        return Ok(Value::Undefined);
    }
    let (Value::Num(a), Value::Num(b)) = (left, right) else {
        return Err(TransformError::TypeMismatch(format!(
            "arithmetic needs numbers, got {} and {}",
            kind_name(left),
            kind_name(right)
        )));
    };
    let n = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => a / b,
        _ => unreachable!("arith called with non-arithmetic op"),
    };
    Ok(Value::Num(n))
}

/// Stringification used by `&`: undefined disappears, scalars render bare.
fn concat_text(value: &Value) -> String {
    match value {
        Value::Undefined => String::new(),
        other => to_text(other),
    }
}

fn to_text(value: &Value) -> String {
    match value {
        Value::Str(s) => s.clone(),
        Value::Num(n) => format_number(*n),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_owned(),
        Value::Undefined => String::new(),
        other => other
            .clone()
            .into_json()
            .map(|j| j.to_string())
            .unwrap_or_default(),
    }
}

fn call(name: &str, mut args: Vec<Value>) -> Result<Value, TransformError> {
    let arity = |expected: usize, args: &[Value]| -> Result<(), TransformError> {
        if args.len() == expected {
            Ok(())
        } else {
            Err(TransformError::Arity {
                name: name.to_owned(),
                expected,
                got: args.len(),
            })
        }
    };

    match name {
        "string" => {
            arity(1, &args)?;
            Ok(match &args[0] {
                Value::Undefined => Value::Undefined,
                other => Value::Str(to_text(other)),
            })
        }
        "number" => {
            arity(1, &args)?;
            match &args[0] {
                Value::Num(n) => Ok(Value::Num(*n)),
                Value::Str(s) => s.trim().parse::<f64>().map(Value::Num).map_err(|_| {
                    TransformError::BadArgument {
                        name: name.to_owned(),
                        msg: format!("`{s}` is not a number"),
                    }
                }),
                Value::Bool(b) => Ok(Value::Num(if *b { 1.0 } else { 0.0 })),
                Value::Undefined => Ok(Value::Undefined),
                other => Err(TransformError::BadArgument {
                    name: name.to_owned(),
                    msg: format!("cannot convert {} to a number", kind_name(other)),
                }),
            }
        }
        "lowercase" | "uppercase" => {
            arity(1, &args)?;
            match &args[0] {
                Value::Str(s) => Ok(Value::Str(if name == "lowercase" {
                    s.to_lowercase()
                } else {
                    s.to_uppercase()
                })),
                Value::Undefined => Ok(Value::Undefined),
                other => Err(TransformError::BadArgument {
                    name: name.to_owned(),
                    msg: format!("expected a string, got {}", kind_name(other)),
                }),
            }
        }
        "fromEpoch" => {
            arity(1, &args)?;
            match args.remove(0) {
                Value::Num(n) => from_epoch(n).ok_or_else(|| TransformError::BadArgument {
                    name: name.to_owned(),
                    msg: format!("{n} is out of timestamp range"),
                }),
                Value::Str(s) => {
                    let n = s
                        .trim()
                        .parse::<f64>()
                        .map_err(|_| TransformError::BadArgument {
                            name: name.to_owned(),
                            msg: format!("`{s}` is not an epoch number"),
                        })?;
                    from_epoch(n).ok_or_else(|| TransformError::BadArgument {
                        name: name.to_owned(),
                        msg: format!("{n} is out of timestamp range"),
                    })
                }
                Value::Undefined => Ok(Value::Undefined),
                other => Err(TransformError::BadArgument {
                    name: name.to_owned(),
                    msg: format!("expected an epoch number, got {}", kind_name(&other)),
                }),
            }
        }
        "substring" => {
            if args.len() != 2 && args.len() != 3 {
                return Err(TransformError::Arity {
                    name: name.to_owned(),
                    expected: 2,
                    got: args.len(),
                });
            }
            let (text, rest) = args.split_first().expect("arity checked");
            match text {
                Value::Str(s) => {
                    let Value::Num(start) = &rest[0] else {
                        return Err(TransformError::BadArgument {
                            name: name.to_owned(),
                            msg: "start must be a number".to_owned(),
                        });
                    };
                    let chars: Vec<char> = s.chars().collect();
                    let start = (*start).max(0.0) as usize;
                    let len = match rest.get(1) {
                        Some(Value::Num(len)) => (*len).max(0.0) as usize,
                        Some(other) => {
                            return Err(TransformError::BadArgument {
                                name: name.to_owned(),
                                msg: format!("length must be a number, got {}", kind_name(other)),
                            });
                        }
                        None => chars.len().saturating_sub(start),
                    };
                    Ok(Value::Str(
                        chars.iter().skip(start).take(len).collect::<String>(),
                    ))
                }
                Value::Undefined => Ok(Value::Undefined),
                other => Err(TransformError::BadArgument {
                    name: name.to_owned(),
                    msg: format!("expected a string, got {}", kind_name(other)),
                }),
            }
        }
        "contains" => {
            arity(2, &args)?;
            match (&args[0], &args[1]) {
                (Value::Str(s), Value::Str(needle)) => Ok(Value::Bool(s.contains(needle))),
                (Value::Undefined, _) | (_, Value::Undefined) => Ok(Value::Undefined),
                (a, b) => Err(TransformError::BadArgument {
                    name: name.to_owned(),
                    msg: format!("expected strings, got {} and {}", kind_name(a), kind_name(b)),
                }),
            }
        }
        "replace" => {
            arity(3, &args)?;
            match (&args[0], &args[1], &args[2]) {
                (Value::Str(s), Value::Str(from), Value::Str(to)) => {
                    Ok(Value::Str(s.replace(from.as_str(), to)))
                }
                (Value::Undefined, ..) => Ok(Value::Undefined),
                (a, b, c) => Err(TransformError::BadArgument {
                    name: name.to_owned(),
                    msg: format!(
                        "expected strings, got {}, {} and {}",
                        kind_name(a),
                        kind_name(b),
                        kind_name(c)
                    ),
                }),
            }
        }
        "now" => {
            arity(0, &args)?;
            Ok(Value::Str(
                Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            ))
        }
        "exists" => {
            arity(1, &args)?;
            Ok(Value::Bool(!args[0].is_undefined()))
        }
        other => Err(TransformError::UnknownFunction(other.to_owned())),
    }
}

/// Unix epoch → RFC-3339. Values at or above 1e12 are taken as milliseconds.
fn from_epoch(n: f64) -> Option<Value> {
    let millis = if n.abs() >= 1.0e12 { n } else { n * 1000.0 };
    let timestamp = DateTime::<Utc>::from_timestamp_millis(millis as i64)?;
    Some(Value::Str(
        timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
    ))
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Object(_) => "object",
        Value::List(_) => "list",
        Value::Str(_) => "string",
        Value::Num(_) => "number",
        Value::Bool(_) => "boolean",
        Value::Null => "null",
        Value::Undefined => "undefined",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform;
    use serde_json::json;

    #[test]
    fn github_pr_transform_end_to_end() {
        let payload = json!({
            "action": "opened",
            "pull_request": {"id": 1374, "created_at": "2025-06-03T15:45:02Z"},
            "repository": {"id": 987},
        });
        let result = transform(
            r#"{"publisher": "github",
                "resource": {"type": "pull_request", "id": pull_request.id},
                "action": action = "opened" ? "created" : "updated",
                "timestamp": pull_request.created_at}"#,
            &payload,
        )
        .unwrap()
        .into_json()
        .unwrap();
        assert_eq!(result["publisher"], "github");
        assert_eq!(result["resource"]["id"], 1374);
        assert_eq!(result["action"], "created");
        assert_eq!(result["timestamp"], "2025-06-03T15:45:02Z");
    }

    #[test]
    fn stripe_epoch_timestamp_translates_to_iso8601() {
        let payload = json!({
            "id": "evt_X",
            "type": "payment_intent.succeeded",
            "created": 1_759_961_327,
            "data": {"object": {"id": "pi_ABC", "amount": 7500}},
        });
        let result = transform(
            r#"{"publisher": "stripe",
                "resource": {"type": "payment_intent", "id": data.object.id},
                "action": "updated",
                "timestamp": $fromEpoch(created)}"#,
            &payload,
        )
        .unwrap()
        .into_json()
        .unwrap();
        assert_eq!(result["resource"]["id"], "pi_ABC");
        assert_eq!(result["timestamp"], "2025-10-08T22:08:47Z");
    }

    #[test]
    fn missing_path_is_undefined_not_an_error() {
        let value = transform("a.b.c", &json!({"a": {}})).unwrap();
        assert_eq!(value, Value::Undefined);
    }

    #[test]
    fn arithmetic_type_mismatch_is_an_error() {
        let err = transform(r#"1 + "x""#, &json!({})).unwrap_err();
        assert!(matches!(err, TransformError::TypeMismatch(_)));
    }

    #[test]
    fn arithmetic_with_undefined_operand_is_undefined() {
        let value = transform("missing + 1", &json!({})).unwrap();
        assert_eq!(value, Value::Undefined);
    }

    #[test]
    fn conditional_chain_falls_through_to_default() {
        let payload = json!({"action": "closed"});
        let value = transform(
            r#"action = "opened" ? "created" : action = "edited" ? "updated" : "deleted""#,
            &payload,
        )
        .unwrap();
        assert_eq!(value, Value::Str("deleted".to_owned()));
    }

    #[test]
    fn comparison_against_missing_field_selects_the_else_branch() {
        let value = transform(r#"nope = "x" ? "then" : "else""#, &json!({})).unwrap();
        assert_eq!(value, Value::Str("else".to_owned()));
    }

    #[test]
    fn concat_builds_strings_from_mixed_parts() {
        let value = transform(r#""pr-" & pull_request.id"#, &json!({"pull_request": {"id": 7}}))
            .unwrap();
        assert_eq!(value, Value::Str("pr-7".to_owned()));
    }

    #[test]
    fn millisecond_epochs_are_detected() {
        let value = transform("$fromEpoch(ts)", &json!({"ts": 1_759_961_327_000_i64})).unwrap();
        assert_eq!(value, Value::Str("2025-10-08T22:08:47Z".to_owned()));
    }

    #[test]
    fn numeric_ordering() {
        let payload = json!({"amount": 1500});
        assert_eq!(
            transform("amount > 1000", &payload).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            transform("amount <= 1000", &payload).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn string_functions() {
        let payload = json!({"ref": "refs/heads/release/2.6.2"});
        assert_eq!(
            transform(r#"$replace(ref, "refs/heads/", "")"#, &payload).unwrap(),
            Value::Str("release/2.6.2".to_owned())
        );
        assert_eq!(
            transform(r#"$contains(ref, "release")"#, &payload).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            transform(r#"$substring(ref, 0, 4)"#, &payload).unwrap(),
            Value::Str("refs".to_owned())
        );
        assert_eq!(
            transform(r#"$substring(ref, 5)"#, &payload).unwrap(),
            Value::Str("heads/release/2.6.2".to_owned())
        );
        // Undefined inputs stay undefined rather than erroring.
        assert_eq!(
            transform(r#"$contains(missing, "x")"#, &payload).unwrap(),
            Value::Undefined
        );
    }

    #[test]
    fn unknown_function_is_reported_by_name() {
        let err = transform("$bogus(1)", &json!({})).unwrap_err();
        assert_eq!(err, TransformError::UnknownFunction("bogus".to_owned()));
    }
}
