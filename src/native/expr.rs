//! Aggregation expression evaluation for `$addFields` stages.

use std::cmp::Ordering;

use serde_json::{Map, Value};

use crate::error::{NativeError, NativeResult};
use crate::native::filter::{compare_values, get_field_value, values_equal};

/// Evaluate an expression against a document.
///
/// `"$path"` strings read fields (missing fields read as `null`), objects
/// with a single `$operator` key apply the operator, other objects and
/// arrays are evaluated element-wise and everything else is a literal.
pub fn evaluate(expr: &Value, doc: &Value) -> NativeResult<Value> {
    match expr {
        Value::String(s) if s.starts_with('$') && s.len() > 1 => {
            Ok(get_field_value(doc, &s[1..]))
        }
        Value::Object(map) if map.len() == 1 && map.keys().all(|k| k.starts_with('$')) => {
            let (op, arg) = map.iter().next().ok_or_else(|| {
                NativeError::InvalidPipeline("empty expression".to_string())
            })?;
            evaluate_operator(op, arg, doc)
        }
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(k.clone(), evaluate(v, doc)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => items
            .iter()
            .map(|item| evaluate(item, doc))
            .collect::<NativeResult<Vec<_>>>()
            .map(Value::Array),
        literal => Ok(literal.clone()),
    }
}

/// Truthiness as the aggregation dialect defines it
pub fn to_bool(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        _ => true,
    }
}

fn args<'a>(op: &str, arg: &'a Value, arity: usize) -> NativeResult<&'a [Value]> {
    match arg.as_array() {
        Some(items) if items.len() == arity => Ok(items.as_slice()),
        _ => Err(NativeError::InvalidPipeline(format!(
            "{} expects {} arguments",
            op, arity
        ))),
    }
}

fn compare_args(op: &str, arg: &Value, doc: &Value) -> NativeResult<Ordering> {
    let items = args(op, arg, 2)?;
    let left = evaluate(&items[0], doc)?;
    let right = evaluate(&items[1], doc)?;
    Ok(compare_values(&left, &right))
}

fn evaluate_operator(op: &str, arg: &Value, doc: &Value) -> NativeResult<Value> {
    let result = match op {
        "$literal" => arg.clone(),
        "$eq" | "$ne" => {
            let items = args(op, arg, 2)?;
            let equal = values_equal(&evaluate(&items[0], doc)?, &evaluate(&items[1], doc)?);
            Value::Bool(if op == "$eq" { equal } else { !equal })
        }
        "$gt" => Value::Bool(compare_args(op, arg, doc)? == Ordering::Greater),
        "$gte" => Value::Bool(compare_args(op, arg, doc)? != Ordering::Less),
        "$lt" => Value::Bool(compare_args(op, arg, doc)? == Ordering::Less),
        "$lte" => Value::Bool(compare_args(op, arg, doc)? != Ordering::Greater),
        "$in" => {
            let items = args(op, arg, 2)?;
            let needle = evaluate(&items[0], doc)?;
            let haystack = evaluate(&items[1], doc)?;
            let list = haystack.as_array().ok_or_else(|| {
                NativeError::InvalidPipeline("$in expects an array operand".to_string())
            })?;
            Value::Bool(list.iter().any(|v| values_equal(v, &needle)))
        }
        "$not" => {
            let inner = match arg {
                Value::Array(items) if items.len() == 1 => &items[0],
                other => other,
            };
            Value::Bool(!to_bool(&evaluate(inner, doc)?))
        }
        "$and" | "$or" => {
            let items = arg.as_array().ok_or_else(|| {
                NativeError::InvalidPipeline(format!("{} expects an array", op))
            })?;
            let mut acc = op == "$and";
            for item in items {
                let value = to_bool(&evaluate(item, doc)?);
                if op == "$and" && !value {
                    acc = false;
                    break;
                }
                if op == "$or" && value {
                    acc = true;
                    break;
                }
            }
            Value::Bool(acc)
        }
        "$ifNull" => {
            let items = args(op, arg, 2)?;
            let first = evaluate(&items[0], doc)?;
            if first.is_null() {
                evaluate(&items[1], doc)?
            } else {
                first
            }
        }
        "$cond" => {
            let (cond, then, otherwise) = match arg {
                Value::Array(items) if items.len() == 3 => (&items[0], &items[1], &items[2]),
                Value::Object(map) => (
                    map.get("if").unwrap_or(&Value::Null),
                    map.get("then").unwrap_or(&Value::Null),
                    map.get("else").unwrap_or(&Value::Null),
                ),
                _ => {
                    return Err(NativeError::InvalidPipeline(
                        "$cond expects [if, then, else]".to_string(),
                    ))
                }
            };
            if to_bool(&evaluate(cond, doc)?) {
                evaluate(then, doc)?
            } else {
                evaluate(otherwise, doc)?
            }
        }
        "$switch" => {
            let branches = arg
                .get("branches")
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    NativeError::InvalidPipeline("$switch expects branches".to_string())
                })?;
            for branch in branches {
                let case = branch.get("case").unwrap_or(&Value::Null);
                if to_bool(&evaluate(case, doc)?) {
                    return evaluate(branch.get("then").unwrap_or(&Value::Null), doc);
                }
            }
            match arg.get("default") {
                Some(default) => evaluate(default, doc)?,
                None => {
                    return Err(NativeError::InvalidPipeline(
                        "$switch matched no branch and has no default".to_string(),
                    ))
                }
            }
        }
        other => return Err(NativeError::InvalidPipeline(format!("unknown expression {}", other))),
    };
    Ok(result)
}
