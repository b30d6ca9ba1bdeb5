//! Filter evaluation over JSON documents.
//!
//! Implements the query dialect used in `$match` stages, `find` and write
//! filters:
//! - path resolution through nested objects and arrays
//! - equality with array membership semantics
//! - `$eq`, `$ne`, `$in`, `$nin`, `$exists`, `$gt`, `$gte`, `$lt`, `$lte`
//! - `$regex` / `$options`, `$elemMatch`, `$size`, `$not`
//! - `$and`, `$or`, `$nor`

use std::cmp::Ordering;

use regex::RegexBuilder;
use serde_json::{Map, Value};

use crate::error::{NativeError, NativeResult};

/// Resolve a dotted path, fanning out through arrays.
///
/// Numeric segments index into arrays; any other segment applied to an
/// array is applied to each of its elements.
pub fn resolve_path<'a>(doc: &'a Value, path: &str) -> Vec<&'a Value> {
    let mut current = vec![doc];
    for segment in path.split('.') {
        let mut next = Vec::new();
        for value in current {
            step(value, segment, &mut next);
        }
        if next.is_empty() {
            return next;
        }
        current = next;
    }
    current
}

fn step<'a>(value: &'a Value, segment: &str, out: &mut Vec<&'a Value>) {
    match value {
        Value::Object(map) => {
            if let Some(v) = map.get(segment) {
                out.push(v);
            }
        }
        Value::Array(items) => {
            if let Ok(index) = segment.parse::<usize>() {
                if let Some(v) = items.get(index) {
                    out.push(v);
                }
            } else {
                for item in items {
                    if let Value::Object(map) = item {
                        if let Some(v) = map.get(segment) {
                            out.push(v);
                        }
                    }
                }
            }
        }
        _ => {}
    }
}

/// First value at `path`, or `Null` when missing
pub fn get_field_value(doc: &Value, path: &str) -> Value {
    resolve_path(doc, path)
        .first()
        .map(|v| (*v).clone())
        .unwrap_or(Value::Null)
}

/// Compare two JSON values for equality, numbers by value.
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

/// Total order over JSON values: values of different types order by type
/// (null < numbers < strings < objects < arrays < booleans).
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Number(a), Value::Number(b)) => {
            let a_f64 = a.as_f64().unwrap_or(0.0);
            let b_f64 = b.as_f64().unwrap_or(0.0);
            a_f64.partial_cmp(&b_f64).unwrap_or(Ordering::Equal)
        }
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Array(a), Value::Array(b)) => {
            for (x, y) in a.iter().zip(b.iter()) {
                let ord = compare_values(x, y);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            a.len().cmp(&b.len())
        }
        (Value::Object(a), Value::Object(b)) => {
            for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                let ord = ka.cmp(kb).then_with(|| compare_values(va, vb));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            a.len().cmp(&b.len())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Whether an object consists only of `$operator` keys
pub fn is_operator_object(value: &Value) -> bool {
    match value {
        Value::Object(map) => !map.is_empty() && map.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

/// Evaluate `filter` against `doc`.
pub fn matches(doc: &Value, filter: &Value) -> NativeResult<bool> {
    let filter = match filter {
        Value::Object(map) => map,
        Value::Null => return Ok(true),
        other => {
            return Err(NativeError::InvalidOperator(format!(
                "filter must be an object, got {}",
                other
            )))
        }
    };

    for (key, cond) in filter {
        let ok = match key.as_str() {
            "$and" => {
                let mut all = true;
                for sub in as_filter_list(key, cond)? {
                    if !matches(doc, sub)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => {
                let mut any = false;
                for sub in as_filter_list(key, cond)? {
                    if matches(doc, sub)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$nor" => {
                let mut none = true;
                for sub in as_filter_list(key, cond)? {
                    if matches(doc, sub)? {
                        none = false;
                        break;
                    }
                }
                none
            }
            k if k.starts_with('$') => {
                return Err(NativeError::InvalidOperator(k.to_string()));
            }
            path => matches_field(doc, path, cond)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn as_filter_list<'a>(op: &str, value: &'a Value) -> NativeResult<&'a Vec<Value>> {
    value
        .as_array()
        .ok_or_else(|| NativeError::InvalidOperator(format!("{} expects an array", op)))
}

fn matches_field(doc: &Value, path: &str, cond: &Value) -> NativeResult<bool> {
    let values = resolve_path(doc, path);
    match cond {
        Value::Object(ops) if is_operator_object(cond) => matches_operators(&values, ops),
        _ => Ok(equals_any(&values, cond)),
    }
}

/// Evaluate an operator object against the values found at a path.
pub fn matches_operators(values: &[&Value], ops: &Map<String, Value>) -> NativeResult<bool> {
    for (op, arg) in ops {
        let ok = match op.as_str() {
            "$eq" => equals_any(values, arg),
            "$ne" => !equals_any(values, arg),
            "$in" => in_list(values, arg, op)?,
            "$nin" => !in_list(values, arg, op)?,
            "$exists" => {
                let wanted = arg.as_bool().unwrap_or(true);
                values.is_empty() != wanted
            }
            "$gt" => compare_any(values, arg, |o| o == Ordering::Greater),
            "$gte" => compare_any(values, arg, |o| o != Ordering::Less),
            "$lt" => compare_any(values, arg, |o| o == Ordering::Less),
            "$lte" => compare_any(values, arg, |o| o != Ordering::Greater),
            "$regex" => {
                let pattern = arg.as_str().ok_or_else(|| {
                    NativeError::InvalidOperator("$regex expects a string".to_string())
                })?;
                let options = ops.get("$options").and_then(Value::as_str).unwrap_or("");
                let regex = RegexBuilder::new(pattern)
                    .case_insensitive(options.contains('i'))
                    .multi_line(options.contains('m'))
                    .size_limit(1 << 20)
                    .build()
                    .map_err(|e| NativeError::InvalidOperator(format!("$regex: {}", e)))?;
                candidates(values)
                    .into_iter()
                    .any(|v| v.as_str().map(|s| regex.is_match(s)).unwrap_or(false))
            }
            "$options" => true,
            "$elemMatch" => {
                let mut found = false;
                'outer: for value in values {
                    if let Value::Array(items) = value {
                        for item in items {
                            let hit = match arg {
                                Value::Object(sub) if is_operator_object(arg) => {
                                    matches_operators(&[item], sub)?
                                }
                                _ => item.is_object() && matches(item, arg)?,
                            };
                            if hit {
                                found = true;
                                break 'outer;
                            }
                        }
                    }
                }
                found
            }
            "$size" => {
                let wanted = arg.as_u64().ok_or_else(|| {
                    NativeError::InvalidOperator("$size expects a number".to_string())
                })?;
                values
                    .iter()
                    .any(|v| v.as_array().map(|a| a.len() as u64 == wanted).unwrap_or(false))
            }
            "$not" => match arg {
                Value::Object(sub) => !matches_operators(values, sub)?,
                _ => {
                    return Err(NativeError::InvalidOperator(
                        "$not expects an operator object".to_string(),
                    ))
                }
            },
            other => return Err(NativeError::InvalidOperator(other.to_string())),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

/// The values themselves plus the elements of array values
fn candidates<'a>(values: &[&'a Value]) -> Vec<&'a Value> {
    let mut out = Vec::with_capacity(values.len());
    for value in values {
        out.push(*value);
        if let Value::Array(items) = value {
            out.extend(items.iter());
        }
    }
    out
}

fn equals_any(values: &[&Value], expected: &Value) -> bool {
    if values.is_empty() {
        return expected.is_null();
    }
    candidates(values)
        .into_iter()
        .any(|v| values_equal(v, expected))
}

fn in_list(values: &[&Value], arg: &Value, op: &str) -> NativeResult<bool> {
    let list = arg
        .as_array()
        .ok_or_else(|| NativeError::InvalidOperator(format!("{} expects an array", op)))?;
    Ok(list.iter().any(|expected| equals_any(values, expected)))
}

fn compare_any<F>(values: &[&Value], arg: &Value, accept: F) -> bool
where
    F: Fn(Ordering) -> bool,
{
    candidates(values).into_iter().any(|v| {
        type_rank(v) == type_rank(arg) && !v.is_null() && accept(compare_values(v, arg))
    })
}

/// Index of the first array element satisfying the filter conditions
/// addressed at `array_path` (through `$elemMatch` or dotted sub-paths).
pub fn first_matching_index(
    doc: &Value,
    filter: &Value,
    array_path: &str,
) -> NativeResult<Option<usize>> {
    let Some(items) = resolve_path(doc, array_path)
        .into_iter()
        .find_map(Value::as_array)
    else {
        return Ok(None);
    };
    let Some(filter) = filter.as_object() else {
        return Ok(None);
    };

    let prefix = format!("{}.", array_path);
    let mut element_filter = Map::new();
    let mut elem_match: Option<&Value> = None;
    for (key, cond) in filter {
        if key == array_path {
            if let Some(em) = cond.get("$elemMatch") {
                elem_match = Some(em);
                continue;
            }
            // plain equality on the array matches the element itself
            element_filter.insert(String::new(), cond.clone());
        } else if let Some(rest) = key.strip_prefix(&prefix) {
            element_filter.insert(rest.to_string(), cond.clone());
        }
    }
    if elem_match.is_none() && element_filter.is_empty() {
        return Ok(None);
    }

    for (index, item) in items.iter().enumerate() {
        if let Some(em) = elem_match {
            let hit = match em {
                Value::Object(sub) if is_operator_object(em) => matches_operators(&[item], sub)?,
                _ => matches(item, em)?,
            };
            if !hit {
                continue;
            }
        }
        let mut ok = true;
        for (sub_path, cond) in &element_filter {
            let hit = if sub_path.is_empty() {
                match cond {
                    Value::Object(ops) if is_operator_object(cond) => {
                        matches_operators(&[item], ops)?
                    }
                    _ => values_equal(item, cond),
                }
            } else {
                matches_field(item, sub_path, cond)?
            };
            if !hit {
                ok = false;
                break;
            }
        }
        if ok {
            return Ok(Some(index));
        }
    }
    Ok(None)
}

/// Apply an inclusion or exclusion projection.
pub fn project(doc: &Value, projection: &Map<String, Value>) -> Value {
    let Value::Object(source) = doc else {
        return doc.clone();
    };
    let truthy = |v: &Value| match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        _ => true,
    };
    let inclusive = projection
        .iter()
        .any(|(k, v)| k != "_id" && truthy(v));

    if inclusive {
        let mut out = Map::new();
        let keep_id = projection.get("_id").map(truthy).unwrap_or(true);
        if keep_id {
            if let Some(id) = source.get("_id") {
                out.insert("_id".to_string(), id.clone());
            }
        }
        for (path, flag) in projection {
            if path == "_id" || !truthy(flag) {
                continue;
            }
            copy_path(source, &mut out, path);
        }
        Value::Object(out)
    } else {
        let mut out = doc.clone();
        for (path, flag) in projection {
            if !truthy(flag) {
                crate::native::update::remove_path(&mut out, path);
            }
        }
        out
    }
}

fn copy_path(source: &Map<String, Value>, out: &mut Map<String, Value>, path: &str) {
    match path.split_once('.') {
        None => {
            if let Some(v) = source.get(path) {
                out.insert(path.to_string(), v.clone());
            }
        }
        Some((head, rest)) => {
            if let Some(Value::Object(inner)) = source.get(head) {
                let entry = out
                    .entry(head.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                if let Value::Object(target) = entry {
                    copy_path(inner, target, rest);
                }
            }
        }
    }
}
