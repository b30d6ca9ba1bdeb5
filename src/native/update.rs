//! Update-document application: `$set`, `$unset`, `$inc`, `$push`, `$pull`,
//! `$addToSet`, the positional `$` path segment, and whole-document
//! replacement.

use serde_json::{Map, Value};

use crate::error::{NativeError, NativeResult};
use crate::native::filter::{first_matching_index, is_operator_object, matches, matches_operators, values_equal};

/// Apply `update` to `doc`. `filter` is the filter that selected the
/// document; it resolves positional `$` segments.
///
/// Returns whether the document changed.
pub fn apply_update(doc: &mut Value, update: &Value, filter: &Value) -> NativeResult<bool> {
    let ops = update
        .as_object()
        .ok_or_else(|| NativeError::InvalidOperator("update must be an object".to_string()))?;
    let before = doc.clone();

    if !ops.keys().any(|k| k.starts_with('$')) {
        let id = doc.get("_id").cloned();
        let mut replacement = update.clone();
        if let (Some(id), Some(map)) = (id, replacement.as_object_mut()) {
            map.insert("_id".to_string(), id);
        }
        *doc = replacement;
        return Ok(*doc != before);
    }

    for (op, fields) in ops {
        let fields = fields.as_object().ok_or_else(|| {
            NativeError::InvalidOperator(format!("{} expects an object", op))
        })?;
        for (raw_path, arg) in fields {
            let path = resolve_positional(&before, filter, raw_path)?;
            match op.as_str() {
                "$set" => set_path(doc, &path, arg.clone())?,
                "$unset" => {
                    remove_path(doc, &path);
                }
                "$inc" => {
                    let delta = arg.as_f64().ok_or_else(|| {
                        NativeError::InvalidOperator("$inc expects a number".to_string())
                    })?;
                    let current = get_path(doc, &path).cloned().unwrap_or(Value::Null);
                    let next = match (&current, arg) {
                        (Value::Null, _) => arg.clone(),
                        (Value::Number(c), _) if c.is_i64() && arg.is_i64() => {
                            Value::from(c.as_i64().unwrap_or(0) + arg.as_i64().unwrap_or(0))
                        }
                        (Value::Number(c), _) => number(c.as_f64().unwrap_or(0.0) + delta),
                        _ => {
                            return Err(NativeError::InvalidOperator(format!(
                                "$inc on non-numeric field {}",
                                path
                            )))
                        }
                    };
                    set_path(doc, &path, next)?;
                }
                "$push" | "$addToSet" => {
                    let (values, position) = push_arguments(arg)?;
                    let array = array_at(doc, &path)?;
                    let mut insert_at = match position {
                        None => array.len(),
                        Some(p) if p < 0 => array.len().saturating_sub(p.unsigned_abs() as usize),
                        Some(p) => (p as usize).min(array.len()),
                    };
                    for value in values {
                        if op == "$addToSet" && array.iter().any(|v| values_equal(v, &value)) {
                            continue;
                        }
                        array.insert(insert_at, value);
                        insert_at += 1;
                    }
                }
                "$pull" => {
                    if let Some(Value::Array(items)) = get_path_mut(doc, &path) {
                        let mut kept = Vec::with_capacity(items.len());
                        for item in items.drain(..) {
                            if !pull_matches(&item, arg)? {
                                kept.push(item);
                            }
                        }
                        *items = kept;
                    }
                }
                other => return Err(NativeError::InvalidOperator(other.to_string())),
            }
        }
    }
    Ok(*doc != before)
}

fn number(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn push_arguments(arg: &Value) -> NativeResult<(Vec<Value>, Option<i64>)> {
    match arg {
        Value::Object(map) if map.contains_key("$each") => {
            let values = map
                .get("$each")
                .and_then(Value::as_array)
                .cloned()
                .ok_or_else(|| NativeError::InvalidOperator("$each expects an array".to_string()))?;
            let position = map.get("$position").and_then(Value::as_i64);
            Ok((values, position))
        }
        other => Ok((vec![other.clone()], None)),
    }
}

fn pull_matches(item: &Value, cond: &Value) -> NativeResult<bool> {
    match cond {
        Value::Object(ops) if is_operator_object(cond) => matches_operators(&[item], ops),
        Value::Object(_) if item.is_object() => matches(item, cond),
        _ => Ok(values_equal(item, cond)),
    }
}

/// Replace a positional `$` segment with the index of the first element
/// matched by `filter`.
fn resolve_positional(doc: &Value, filter: &Value, path: &str) -> NativeResult<String> {
    let segments: Vec<&str> = path.split('.').collect();
    let Some(pos) = segments.iter().position(|s| *s == "$") else {
        return Ok(path.to_string());
    };
    let array_path = segments[..pos].join(".");
    let index = first_matching_index(doc, filter, &array_path)?.ok_or_else(|| {
        NativeError::InvalidOperator(format!(
            "positional operator found no match for '{}'",
            array_path
        ))
    })?;
    let mut resolved: Vec<String> = segments.iter().map(|s| s.to_string()).collect();
    resolved[pos] = index.to_string();
    Ok(resolved.join("."))
}

fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn get_path_mut<'a>(doc: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get_mut(segment)?,
            Value::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Set `value` at a dotted path, creating intermediate objects.
pub fn set_path(doc: &mut Value, path: &str, value: Value) -> NativeResult<()> {
    let mut current = doc;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let last = segments.peek().is_none();
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        current = match current {
            Value::Object(map) => {
                if last {
                    map.insert(segment.to_string(), value);
                    return Ok(());
                }
                map.entry(segment.to_string())
                    .or_insert_with(|| Value::Object(Map::new()))
            }
            Value::Array(items) => {
                let index = segment.parse::<usize>().map_err(|_| {
                    NativeError::InvalidOperator(format!("cannot set '{}' inside an array", path))
                })?;
                let slot = items.get_mut(index).ok_or_else(|| {
                    NativeError::InvalidOperator(format!("index {} out of range in '{}'", index, path))
                })?;
                if last {
                    *slot = value;
                    return Ok(());
                }
                slot
            }
            _ => {
                return Err(NativeError::InvalidOperator(format!(
                    "cannot create field in '{}' on a scalar",
                    path
                )))
            }
        };
    }
    Ok(())
}

/// Remove the value at a dotted path, returning it.
pub fn remove_path(doc: &mut Value, path: &str) -> Option<Value> {
    match path.rsplit_once('.') {
        None => doc.as_object_mut()?.remove(path),
        Some((parent, key)) => match get_path_mut(doc, parent)? {
            Value::Object(map) => map.remove(key),
            _ => None,
        },
    }
}

fn array_at<'a>(doc: &'a mut Value, path: &str) -> NativeResult<&'a mut Vec<Value>> {
    if get_path(doc, path).map(Value::is_null).unwrap_or(true) {
        set_path(doc, path, Value::Array(Vec::new()))?;
    }
    match get_path_mut(doc, path) {
        Some(Value::Array(items)) => Ok(items),
        _ => Err(NativeError::InvalidOperator(format!(
            "field '{}' is not an array",
            path
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn update(doc: &mut Value, upd: Value) -> bool {
        let filter = json!({"_id": doc["_id"].clone()});
        apply_update(doc, &upd, &filter).unwrap()
    }

    #[test]
    fn test_set_and_unset_nested() {
        let mut d = json!({"_id": "a", "x": 1});
        assert!(update(&mut d, json!({"$set": {"mix.hours": 3, "x": 2}})));
        assert_eq!(d, json!({"_id": "a", "x": 2, "mix": {"hours": 3}}));
        update(&mut d, json!({"$unset": {"mix.hours": ""}}));
        assert_eq!(d["mix"], json!({}));
    }

    #[test]
    fn test_inc() {
        let mut d = json!({"_id": "a", "n": 1});
        update(&mut d, json!({"$inc": {"n": 2, "m": 1}}));
        assert_eq!(d["n"], json!(3));
        assert_eq!(d["m"], json!(1));
    }

    #[test]
    fn test_push_with_position_and_pull() {
        let mut d = json!({"_id": "a", "arr": ["x", "y", "z"]});
        update(&mut d, json!({"$pull": {"arr": "z"}}));
        update(&mut d, json!({"$push": {"arr": {"$each": ["z"], "$position": 0}}}));
        assert_eq!(d["arr"], json!(["z", "x", "y"]));
        update(&mut d, json!({"$push": {"new": 1}}));
        assert_eq!(d["new"], json!([1]));
    }

    #[test]
    fn test_pull_with_condition() {
        let mut d = json!({"_id": "a", "arr": [1, 5, 9], "objs": [{"k": 1}, {"k": 2}]});
        update(&mut d, json!({"$pull": {"arr": {"$gt": 4}, "objs": {"k": 2}}}));
        assert_eq!(d["arr"], json!([1]));
        assert_eq!(d["objs"], json!([{"k": 1}]));
    }

    #[test]
    fn test_positional_update() {
        let mut d = json!({"_id": "a", "items": [{"k": 1, "v": "x"}, {"k": 2, "v": "y"}]});
        let filter = json!({"_id": "a", "items": {"$elemMatch": {"k": 2}}});
        apply_update(&mut d, &json!({"$set": {"items.$.v": "z"}}), &filter).unwrap();
        assert_eq!(d["items"][1]["v"], "z");
        assert_eq!(d["items"][0]["v"], "x");
    }

    #[test]
    fn test_positional_without_match_fails() {
        let mut d = json!({"_id": "a", "items": [{"k": 1}]});
        let filter = json!({"_id": "a", "items.k": 5});
        assert!(apply_update(&mut d, &json!({"$set": {"items.$.k": 0}}), &filter).is_err());
    }

    #[test]
    fn test_replacement_keeps_id() {
        let mut d = json!({"_id": "a", "x": 1});
        update(&mut d, json!({"y": 2}));
        assert_eq!(d, json!({"y": 2, "_id": "a"}));
    }

    #[test]
    fn test_unchanged_reports_false() {
        let mut d = json!({"_id": "a", "x": 1});
        assert!(!update(&mut d, json!({"$set": {"x": 1}})));
    }
}
