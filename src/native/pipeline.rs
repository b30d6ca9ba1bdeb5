//! Aggregation pipeline stages: `$match`, `$lookup`, `$addFields`, `$sort`,
//! `$skip`, `$limit`, `$project`, `$count`.

use std::cmp::Ordering;

use serde_json::{Map, Value};

use crate::error::{NativeError, NativeResult};
use crate::native::expr::evaluate;
use crate::native::filter::{compare_values, matches, project, resolve_path, values_equal};
use crate::native::update::set_path;
use crate::native::SortOrder;

/// Run `pipeline` over `docs`. `source` returns the documents of another
/// domain for `$lookup`.
pub fn run_pipeline<S>(docs: Vec<Value>, pipeline: &[Value], source: &S) -> NativeResult<Vec<Value>>
where
    S: Fn(&str) -> Vec<Value>,
{
    let mut docs = docs;
    for stage in pipeline {
        let (name, spec) = stage
            .as_object()
            .filter(|m| m.len() == 1)
            .and_then(|m| m.iter().next())
            .ok_or_else(|| {
                NativeError::InvalidPipeline(format!("stage must have exactly one key: {}", stage))
            })?;
        docs = match name.as_str() {
            "$match" => {
                let mut kept = Vec::with_capacity(docs.len());
                for doc in docs {
                    if matches(&doc, spec)? {
                        kept.push(doc);
                    }
                }
                kept
            }
            "$lookup" => lookup_stage(docs, spec, source)?,
            "$addFields" | "$set" => {
                let fields = spec.as_object().ok_or_else(|| {
                    NativeError::InvalidPipeline("$addFields expects an object".to_string())
                })?;
                let mut out = Vec::with_capacity(docs.len());
                for mut doc in docs {
                    for (field, expr) in fields {
                        let value = evaluate(expr, &doc)?;
                        set_path(&mut doc, field, value)?;
                    }
                    out.push(doc);
                }
                out
            }
            "$sort" => {
                let keys = parse_sort(spec)?;
                sort_documents(&mut docs, &keys);
                docs
            }
            "$skip" => {
                let n = spec.as_u64().ok_or_else(|| {
                    NativeError::InvalidPipeline("$skip expects a number".to_string())
                })? as usize;
                docs.into_iter().skip(n).collect()
            }
            "$limit" => {
                let n = spec.as_u64().ok_or_else(|| {
                    NativeError::InvalidPipeline("$limit expects a number".to_string())
                })? as usize;
                docs.truncate(n);
                docs
            }
            "$project" => {
                let projection = spec.as_object().ok_or_else(|| {
                    NativeError::InvalidPipeline("$project expects an object".to_string())
                })?;
                docs.iter().map(|d| project(d, projection)).collect()
            }
            "$count" => {
                let field = spec.as_str().ok_or_else(|| {
                    NativeError::InvalidPipeline("$count expects a field name".to_string())
                })?;
                if docs.is_empty() {
                    Vec::new()
                } else {
                    let mut row = Map::new();
                    row.insert(field.to_string(), Value::from(docs.len() as u64));
                    vec![Value::Object(row)]
                }
            }
            other => {
                return Err(NativeError::InvalidPipeline(format!("unsupported stage {}", other)))
            }
        };
    }
    Ok(docs)
}

fn lookup_stage<S>(docs: Vec<Value>, spec: &Value, source: &S) -> NativeResult<Vec<Value>>
where
    S: Fn(&str) -> Vec<Value>,
{
    let from = lookup_field(spec, "from")?;
    let local_field = lookup_field(spec, "localField")?;
    let foreign_field = lookup_field(spec, "foreignField")?;
    let alias = lookup_field(spec, "as")?;
    let sub_pipeline: &[Value] = spec
        .get("pipeline")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);

    let foreign = source(from);
    let mut out = Vec::with_capacity(docs.len());
    for mut doc in docs {
        let mut locals: Vec<Value> = Vec::new();
        for v in resolve_path(&doc, local_field) {
            match v {
                Value::Array(items) => locals.extend(items.iter().cloned()),
                other => locals.push(other.clone()),
            }
        }
        let joined: Vec<Value> = foreign
            .iter()
            .filter(|f| {
                let values = resolve_path(f, foreign_field);
                locals.iter().any(|l| {
                    values.iter().any(|v| match v {
                        Value::Array(items) => items.iter().any(|i| values_equal(i, l)),
                        other => values_equal(other, l),
                    })
                })
            })
            .cloned()
            .collect();
        let joined = run_pipeline(joined, sub_pipeline, source)?;
        set_path(&mut doc, alias, Value::Array(joined))?;
        out.push(doc);
    }
    Ok(out)
}

fn lookup_field<'a>(spec: &'a Value, name: &str) -> NativeResult<&'a str> {
    spec.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| NativeError::InvalidPipeline(format!("$lookup requires '{}'", name)))
}

/// Parse a `$sort` specification (`{field: 1 | -1, ...}`), keeping key order.
pub fn parse_sort(spec: &Value) -> NativeResult<Vec<(String, SortOrder)>> {
    let map = spec
        .as_object()
        .ok_or_else(|| NativeError::InvalidPipeline("$sort expects an object".to_string()))?;
    map.iter()
        .map(|(k, v)| {
            SortOrder::from_value(v)
                .map(|o| (k.clone(), o))
                .ok_or_else(|| NativeError::InvalidPipeline(format!("bad sort direction for {}", k)))
        })
        .collect()
}

/// Stable sort on the first value at each key path.
pub fn sort_documents(docs: &mut [Value], keys: &[(String, SortOrder)]) {
    if keys.is_empty() {
        return;
    }
    docs.sort_by(|a, b| {
        for (key, order) in keys {
            let va = resolve_path(a, key).first().map(|v| (*v).clone()).unwrap_or(Value::Null);
            let vb = resolve_path(b, key).first().map(|v| (*v).clone()).unwrap_or(Value::Null);
            let ord = match order {
                SortOrder::Ascending => compare_values(&va, &vb),
                SortOrder::Descending => compare_values(&vb, &va),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spaces(domain: &str) -> Vec<Value> {
        match domain {
            "space" => vec![
                json!({"_id": "s1", "name": "One"}),
                json!({"_id": "s2", "name": "Two"}),
            ],
            "comment" => vec![
                json!({"_id": "c1", "_class": "C", "attachedTo": "t1"}),
                json!({"_id": "c2", "_class": "X", "attachedTo": "t1"}),
            ],
            _ => vec![],
        }
    }

    #[test]
    fn test_match_sort_limit() {
        let docs = vec![json!({"n": 3}), json!({"n": 1}), json!({"n": 2}), json!({"n": 9, "skip": true})];
        let out = run_pipeline(
            docs,
            &[
                json!({"$match": {"skip": {"$exists": false}}}),
                json!({"$sort": {"n": -1}}),
                json!({"$limit": 2}),
            ],
            &spaces,
        )
        .unwrap();
        assert_eq!(out, vec![json!({"n": 3}), json!({"n": 2})]);
    }

    #[test]
    fn test_lookup_with_sub_pipeline() {
        let docs = vec![json!({"_id": "t1", "space": "s2"})];
        let out = run_pipeline(
            docs,
            &[
                json!({"$lookup": {"from": "space", "localField": "space", "foreignField": "_id", "as": "space_lookup"}}),
                json!({"$lookup": {"from": "comment", "localField": "_id", "foreignField": "attachedTo", "as": "comments",
                    "pipeline": [{"$match": {"_class": {"$in": ["C"]}}}]}}),
            ],
            &spaces,
        )
        .unwrap();
        assert_eq!(out[0]["space_lookup"], json!([{"_id": "s2", "name": "Two"}]));
        assert_eq!(out[0]["comments"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_add_fields_and_count() {
        let docs = vec![json!({"s": "b"}), json!({"s": "a"})];
        let out = run_pipeline(
            docs.clone(),
            &[
                json!({"$addFields": {"rank": {"$cond": [{"$eq": ["$s", "a"]}, 0, 1]}}}),
                json!({"$sort": {"rank": 1}}),
            ],
            &spaces,
        )
        .unwrap();
        assert_eq!(out[0]["s"], "a");

        let counted = run_pipeline(docs, &[json!({"$count": "total"})], &spaces).unwrap();
        assert_eq!(counted, vec![json!({"total": 2})]);
        let empty = run_pipeline(vec![], &[json!({"$count": "total"})], &spaces).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_sort_keeps_key_order() {
        let mut docs = vec![
            json!({"a": 1, "b": 2}),
            json!({"a": 0, "b": 9}),
            json!({"a": 1, "b": 1}),
        ];
        let keys = parse_sort(&json!({"a": -1, "b": 1})).unwrap();
        sort_documents(&mut docs, &keys);
        assert_eq!(docs[0], json!({"a": 1, "b": 1}));
        assert_eq!(docs[2], json!({"a": 0, "b": 9}));
    }

    #[test]
    fn test_unknown_stage() {
        assert!(run_pipeline(vec![], &[json!({"$facet": {}})], &spaces).is_err());
    }
}
