//! Class-scoped filter compilation.

use std::collections::BTreeSet;

use serde_json::{Map, Value};

use crate::error::AdapterResult;
use crate::model::document::{CLASS_FIELD, SPACE_FIELD};
use crate::model::{ClassRef, Hierarchy, DOC_CLASS};
use crate::query::keys::translate_key;

const LOGICAL_OPERATORS: [&str; 3] = ["$and", "$or", "$nor"];

/// Compiled filter, split by when it can be applied
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompiledFilter {
    /// Conditions on stored fields
    pub base: Map<String, Value>,
    /// Conditions on joined documents, valid only once lookups ran
    pub lookup: Map<String, Value>,
}

impl CompiledFilter {
    /// Both parts as one native filter
    pub fn merged(&self) -> Value {
        let mut all = self.base.clone();
        for (k, v) in &self.lookup {
            all.insert(k.clone(), v.clone());
        }
        Value::Object(all)
    }
}

/// Compile `query` against `class`.
///
/// Every key is translated to its stored path, `$like` patterns become
/// anchored case-insensitive regexes, and unless `skip_class` is set the
/// `_class` condition is narrowed to the concrete descendants of the
/// class's base class.
pub fn compile_filter(
    hierarchy: &dyn Hierarchy,
    class: &str,
    query: &Map<String, Value>,
    skip_class: bool,
    skip_space: bool,
) -> AdapterResult<CompiledFilter> {
    let mut compiled = CompiledFilter::default();
    let mut mixins: BTreeSet<ClassRef> = BTreeSet::new();

    for (key, value) in query {
        if LOGICAL_OPERATORS.contains(&key.as_str()) {
            let (arms, joined) = translate_arms(hierarchy, class, value);
            if joined {
                compiled.lookup.insert(key.clone(), arms);
            } else {
                compiled.base.insert(key.clone(), arms);
            }
            continue;
        }
        let value = translate_value(value);
        let translated = translate_key(hierarchy, key, class, Some(&mut mixins));
        if translated.joined {
            compiled.lookup.insert(translated.path, value);
        } else {
            compiled.base.insert(translated.path, value);
        }
    }

    if !skip_class {
        let base_class = hierarchy.base_class(class)?;
        if base_class != DOC_CLASS {
            let classes = hierarchy.concrete_descendants(&base_class);
            let scoped = scope_classes(compiled.base.get(CLASS_FIELD), &classes);
            compiled.base.insert(CLASS_FIELD.to_string(), scoped);
            if base_class != class && !mixins.contains(class) {
                let mut exists = Map::new();
                exists.insert("$exists".to_string(), Value::Bool(true));
                compiled
                    .base
                    .insert(class.to_string(), Value::Object(exists));
            }
        } else {
            compiled.base.remove(CLASS_FIELD);
        }
    }

    if skip_space {
        compiled.base.remove(SPACE_FIELD);
    }

    Ok(compiled)
}

/// Translate the keys inside the arms of a logical operator. Mixins named
/// in an arm do not count as required, so they are not recorded.
fn translate_arms(hierarchy: &dyn Hierarchy, class: &str, value: &Value) -> (Value, bool) {
    let Value::Array(arms) = value else {
        return (translate_value(value), false);
    };
    let mut joined = false;
    let mut out = Vec::with_capacity(arms.len());
    for arm in arms {
        let Value::Object(conditions) = arm else {
            out.push(arm.clone());
            continue;
        };
        let mut translated_arm = Map::new();
        for (key, cond) in conditions {
            if LOGICAL_OPERATORS.contains(&key.as_str()) {
                let (nested, nested_joined) = translate_arms(hierarchy, class, cond);
                joined |= nested_joined;
                translated_arm.insert(key.clone(), nested);
                continue;
            }
            let translated = translate_key(hierarchy, key, class, None);
            joined |= translated.joined;
            translated_arm.insert(translated.path, translate_value(cond));
        }
        out.push(Value::Object(translated_arm));
    }
    (Value::Array(out), joined)
}

fn class_set(classes: &[ClassRef]) -> Value {
    if classes.len() == 1 {
        return Value::String(classes[0].clone());
    }
    let mut set = Map::new();
    set.insert(
        "$in".to_string(),
        Value::Array(classes.iter().cloned().map(Value::String).collect()),
    );
    Value::Object(set)
}

fn scope_classes(requested: Option<&Value>, classes: &[ClassRef]) -> Value {
    match requested {
        None => class_set(classes),
        Some(Value::String(class)) => {
            if classes.contains(class) {
                Value::String(class.clone())
            } else {
                class_set(classes)
            }
        }
        Some(Value::Object(ops)) => {
            let mut kept: Vec<ClassRef> = classes.to_vec();
            if let Some(Value::Array(include)) = ops.get("$in") {
                kept.retain(|c| include.iter().any(|i| i.as_str() == Some(c.as_str())));
            }
            if let Some(Value::Array(exclude)) = ops.get("$nin") {
                kept.retain(|c| !exclude.iter().any(|e| e.as_str() == Some(c.as_str())));
            }
            class_set(&kept)
        }
        Some(other) => {
            tracing::warn!("Unsupported _class condition {}, scoping to descendants", other);
            class_set(classes)
        }
    }
}

/// Rewrite `$like` patterns, recursing through logical operators.
fn translate_value(value: &Value) -> Value {
    match value {
        Value::Object(map) if map.contains_key("$like") => {
            let mut out = Map::new();
            for (k, v) in map {
                if k == "$like" {
                    let pattern = v.as_str().map(like_to_regex).unwrap_or_default();
                    out.insert("$regex".to_string(), Value::String(pattern));
                    out.insert("$options".to_string(), Value::String("i".to_string()));
                } else {
                    out.insert(k.clone(), v.clone());
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| match item {
                    Value::Object(m) => Value::Object(
                        m.iter().map(|(k, v)| (k.clone(), translate_value(v))).collect(),
                    ),
                    other => other.clone(),
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

/// `%` is the wildcard; everything else matches literally.
pub fn like_to_regex(pattern: &str) -> String {
    let body: Vec<String> = pattern.split('%').map(regex::escape).collect();
    format!("^{}$", body.join(".*"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttributeType, ClassHierarchy};
    use serde_json::json;

    fn hierarchy() -> ClassHierarchy {
        ClassHierarchy::builder()
            .class("A", DOC_CLASS, Some("task"))
            .class("B", "A", None)
            .class("C", "A", None)
            .mixin("M", "A")
            .attribute("M", "hours", AttributeType::Plain)
            .build()
            .unwrap()
    }

    fn compile(class: &str, query: Value) -> CompiledFilter {
        let h = hierarchy();
        compile_filter(&h, class, query.as_object().unwrap(), false, false).unwrap()
    }

    #[test]
    fn test_injects_descendants() {
        let f = compile("A", json!({}));
        assert_eq!(f.base["_class"], json!({"$in": ["A", "B", "C"]}));
        let leaf = compile("B", json!({}));
        assert_eq!(leaf.base["_class"], json!("B"));
    }

    #[test]
    fn test_compiling_twice_is_stable() {
        let h = hierarchy();
        let once = compile_filter(&h, "A", &Map::new(), false, false).unwrap();
        let twice = compile_filter(&h, "A", &once.base, false, false).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_explicit_class_kept_or_replaced() {
        assert_eq!(compile("A", json!({"_class": "B"})).base["_class"], json!("B"));
        assert_eq!(
            compile("A", json!({"_class": "Z"})).base["_class"],
            json!({"$in": ["A", "B", "C"]})
        );
    }

    #[test]
    fn test_class_sets_intersect_and_collapse() {
        let f = compile("A", json!({"_class": {"$in": ["B", "Z"]}}));
        assert_eq!(f.base["_class"], json!("B"));
        let f = compile("A", json!({"_class": {"$nin": ["A"]}}));
        assert_eq!(f.base["_class"], json!({"$in": ["B", "C"]}));
    }

    #[test]
    fn test_skip_class_and_space() {
        let h = hierarchy();
        let q = json!({"_class": "B", "space": "s1"});
        let f = compile_filter(&h, "A", q.as_object().unwrap(), true, true).unwrap();
        assert_eq!(f.base["_class"], json!("B"));
        assert!(!f.base.contains_key("space"));
    }

    #[test]
    fn test_mixin_query_requires_namespace() {
        let f = compile("M", json!({}));
        assert_eq!(f.base["M"], json!({"$exists": true}));
        let f = compile("M", json!({"hours": 3}));
        assert_eq!(f.base["M.hours"], json!(3));
        assert!(!f.base.contains_key("M"));
    }

    #[test]
    fn test_lookup_keys_are_split_out() {
        let f = compile("A", json!({"$lookup.space.name": "Team", "title": "x"}));
        assert_eq!(f.lookup["space_lookup.name"], json!("Team"));
        assert_eq!(f.base["title"], json!("x"));
        assert_eq!(f.merged()["space_lookup.name"], json!("Team"));
    }

    #[test]
    fn test_logical_arms_are_translated() {
        let f = compile("M", json!({"$or": [{"hours": 1}, {"title": {"$like": "a%"}}]}));
        assert_eq!(
            f.base["$or"],
            json!([{"M.hours": 1}, {"title": {"$regex": "^a.*$", "$options": "i"}}])
        );
        // an optional arm does not imply the mixin
        assert_eq!(f.base["M"], json!({"$exists": true}));
        assert!(f.lookup.is_empty());

        let f = compile("A", json!({"$and": [{"$lookup.space.name": "Team"}, {"n": 1}]}));
        assert_eq!(f.lookup["$and"], json!([{"space_lookup.name": "Team"}, {"n": 1}]));
        assert!(!f.base.contains_key("$and"));
    }

    #[test]
    fn test_like_pattern() {
        let regex = like_to_regex("te%st");
        assert_eq!(regex, "^te.*st$");
        let re = regex::RegexBuilder::new(&regex).case_insensitive(true).build().unwrap();
        assert!(re.is_match("test"));
        assert!(re.is_match("teXXXst"));
        assert!(re.is_match("TEST"));
        assert!(!re.is_match("Xtest"));
        assert_eq!(like_to_regex("a.b%"), "^a\\.b.*$");

        let f = compile("A", json!({"title": {"$like": "te%st"}}));
        assert_eq!(f.base["title"], json!({"$regex": "^te.*st$", "$options": "i"}));
    }

    #[test]
    fn test_root_class_drops_class_condition() {
        let f = compile(DOC_CLASS, json!({"_class": "B"}));
        assert!(!f.base.contains_key("_class"));
    }
}
