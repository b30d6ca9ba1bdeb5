//! Sort compilation for the pipeline path.
//!
//! Enum attributes sort by declared value order, date attributes keep
//! missing values in their own group, and custom rules rank values by the
//! first matching case. Each of these needs a computed field, added by an
//! `$addFields` stage placed before the final `$sort`.

use serde_json::{json, Map, Value};

use crate::error::{AdapterError, AdapterResult};
use crate::model::{AttributeType, Hierarchy};
use crate::query::keys::translate_key;
use crate::query::{SortRules, SortSpec};

/// Prefix of computed sort fields; they are removed from results
pub const SORT_FIELD_PREFIX: &str = "__sort_";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SortPlan {
    /// Computed fields, evaluated before sorting
    pub computed: Map<String, Value>,
    /// Final `$sort` specification, in priority order
    pub sort: Map<String, Value>,
    /// At least one key reads joined documents
    pub joined: bool,
}

impl SortPlan {
    pub fn is_empty(&self) -> bool {
        self.sort.is_empty()
    }

    /// `$addFields` (when needed) followed by `$sort`
    pub fn stages(&self) -> Vec<Value> {
        let mut stages = Vec::new();
        if !self.computed.is_empty() {
            stages.push(json!({ "$addFields": self.computed }));
        }
        if !self.sort.is_empty() {
            stages.push(json!({ "$sort": self.sort }));
        }
        stages
    }
}

fn computed_name(kind: &str, key: &str) -> String {
    format!("{}{}{}", SORT_FIELD_PREFIX, kind, key.replace('.', "_"))
}

/// Whether sorting `key` on `class` needs a computed field.
pub fn needs_pipeline(hierarchy: &dyn Hierarchy, class: &str, key: &str, spec: &SortSpec) -> bool {
    match spec {
        SortSpec::Rules(_) => true,
        SortSpec::Order(_) => {
            key.starts_with(crate::query::LOOKUP_MARKER)
                || matches!(
                    hierarchy.resolve_attribute(class, key).map(|a| a.attribute().kind.clone()),
                    Some(AttributeType::Enum(_))
                )
        }
    }
}

pub fn plan_sort(
    hierarchy: &dyn Hierarchy,
    class: &str,
    keys: &[(String, SortSpec)],
) -> AdapterResult<SortPlan> {
    let mut plan = SortPlan::default();
    for (key, spec) in keys {
        let translated = translate_key(hierarchy, key, class, None);
        plan.joined |= translated.joined;
        let path = translated.path;
        let order = Value::from(spec.order().as_i64());

        if let SortSpec::Rules(rules) = spec {
            let field = computed_name("", key);
            plan.computed.insert(field.clone(), rules_expression(&path, rules)?);
            plan.sort.insert(field, order);
            continue;
        }

        let kind = if translated.joined {
            None
        } else {
            hierarchy
                .resolve_attribute(class, key)
                .map(|a| a.attribute().kind.clone())
        };
        match kind {
            Some(AttributeType::Enum(values)) => {
                let branches: Vec<Value> = values
                    .iter()
                    .enumerate()
                    .map(|(i, v)| {
                        json!({ "case": { "$eq": [format!("${}", path), v] }, "then": i })
                    })
                    .collect();
                let field = computed_name("", key);
                plan.computed.insert(
                    field.clone(),
                    json!({ "$switch": { "branches": branches, "default": values.len() } }),
                );
                plan.sort.insert(field, order);
            }
            Some(AttributeType::Date) => {
                let field = computed_name("isNull_", key);
                plan.computed.insert(
                    field.clone(),
                    json!({ "$eq": [{ "$ifNull": [format!("${}", path), null] }, null] }),
                );
                plan.sort.insert(field, order.clone());
                plan.sort.insert(path, order);
            }
            _ => {
                plan.sort.insert(path, order);
            }
        }
    }
    Ok(plan)
}

fn rules_expression(path: &str, rules: &SortRules) -> AdapterResult<Value> {
    let field = format!("${}", path);
    let mut branches = Vec::with_capacity(rules.cases.len());
    for case in &rules.cases {
        let condition = match &case.query {
            Value::Object(ops) if ops.len() == 1 && is_operator_object(ops) => {
                let (op, arg) = ops
                    .iter()
                    .next()
                    .ok_or_else(|| AdapterError::InvalidQuery("empty sort case".to_string()))?;
                match op.as_str() {
                    "$in" => json!({ "$in": [field, arg] }),
                    "$nin" => json!({ "$not": [{ "$in": [field, arg] }] }),
                    "$ne" => json!({ "$ne": [field, arg] }),
                    other => {
                        return Err(AdapterError::InvalidQuery(format!(
                            "unsupported sort case operator {}",
                            other
                        )))
                    }
                }
            }
            Value::Object(ops) if is_operator_object(ops) => {
                return Err(AdapterError::InvalidQuery(format!(
                    "sort case must have a single operator: {}",
                    case.query
                )))
            }
            literal => json!({ "$eq": [field, { "$literal": literal }] }),
        };
        branches.push(json!({ "case": condition, "then": case.index }));
    }
    let default = rules.default.unwrap_or(rules.cases.len() as i64);
    Ok(json!({ "$switch": { "branches": branches, "default": default } }))
}

fn is_operator_object(ops: &Map<String, Value>) -> bool {
    !ops.is_empty() && ops.keys().all(|k| k.starts_with('$'))
}

/// Drop computed sort fields from a result row.
pub fn strip_sort_fields(row: &mut Value) {
    if let Value::Object(map) = row {
        map.retain(|k, _| !k.starts_with(SORT_FIELD_PREFIX));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClassHierarchy, DOC_CLASS};
    use crate::native::expr::evaluate;
    use crate::native::SortOrder;
    use crate::query::SortCase;

    fn hierarchy() -> ClassHierarchy {
        ClassHierarchy::builder()
            .class("task:class:Task", DOC_CLASS, Some("task"))
            .attribute(
                "task:class:Task",
                "priority",
                AttributeType::Enum(vec!["low".into(), "medium".into(), "high".into()]),
            )
            .attribute("task:class:Task", "dueDate", AttributeType::Date)
            .attribute("task:class:Task", "title", AttributeType::Plain)
            .build()
            .unwrap()
    }

    #[test]
    fn test_enum_sort_uses_declared_order() {
        let h = hierarchy();
        let keys = vec![("priority".to_string(), SortSpec::Order(SortOrder::Descending))];
        let plan = plan_sort(&h, "task:class:Task", &keys).unwrap();
        let expr = &plan.computed["__sort_priority"];
        assert_eq!(evaluate(expr, &json!({"priority": "high"})).unwrap(), json!(2));
        assert_eq!(evaluate(expr, &json!({"priority": "other"})).unwrap(), json!(3));
        assert_eq!(plan.sort["__sort_priority"], json!(-1));
        assert!(needs_pipeline(&h, "task:class:Task", "priority", &keys[0].1));
    }

    #[test]
    fn test_date_sort_groups_nulls() {
        let h = hierarchy();
        let keys = vec![("dueDate".to_string(), SortSpec::Order(SortOrder::Ascending))];
        let plan = plan_sort(&h, "task:class:Task", &keys).unwrap();
        let order: Vec<&String> = plan.sort.keys().collect();
        assert_eq!(order, vec!["__sort_isNull_dueDate", "dueDate"]);
        assert_eq!(plan.stages().len(), 2);
        assert!(!needs_pipeline(&h, "task:class:Task", "dueDate", &keys[0].1));
    }

    #[test]
    fn test_rules_sort() {
        let h = hierarchy();
        let rules = SortRules {
            order: SortOrder::Ascending,
            cases: vec![
                SortCase { query: json!({"$in": ["a", "b"]}), index: 0 },
                SortCase { query: json!({"$ne": "z"}), index: 1 },
            ],
            default: None,
        };
        let keys = vec![("title".to_string(), SortSpec::Rules(rules))];
        let plan = plan_sort(&h, "task:class:Task", &keys).unwrap();
        let expr = &plan.computed["__sort_title"];
        assert_eq!(evaluate(expr, &json!({"title": "b"})).unwrap(), json!(0));
        assert_eq!(evaluate(expr, &json!({"title": "q"})).unwrap(), json!(1));
        assert_eq!(evaluate(expr, &json!({"title": "z"})).unwrap(), json!(2));
    }

    #[test]
    fn test_rules_compare_literal_objects() {
        let h = hierarchy();
        let rules = SortRules {
            order: SortOrder::Ascending,
            cases: vec![
                SortCase { query: json!({"a": 1}), index: 0 },
                SortCase { query: json!("$title"), index: 1 },
            ],
            default: None,
        };
        let keys = vec![("title".to_string(), SortSpec::Rules(rules))];
        let plan = plan_sort(&h, "task:class:Task", &keys).unwrap();
        let expr = &plan.computed["__sort_title"];
        assert_eq!(evaluate(expr, &json!({"title": {"a": 1}})).unwrap(), json!(0));
        assert_eq!(evaluate(expr, &json!({"title": {"a": 2}})).unwrap(), json!(2));
        assert_eq!(evaluate(expr, &json!({"title": "$title"})).unwrap(), json!(1));
    }

    #[test]
    fn test_rules_reject_unknown_operator() {
        let h = hierarchy();
        let rules = SortRules {
            order: SortOrder::Ascending,
            cases: vec![SortCase { query: json!({"$gt": 1}), index: 0 }],
            default: Some(5),
        };
        let keys = vec![("title".to_string(), SortSpec::Rules(rules))];
        assert!(plan_sort(&h, "task:class:Task", &keys).is_err());
    }

    #[test]
    fn test_plain_and_joined_keys() {
        let h = hierarchy();
        let keys = vec![
            ("$lookup.space.name".to_string(), SortSpec::Order(SortOrder::Ascending)),
            ("title".to_string(), SortSpec::Order(SortOrder::Descending)),
        ];
        let plan = plan_sort(&h, "task:class:Task", &keys).unwrap();
        assert!(plan.joined);
        assert!(plan.computed.is_empty());
        assert_eq!(plan.sort["space_lookup.name"], json!(1));
        assert_eq!(plan.sort["title"], json!(-1));
    }

    #[test]
    fn test_strip_sort_fields() {
        let mut row = json!({"_id": "a", "__sort_priority": 1, "__sort_isNull_due": false});
        strip_sort_fields(&mut row);
        assert_eq!(row, json!({"_id": "a"}));
    }
}
