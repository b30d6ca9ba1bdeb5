//! Join planning and the fill pass that attaches joined documents.
//!
//! Joins run as `$lookup` stages writing into alias fields on each row
//! (`space_lookup`, `_id_comments_lookup`, ...). Once the pipeline returns,
//! [`fill_lookups`] moves the joined documents under the row's `$lookup`
//! object and drops the aliases:
//! - forward references: absent, a single document, or an array when
//!   several documents matched
//! - reverse references: always an array under `$lookup._id.<name>`

use serde_json::{json, Map, Value};

use crate::error::AdapterResult;
use crate::model::document::{ID_FIELD, LOOKUP_FIELD};
use crate::model::{ClassRef, Domain, Hierarchy, ModelLookup, MODEL_DOMAIN};
use crate::native::filter::{resolve_path, values_equal};
use crate::query::keys::{forward_alias, reverse_alias, translate_key};
use crate::query::{LookupSpec, DEFAULT_REVERSE_ATTRIBUTE};

/// A compiled join
#[derive(Debug, Clone, PartialEq)]
pub struct LookupStep {
    pub from: Domain,
    pub local_field: String,
    pub foreign_field: String,
    pub alias: String,
    /// Restrict joined documents to these classes
    pub classes: Option<Vec<ClassRef>>,
}

impl LookupStep {
    pub fn to_stage(&self) -> Value {
        let mut lookup = json!({
            "from": self.from,
            "localField": self.local_field,
            "foreignField": self.foreign_field,
            "as": self.alias,
        });
        if let (Some(classes), Some(map)) = (&self.classes, lookup.as_object_mut()) {
            map.insert(
                "pipeline".to_string(),
                json!([{ "$match": { "_class": { "$in": classes } } }]),
            );
        }
        json!({ "$lookup": lookup })
    }
}

fn nested_alias(parent: Option<&str>, alias: String) -> String {
    match parent {
        Some(parent) => format!("{}_{}", parent, alias),
        None => alias,
    }
}

/// Expand `spec` on `class` into join steps, parents before children.
pub fn plan_lookups(
    hierarchy: &dyn Hierarchy,
    class: &str,
    spec: &LookupSpec,
) -> AdapterResult<Vec<LookupStep>> {
    let mut steps = Vec::new();
    plan_level(hierarchy, class, spec, None, &mut steps)?;
    Ok(steps)
}

fn plan_level(
    hierarchy: &dyn Hierarchy,
    class: &str,
    spec: &LookupSpec,
    parent: Option<&str>,
    steps: &mut Vec<LookupStep>,
) -> AdapterResult<()> {
    for (key, forward) in &spec.forward {
        let domain = hierarchy.domain(&forward.class)?;
        if domain == MODEL_DOMAIN {
            continue;
        }
        let local = translate_key(hierarchy, key, class, None).path;
        let alias = nested_alias(parent, forward_alias(key));
        steps.push(LookupStep {
            from: domain,
            local_field: match parent {
                Some(p) => format!("{}.{}", p, local),
                None => local,
            },
            foreign_field: ID_FIELD.to_string(),
            alias: alias.clone(),
            classes: None,
        });
        if let Some(nested) = &forward.nested {
            plan_level(hierarchy, &forward.class, nested, Some(&alias), steps)?;
        }
    }

    for (key, reverse) in &spec.reverse {
        let domain = hierarchy.domain(&reverse.class)?;
        if domain == MODEL_DOMAIN {
            tracing::warn!(
                "Reverse lookup '{}' targets model class {}, skipping",
                key,
                reverse.class
            );
            continue;
        }
        steps.push(LookupStep {
            from: domain,
            local_field: match parent {
                Some(p) => format!("{}.{}", p, ID_FIELD),
                None => ID_FIELD.to_string(),
            },
            foreign_field: reverse
                .attribute
                .clone()
                .unwrap_or_else(|| DEFAULT_REVERSE_ATTRIBUTE.to_string()),
            alias: nested_alias(parent, reverse_alias(key)),
            classes: Some(hierarchy.concrete_descendants(&reverse.class)),
        });
    }
    Ok(())
}

/// Move joined documents from their alias fields into `$lookup`.
pub fn fill_lookups(
    hierarchy: &dyn Hierarchy,
    model: Option<&dyn ModelLookup>,
    class: &str,
    spec: &LookupSpec,
    steps: &[LookupStep],
    row: &mut Value,
) -> AdapterResult<()> {
    let Value::Object(doc) = row else {
        return Ok(());
    };
    let mut joined = Map::new();
    for step in steps {
        if let Some(value) = doc.remove(&step.alias) {
            joined.insert(step.alias.clone(), value);
        }
    }
    fill_level(hierarchy, model, class, spec, doc, &joined, None)
}

fn candidates<'a>(joined: &'a Map<String, Value>, alias: &str) -> &'a [Value] {
    joined
        .get(alias)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn referenced_ids(doc: &Value, path: &str) -> Vec<Value> {
    let mut ids = Vec::new();
    for value in resolve_path(doc, path) {
        match value {
            Value::Array(items) => ids.extend(items.iter().cloned()),
            Value::Null => {}
            other => ids.push(other.clone()),
        }
    }
    ids
}

fn lookup_slot(doc: &mut Map<String, Value>) -> &mut Value {
    let slot = doc
        .entry(LOOKUP_FIELD.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    slot
}

fn fill_level(
    hierarchy: &dyn Hierarchy,
    model: Option<&dyn ModelLookup>,
    class: &str,
    spec: &LookupSpec,
    doc: &mut Map<String, Value>,
    joined: &Map<String, Value>,
    parent: Option<&str>,
) -> AdapterResult<()> {
    for (key, forward) in &spec.forward {
        let local = translate_key(hierarchy, key, class, None).path;
        let ids = referenced_ids(&Value::Object(doc.clone()), &local);
        if ids.is_empty() {
            continue;
        }

        let mut found: Vec<Value> = Vec::new();
        if hierarchy.domain(&forward.class)? == MODEL_DOMAIN {
            if let Some(model) = model {
                for id in ids.iter().filter_map(Value::as_str) {
                    if let Some(model_doc) = model.find_one(&forward.class, id) {
                        found.push(model_doc.to_value());
                    }
                }
            }
        } else {
            let alias = nested_alias(parent, forward_alias(key));
            for candidate in candidates(joined, &alias) {
                let id = candidate.get(ID_FIELD).unwrap_or(&Value::Null);
                if ids.iter().any(|i| values_equal(i, id)) {
                    let mut candidate = candidate.clone();
                    if let (Some(nested), Value::Object(sub)) = (&forward.nested, &mut candidate) {
                        fill_level(hierarchy, model, &forward.class, nested, sub, joined, Some(&alias))?;
                    }
                    found.push(candidate);
                }
            }
        }

        let value = match found.len() {
            0 => continue,
            1 => found.remove(0),
            _ => Value::Array(found),
        };
        if let Value::Object(slot) = lookup_slot(doc) {
            slot.insert(key.clone(), value);
        }
    }

    if spec.reverse.is_empty() {
        return Ok(());
    }
    let own_id = doc.get(ID_FIELD).cloned().unwrap_or(Value::Null);
    for (key, reverse) in &spec.reverse {
        let alias = nested_alias(parent, reverse_alias(key));
        let attribute = reverse
            .attribute
            .as_deref()
            .unwrap_or(DEFAULT_REVERSE_ATTRIBUTE);
        let related: Vec<Value> = candidates(joined, &alias)
            .iter()
            .filter(|c| {
                resolve_path(c, attribute).into_iter().any(|v| match v {
                    Value::Array(items) => items.iter().any(|i| values_equal(i, &own_id)),
                    other => values_equal(other, &own_id),
                })
            })
            .cloned()
            .collect();
        if let Value::Object(slot) = lookup_slot(doc) {
            let by_id = slot
                .entry(ID_FIELD.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(by_id) = by_id {
                by_id.insert(key.clone(), Value::Array(related));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttributeType, ClassHierarchy, Document, DOC_CLASS};

    fn hierarchy() -> ClassHierarchy {
        ClassHierarchy::builder()
            .class("core:class:Space", DOC_CLASS, Some("space"))
            .class("core:class:Status", DOC_CLASS, Some(MODEL_DOMAIN))
            .class("contact:class:Person", DOC_CLASS, Some("contact"))
            .class("task:class:Task", DOC_CLASS, Some("task"))
            .class("chunter:class:Comment", DOC_CLASS, Some("chunter"))
            .class("chunter:class:Reply", "chunter:class:Comment", None)
            .attribute("core:class:Space", "owner", AttributeType::Ref("contact:class:Person".into()))
            .build()
            .unwrap()
    }

    struct Statuses;

    impl ModelLookup for Statuses {
        fn find_one(&self, class: &str, id: &str) -> Option<Document> {
            (id == "open").then(|| Document::new(id, class, "model").with("name", json!("Open")))
        }
    }

    #[test]
    fn test_plan_forward_nested_and_reverse() {
        let h = hierarchy();
        let spec = LookupSpec::new()
            .forward_nested(
                "space",
                "core:class:Space",
                LookupSpec::new().forward("owner", "contact:class:Person"),
            )
            .forward("status", "core:class:Status")
            .reverse("comments", "chunter:class:Comment", None);
        let steps = plan_lookups(&h, "task:class:Task", &spec).unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].alias, "space_lookup");
        assert_eq!(steps[1].local_field, "space_lookup.owner");
        assert_eq!(steps[1].alias, "space_lookup_owner_lookup");
        assert_eq!(steps[2].foreign_field, "attachedTo");
        assert_eq!(
            steps[2].classes,
            Some(vec!["chunter:class:Comment".to_string(), "chunter:class:Reply".to_string()])
        );
        assert_eq!(
            steps[2].to_stage()["$lookup"]["pipeline"][0]["$match"]["_class"]["$in"][1],
            "chunter:class:Reply"
        );
    }

    #[test]
    fn test_fill_promotes_and_groups() {
        let h = hierarchy();
        let spec = LookupSpec::new()
            .forward_nested(
                "space",
                "core:class:Space",
                LookupSpec::new().forward("owner", "contact:class:Person"),
            )
            .forward("status", "core:class:Status")
            .reverse("comments", "chunter:class:Comment", None);
        let steps = plan_lookups(&h, "task:class:Task", &spec).unwrap();
        let mut row = json!({
            "_id": "t1", "_class": "task:class:Task", "space": "s1", "status": "open",
            "space_lookup": [{"_id": "s1", "owner": "p1"}],
            "space_lookup_owner_lookup": [{"_id": "p1", "name": "Ann"}],
            "_id_comments_lookup": [{"_id": "c1", "attachedTo": "t1"}]
        });
        fill_lookups(&h, Some(&Statuses), "task:class:Task", &spec, &steps, &mut row).unwrap();

        assert!(row.get("space_lookup").is_none());
        assert_eq!(row["$lookup"]["space"]["_id"], "s1");
        assert_eq!(row["$lookup"]["space"]["$lookup"]["owner"]["name"], "Ann");
        assert_eq!(row["$lookup"]["status"]["name"], "Open");
        assert_eq!(row["$lookup"]["_id"]["comments"], json!([{"_id": "c1", "attachedTo": "t1"}]));
    }

    #[test]
    fn test_fill_missing_and_multiple() {
        let h = hierarchy();
        let spec = LookupSpec::new()
            .forward("space", "core:class:Space")
            .reverse("comments", "chunter:class:Comment", None);
        let steps = plan_lookups(&h, "task:class:Task", &spec).unwrap();

        let mut row = json!({"_id": "t1", "space": "gone", "space_lookup": []});
        fill_lookups(&h, None, "task:class:Task", &spec, &steps, &mut row).unwrap();
        assert!(row["$lookup"].get("space").is_none());
        assert_eq!(row["$lookup"]["_id"]["comments"], json!([]));

        let mut row = json!({"_id": "t1", "space": ["a", "b"],
            "space_lookup": [{"_id": "a"}, {"_id": "b"}]});
        fill_lookups(&h, None, "task:class:Task", &spec, &steps, &mut row).unwrap();
        assert_eq!(row["$lookup"]["space"], json!([{"_id": "a"}, {"_id": "b"}]));
    }
}
