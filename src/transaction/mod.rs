pub mod bulk;
pub mod flush;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{AdapterError, AdapterResult};
use crate::model::{ClassRef, DocId};

pub use bulk::{translate, OperationBulk, RawCall};
pub use flush::FlushPipeline;

/// Who changed which document, and when
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxMeta {
    /// Transaction identifier
    #[serde(rename = "_id")]
    pub id: String,
    pub modified_by: String,
    /// Milliseconds since the Unix epoch
    pub modified_on: i64,
    pub object_id: DocId,
    pub object_class: ClassRef,
    #[serde(default)]
    pub object_space: String,
}

impl TxMeta {
    /// New metadata stamped with a fresh id and the current time
    pub fn new(object_id: &str, object_class: &str, object_space: &str, modified_by: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            modified_by: modified_by.to_string(),
            modified_on: Utc::now().timestamp_millis(),
            object_id: object_id.to_string(),
            object_class: object_class.to_string(),
            object_space: object_space.to_string(),
        }
    }

    pub fn at(mut self, modified_on: i64) -> Self {
        self.modified_on = modified_on;
        self
    }
}

/// A mutation of a single document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Transaction {
    /// Create a document
    Create {
        #[serde(flatten)]
        meta: TxMeta,
        attributes: Map<String, Value>,
    },
    /// Create a document attached to a parent's collection
    #[serde(rename_all = "camelCase")]
    CollectionAttach {
        #[serde(flatten)]
        meta: TxMeta,
        attached_to: DocId,
        attached_to_class: ClassRef,
        collection: String,
        attributes: Map<String, Value>,
    },
    /// Update attributes, flat or through one operator
    Update {
        #[serde(flatten)]
        meta: TxMeta,
        operations: Map<String, Value>,
        /// Return the updated document
        #[serde(default)]
        retrieve: bool,
    },
    /// Delete a document
    Remove {
        #[serde(flatten)]
        meta: TxMeta,
    },
    /// Update the attributes of a mixin applied to a document
    #[serde(rename_all = "camelCase")]
    MixinApply {
        #[serde(flatten)]
        meta: TxMeta,
        mixin: ClassRef,
        attributes: Map<String, Value>,
    },
    /// Any kind this adapter does not handle; logged and skipped
    #[serde(other)]
    Unknown,
}

impl Transaction {
    pub fn create(meta: TxMeta, attributes: Map<String, Value>) -> Self {
        Transaction::Create { meta, attributes }
    }

    pub fn update(meta: TxMeta, operations: Map<String, Value>) -> Self {
        Transaction::Update {
            meta,
            operations,
            retrieve: false,
        }
    }

    pub fn remove(meta: TxMeta) -> Self {
        Transaction::Remove { meta }
    }

    pub fn mixin(meta: TxMeta, mixin: &str, attributes: Map<String, Value>) -> Self {
        Transaction::MixinApply {
            meta,
            mixin: mixin.to_string(),
            attributes,
        }
    }

    /// Metadata, absent only for unknown kinds
    pub fn meta(&self) -> Option<&TxMeta> {
        match self {
            Transaction::Create { meta, .. } => Some(meta),
            Transaction::CollectionAttach { meta, .. } => Some(meta),
            Transaction::Update { meta, .. } => Some(meta),
            Transaction::Remove { meta } => Some(meta),
            Transaction::MixinApply { meta, .. } => Some(meta),
            Transaction::Unknown => None,
        }
    }

    /// Get the document id this transaction targets
    pub fn object_id(&self) -> Option<&str> {
        self.meta().map(|m| m.object_id.as_str())
    }

    pub fn object_class(&self) -> Option<&str> {
        self.meta().map(|m| m.object_class.as_str())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Transaction::Create { .. } => "create",
            Transaction::CollectionAttach { .. } => "collectionAttach",
            Transaction::Update { .. } => "update",
            Transaction::Remove { .. } => "remove",
            Transaction::MixinApply { .. } => "mixinApply",
            Transaction::Unknown => "unknown",
        }
    }
}

/// Shape of an update or mixin patch
#[derive(Debug, Clone, PartialEq)]
pub enum UpdatePayload {
    /// Plain attribute values, merged over the stored ones
    Flat(Map<String, Value>),
    /// Move `value` inside the array `field` to `position` (end when absent)
    Move {
        field: String,
        value: Value,
        position: Option<i64>,
    },
    /// Patch the first element of array `field` matching `query`
    ArrayUpdate {
        field: String,
        query: Map<String, Value>,
        patch: Map<String, Value>,
    },
    /// Update operators passed to the document database as they are
    Native(Map<String, Value>),
}

impl UpdatePayload {
    /// Classify a patch. Any `$` key makes it an operator form.
    pub fn classify(patch: &Map<String, Value>) -> AdapterResult<Self> {
        if !patch.keys().any(|k| k.starts_with('$')) {
            return Ok(UpdatePayload::Flat(patch.clone()));
        }
        if let Some(spec) = patch.get("$move") {
            let (field, target) = single_entry("$move", spec)?;
            let value = target.get("$value").cloned().ok_or_else(|| {
                AdapterError::InvalidTransaction(format!("$move on '{}' without $value", field))
            })?;
            return Ok(UpdatePayload::Move {
                field,
                value,
                position: target.get("$position").and_then(Value::as_i64),
            });
        }
        if let Some(spec) = patch.get("$update") {
            let (field, target) = single_entry("$update", spec)?;
            let query = object_at(target, "$query", &field)?;
            let patch = object_at(target, "$update", &field)?;
            return Ok(UpdatePayload::ArrayUpdate {
                field,
                query,
                patch,
            });
        }
        Ok(UpdatePayload::Native(patch.clone()))
    }
}

fn single_entry<'a>(op: &str, spec: &'a Value) -> AdapterResult<(String, &'a Value)> {
    match spec.as_object() {
        Some(map) if map.len() == 1 => map
            .iter()
            .next()
            .map(|(k, v)| (k.clone(), v))
            .ok_or_else(|| AdapterError::InvalidTransaction(format!("{} is empty", op))),
        _ => Err(AdapterError::InvalidTransaction(format!(
            "{} expects exactly one field",
            op
        ))),
    }
}

fn object_at(target: &Value, key: &str, field: &str) -> AdapterResult<Map<String, Value>> {
    target
        .get(key)
        .and_then(Value::as_object)
        .cloned()
        .ok_or_else(|| {
            AdapterError::InvalidTransaction(format!("$update on '{}' needs {}", field, key))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_classify_payloads() {
        assert!(matches!(
            UpdatePayload::classify(&map(json!({"title": "x"}))).unwrap(),
            UpdatePayload::Flat(_)
        ));
        assert_eq!(
            UpdatePayload::classify(&map(json!({"$move": {"labels": {"$value": "a", "$position": 0}}})))
                .unwrap(),
            UpdatePayload::Move {
                field: "labels".to_string(),
                value: json!("a"),
                position: Some(0)
            }
        );
        assert_eq!(
            UpdatePayload::classify(&map(json!({"$update": {"items": {"$query": {"k": 1}, "$update": {"v": 2}}}})))
                .unwrap(),
            UpdatePayload::ArrayUpdate {
                field: "items".to_string(),
                query: map(json!({"k": 1})),
                patch: map(json!({"v": 2}))
            }
        );
        assert!(matches!(
            UpdatePayload::classify(&map(json!({"$inc": {"n": 1}}))).unwrap(),
            UpdatePayload::Native(_)
        ));
    }

    #[test]
    fn test_classify_rejects_malformed_operators() {
        assert!(UpdatePayload::classify(&map(json!({"$move": {"a": {}}}))).is_err());
        assert!(UpdatePayload::classify(&map(json!({"$move": {}}))).is_err());
        assert!(UpdatePayload::classify(&map(json!({"$update": {"items": {"$query": {}}}}))).is_err());
    }

    #[test]
    fn test_transaction_serde() {
        let tx: Transaction = serde_json::from_value(json!({
            "kind": "mixinApply",
            "_id": "tx1",
            "modifiedBy": "user",
            "modifiedOn": 5,
            "objectId": "t1",
            "objectClass": "task:class:Task",
            "mixin": "task:mixin:Estimate",
            "attributes": {"hours": 2}
        }))
        .unwrap();
        assert_eq!(tx.kind(), "mixinApply");
        assert_eq!(tx.object_id(), Some("t1"));
        assert_eq!(tx.meta().unwrap().object_space, "");

        let unknown: Transaction = serde_json::from_value(json!({"kind": "somethingElse"})).unwrap();
        assert_eq!(unknown, Transaction::Unknown);
        assert!(unknown.meta().is_none());
    }

    #[test]
    fn test_meta_new() {
        let meta = TxMeta::new("t1", "task:class:Task", "sp", "user").at(10);
        assert_eq!(meta.modified_on, 10);
        assert!(!meta.id.is_empty());
    }
}
