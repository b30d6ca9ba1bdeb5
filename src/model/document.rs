use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::AdapterResult;

pub type DocId = String;
pub type ClassRef = String;
pub type Domain = String;

pub const ID_FIELD: &str = "_id";
pub const CLASS_FIELD: &str = "_class";
pub const SPACE_FIELD: &str = "space";
pub const MODIFIED_BY_FIELD: &str = "modifiedBy";
pub const MODIFIED_ON_FIELD: &str = "modifiedOn";
pub const CREATED_BY_FIELD: &str = "createdBy";
pub const CREATED_ON_FIELD: &str = "createdOn";

/// Private content digest (`hash|sizeHex`), never surfaced to callers
pub const DIGEST_FIELD: &str = "%hash%";

/// Holder of joined sub-documents on query results
pub const LOOKUP_FIELD: &str = "$lookup";

/// Marker written into an otherwise empty mixin namespace so it materializes
pub const MIXIN_MARKER: &str = "__mixin";

/// Parent-attachment fields written by collection-attach transactions
pub const ATTACHED_TO_FIELD: &str = "attachedTo";
pub const ATTACHED_TO_CLASS_FIELD: &str = "attachedToClass";
pub const COLLECTION_FIELD: &str = "collection";

/// A document as stored in a domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "_id")]
    pub id: DocId,

    #[serde(rename = "_class")]
    pub class: ClassRef,

    #[serde(default, deserialize_with = "null_as_default")]
    pub space: String,

    #[serde(rename = "modifiedBy", default, deserialize_with = "null_as_default")]
    pub modified_by: String,

    #[serde(rename = "modifiedOn", default, deserialize_with = "null_as_default")]
    pub modified_on: i64,

    /// Attributes, mixin namespaces and `$lookup` results
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<DocId>, class: impl Into<ClassRef>, space: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            class: class.into(),
            space: space.into(),
            modified_by: String::new(),
            modified_on: 0,
            data: Map::new(),
        }
    }

    /// Set an attribute, builder style
    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }

    pub fn from_value(value: Value) -> AdapterResult<Self> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Get a field, including the system ones
    pub fn get(&self, field: &str) -> Option<Value> {
        match field {
            ID_FIELD => Some(Value::String(self.id.clone())),
            CLASS_FIELD => Some(Value::String(self.class.clone())),
            SPACE_FIELD => Some(Value::String(self.space.clone())),
            MODIFIED_BY_FIELD => Some(Value::String(self.modified_by.clone())),
            MODIFIED_ON_FIELD => Some(Value::from(self.modified_on)),
            _ => self.data.get(field).cloned(),
        }
    }

    /// Attribute namespace of a mixin applied to this document
    pub fn mixin(&self, mixin: &str) -> Option<&Map<String, Value>> {
        self.data.get(mixin).and_then(Value::as_object)
    }

    pub fn lookup(&self) -> Option<&Map<String, Value>> {
        self.data.get(LOOKUP_FIELD).and_then(Value::as_object)
    }

    pub fn digest(&self) -> Option<&str> {
        self.data.get(DIGEST_FIELD).and_then(Value::as_str)
    }
}

/// Stored documents may carry explicit nulls for system fields
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Remove the digest field from a raw document and from every document
/// joined under its `$lookup`.
pub fn strip_digest(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.remove(DIGEST_FIELD);
            if let Some(lookup) = map.get_mut(LOOKUP_FIELD) {
                strip_lookup_digests(lookup);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(strip_digest),
        _ => {}
    }
}

fn strip_lookup_digests(lookup: &mut Value) {
    let Some(map) = lookup.as_object_mut() else {
        return;
    };
    for (key, joined) in map.iter_mut() {
        match joined {
            // reverse lookups are grouped under `_id`
            Value::Object(reverse) if key == ID_FIELD => {
                reverse.values_mut().for_each(strip_digest);
            }
            other => strip_digest(other),
        }
    }
}

/// Convert a raw row returned by the store into a caller-facing document.
pub fn into_document(mut value: Value) -> AdapterResult<Document> {
    strip_digest(&mut value);
    Document::from_value(value)
}
