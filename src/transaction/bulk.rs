//! Translation of transactions into per-domain batched writes.
//!
//! [`translate`] folds an ordered list of transactions into one
//! [`OperationBulk`] per domain. Flat updates of the same document are
//! coalesced into a single `$set`; operator updates that must keep their
//! order (pull before push) become consecutive explicit operations.

use serde_json::{json, Map, Value};

use crate::error::AdapterResult;
use crate::model::document::{
    ATTACHED_TO_CLASS_FIELD, ATTACHED_TO_FIELD, CLASS_FIELD, COLLECTION_FIELD, CREATED_BY_FIELD,
    CREATED_ON_FIELD, DIGEST_FIELD, ID_FIELD, MIXIN_MARKER, MODIFIED_BY_FIELD, MODIFIED_ON_FIELD,
    SPACE_FIELD,
};
use crate::model::{DocId, Domain, Hierarchy};
use crate::native::update::set_path;
use crate::native::BulkOp;
use crate::transaction::{Transaction, TxMeta, UpdatePayload};

/// A `findOneAndUpdate` deferred until after the batch is written
#[derive(Debug, Clone, PartialEq)]
pub struct RawCall {
    pub filter: Value,
    pub update: Value,
}

/// Writes of one call against one domain
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationBulk {
    /// Documents to insert
    pub inserts: Vec<Value>,
    /// Coalesced `$set` patches per document, in first-touch order
    pub updates: Vec<(DocId, Map<String, Value>)>,
    /// Operations that must run as written
    pub ops: Vec<BulkOp>,
    /// Documents to read back once written
    pub fetch_after: Vec<DocId>,
    pub raw: Vec<RawCall>,
}

impl OperationBulk {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty()
            && self.updates.is_empty()
            && self.ops.is_empty()
            && self.fetch_after.is_empty()
            && self.raw.is_empty()
    }

    /// Batched write entries: inserts, then explicit operations, then the
    /// coalesced updates.
    pub fn write_ops(&self) -> Vec<BulkOp> {
        let mut out = Vec::with_capacity(self.inserts.len() + self.ops.len() + self.updates.len());
        out.extend(self.inserts.iter().map(|document| BulkOp::InsertOne {
            document: document.clone(),
        }));
        out.extend(self.ops.iter().cloned());
        out.extend(self.updates.iter().map(|(id, patch)| {
            BulkOp::update_one(json!({ ID_FIELD: id }), json!({ "$set": patch }))
        }));
        out
    }

    fn pending_insert(&mut self, id: &str) -> Option<&mut Value> {
        self.inserts
            .iter_mut()
            .find(|doc| doc.get(ID_FIELD).and_then(Value::as_str) == Some(id))
    }

    /// Merge `patch` into the pending insert or update of `id`; later keys win.
    fn coalesce(&mut self, id: &str, patch: Map<String, Value>) -> AdapterResult<()> {
        if let Some(doc) = self.pending_insert(id) {
            for (path, value) in patch {
                set_path(doc, &path, value)?;
            }
            return Ok(());
        }
        match self.updates.iter_mut().find(|(existing, _)| existing == id) {
            Some((_, pending)) => pending.extend(patch),
            None => self.updates.push((id.to_string(), patch)),
        }
        Ok(())
    }

    fn fetch(&mut self, id: &str) {
        if !self.fetch_after.iter().any(|f| f == id) {
            self.fetch_after.push(id.to_string());
        }
    }
}

/// Translate `txs`, in order, into one bulk per domain. Domains appear in
/// the order they were first touched.
pub fn translate(
    hierarchy: &dyn Hierarchy,
    txs: &[Transaction],
) -> AdapterResult<Vec<(Domain, OperationBulk)>> {
    txs.iter().try_fold(Vec::<(Domain, OperationBulk)>::new(), |mut bulks, tx| -> AdapterResult<_> {
        let Some(meta) = tx.meta() else {
            tracing::warn!("Skipping transaction of unsupported kind '{}'", tx.kind());
            return Ok(bulks);
        };
        let domain = hierarchy.domain(&meta.object_class)?;
        let position = match bulks.iter().position(|(d, _)| *d == domain) {
            Some(position) => position,
            None => {
                bulks.push((domain, OperationBulk::default()));
                bulks.len() - 1
            }
        };
        apply(&mut bulks[position].1, tx)?;
        Ok(bulks)
    })
}

fn provenance(meta: &TxMeta) -> Map<String, Value> {
    let mut set = Map::new();
    set.insert(MODIFIED_BY_FIELD.to_string(), json!(meta.modified_by));
    set.insert(MODIFIED_ON_FIELD.to_string(), json!(meta.modified_on));
    set.insert(DIGEST_FIELD.to_string(), Value::Null);
    set
}

fn by_id(meta: &TxMeta) -> Value {
    json!({ ID_FIELD: meta.object_id })
}

fn apply(bulk: &mut OperationBulk, tx: &Transaction) -> AdapterResult<()> {
    match tx {
        Transaction::Create { meta, attributes } => {
            bulk.inserts.push(materialize(meta, attributes.clone()));
        }
        Transaction::CollectionAttach {
            meta,
            attached_to,
            attached_to_class,
            collection,
            attributes,
        } => {
            let mut attributes = attributes.clone();
            attributes.insert(ATTACHED_TO_FIELD.to_string(), json!(attached_to));
            attributes.insert(ATTACHED_TO_CLASS_FIELD.to_string(), json!(attached_to_class));
            attributes.insert(COLLECTION_FIELD.to_string(), json!(collection));
            bulk.inserts.push(materialize(meta, attributes));
        }
        Transaction::Remove { meta } => {
            bulk.ops.push(BulkOp::DeleteOne {
                filter: by_id(meta),
            });
        }
        Transaction::MixinApply {
            meta,
            mixin,
            attributes,
        } => match UpdatePayload::classify(attributes)? {
            UpdatePayload::Flat(attrs) => {
                let mut patch = Map::new();
                if attrs.is_empty() {
                    patch.insert(format!("{}.{}", mixin, MIXIN_MARKER), json!("true"));
                }
                for (key, value) in attrs {
                    patch.insert(format!("{}.{}", mixin, key), value);
                }
                patch.extend(provenance(meta));
                bulk.coalesce(&meta.object_id, patch)?;
            }
            UpdatePayload::Move {
                field,
                value,
                position,
            } => push_move(bulk, meta, &format!("{}.{}", mixin, field), value, position),
            UpdatePayload::ArrayUpdate {
                field,
                query,
                patch,
            } => push_array_update(bulk, meta, &format!("{}.{}", mixin, field), &query, &patch),
            UpdatePayload::Native(ops) => {
                let update = with_provenance(namespace_operators(mixin, &ops), meta);
                bulk.ops.push(BulkOp::update_one(by_id(meta), update));
            }
        },
        Transaction::Update {
            meta,
            operations,
            retrieve,
        } => match UpdatePayload::classify(operations)? {
            UpdatePayload::Flat(mut attrs) => {
                attrs.extend(provenance(meta));
                bulk.coalesce(&meta.object_id, attrs)?;
                if *retrieve {
                    bulk.fetch(&meta.object_id);
                }
            }
            UpdatePayload::Move {
                field,
                value,
                position,
            } => push_move(bulk, meta, &field, value, position),
            UpdatePayload::ArrayUpdate {
                field,
                query,
                patch,
            } => push_array_update(bulk, meta, &field, &query, &patch),
            UpdatePayload::Native(ops) => {
                let update = with_provenance(ops, meta);
                if *retrieve {
                    bulk.raw.push(RawCall {
                        filter: by_id(meta),
                        update,
                    });
                } else {
                    bulk.ops.push(BulkOp::update_one(by_id(meta), update));
                }
            }
        },
        Transaction::Unknown => {
            tracing::warn!("Skipping transaction of unsupported kind '{}'", tx.kind());
        }
    }
    Ok(())
}

/// Full stored form of a created document
fn materialize(meta: &TxMeta, mut attributes: Map<String, Value>) -> Value {
    attributes.insert(ID_FIELD.to_string(), json!(meta.object_id));
    attributes.insert(CLASS_FIELD.to_string(), json!(meta.object_class));
    attributes.insert(SPACE_FIELD.to_string(), json!(meta.object_space));
    attributes.insert(MODIFIED_BY_FIELD.to_string(), json!(meta.modified_by));
    attributes.insert(MODIFIED_ON_FIELD.to_string(), json!(meta.modified_on));
    attributes.insert(CREATED_BY_FIELD.to_string(), json!(meta.modified_by));
    attributes.insert(CREATED_ON_FIELD.to_string(), json!(meta.modified_on));
    attributes.insert(DIGEST_FIELD.to_string(), Value::Null);
    Value::Object(attributes)
}

/// Pull `value` from `field`, then push it back at `position`. The two
/// operations must run in this order.
fn push_move(bulk: &mut OperationBulk, meta: &TxMeta, field: &str, value: Value, position: Option<i64>) {
    bulk.ops.push(BulkOp::update_one(
        by_id(meta),
        json!({
            "$pull": { field: value },
            "$set": { DIGEST_FIELD: null },
        }),
    ));
    let mut each = Map::new();
    each.insert("$each".to_string(), json!([value]));
    if let Some(position) = position {
        each.insert("$position".to_string(), json!(position));
    }
    bulk.ops.push(BulkOp::update_one(
        by_id(meta),
        json!({
            "$set": provenance(meta),
            "$push": { field: each },
        }),
    ));
}

/// Patch the first element of `field` matching `query`, then stamp the
/// provenance on the document.
fn push_array_update(
    bulk: &mut OperationBulk,
    meta: &TxMeta,
    field: &str,
    query: &Map<String, Value>,
    patch: &Map<String, Value>,
) {
    let mut filter = Map::new();
    filter.insert(ID_FIELD.to_string(), json!(meta.object_id));
    for (key, value) in query {
        filter.insert(format!("{}.{}", field, key), value.clone());
    }
    let mut set = Map::new();
    for (key, value) in patch {
        set.insert(format!("{}.$.{}", field, key), value.clone());
    }
    set.insert(DIGEST_FIELD.to_string(), Value::Null);
    bulk.ops.push(BulkOp::update_one(
        Value::Object(filter),
        json!({ "$set": set }),
    ));
    bulk.ops.push(BulkOp::update_one(
        by_id(meta),
        json!({ "$set": provenance(meta) }),
    ));
}

/// Prefix every field of a mixin operator patch with the mixin key.
fn namespace_operators(mixin: &str, ops: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in ops {
        if key.starts_with('$') {
            let scoped: Map<String, Value> = match value {
                Value::Object(fields) => fields
                    .iter()
                    .map(|(k, v)| (format!("{}.{}", mixin, k), v.clone()))
                    .collect(),
                _ => Map::new(),
            };
            merge_operator(&mut out, key, scoped);
        } else {
            let mut set = Map::new();
            set.insert(format!("{}.{}", mixin, key), value.clone());
            merge_operator(&mut out, "$set", set);
        }
    }
    out
}

fn merge_operator(ops: &mut Map<String, Value>, op: &str, fields: Map<String, Value>) {
    let slot = ops
        .entry(op.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(existing) = slot {
        existing.extend(fields);
    }
}

/// Add provenance and the digest reset to the `$set` clause, folding plain
/// keys into it.
fn with_provenance(ops: Map<String, Value>, meta: &TxMeta) -> Value {
    let mut out = Map::new();
    for (key, value) in ops {
        if key.starts_with('$') {
            match value {
                Value::Object(fields) => merge_operator(&mut out, &key, fields),
                other => {
                    out.insert(key, other);
                }
            }
        } else {
            let mut set = Map::new();
            set.insert(key, value);
            merge_operator(&mut out, "$set", set);
        }
    }
    merge_operator(&mut out, "$set", provenance(meta));
    Value::Object(out)
}
