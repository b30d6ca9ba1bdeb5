//! In-process document database.
//!
//! Domains are ordered maps from `_id` to JSON document behind a
//! `parking_lot` lock. Every [`NativeStore`] operation is supported, so the
//! adapter can be embedded without an external database and tested end to
//! end.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};

use crate::error::{NativeError, NativeResult, WriteFailure};
use crate::native::filter::{is_operator_object, matches, project};
use crate::native::pipeline::{run_pipeline, sort_documents};
use crate::native::update::apply_update;
use crate::native::{BulkOp, BulkWriteSummary, NativeCursor, NativeFindOptions, NativeStore};

type DomainData = BTreeMap<String, Value>;

/// A batched write as received by the store
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedWrite {
    pub domain: String,
    pub ops: Vec<BulkOp>,
    pub ordered: bool,
}

pub struct MemoryStore {
    domains: RwLock<HashMap<String, DomainData>>,
    write_log: Mutex<Vec<RecordedWrite>>,
    failing_writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            domains: RwLock::new(HashMap::new()),
            write_log: Mutex::new(Vec::new()),
            failing_writes: AtomicUsize::new(0),
        }
    }

    /// Seed a domain with raw documents, replacing same-id ones.
    pub fn insert_documents(&self, domain: &str, docs: impl IntoIterator<Item = Value>) {
        let mut domains = self.domains.write();
        let data = domains.entry(domain.to_string()).or_default();
        for doc in docs {
            if let Some(id) = doc.get("_id").and_then(Value::as_str) {
                data.insert(id.to_string(), doc.clone());
            } else {
                tracing::warn!("Skipping document without string _id in '{}'", domain);
            }
        }
    }

    /// Raw stored form of a document, private fields included
    pub fn get_raw(&self, domain: &str, id: &str) -> Option<Value> {
        self.domains.read().get(domain)?.get(id).cloned()
    }

    pub fn documents(&self, domain: &str) -> Vec<Value> {
        self.domains
            .read()
            .get(domain)
            .map(|d| d.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn domain_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.domains.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Batched writes received so far, in arrival order
    pub fn write_log(&self) -> Vec<RecordedWrite> {
        self.write_log.lock().clone()
    }

    pub fn clear_write_log(&self) {
        self.write_log.lock().clear();
    }

    /// Make the next `n` batched writes fail as a whole, without applying
    /// any entry.
    pub fn fail_next_bulk_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn select(data: &DomainData, filter: &Value) -> NativeResult<Vec<String>> {
        // direct hit on a scalar _id
        if let Some(id) = filter.get("_id").and_then(Value::as_str) {
            return match data.get(id) {
                Some(doc) if matches(doc, filter)? => Ok(vec![id.to_string()]),
                _ => Ok(Vec::new()),
            };
        }
        let mut ids = Vec::new();
        for (id, doc) in data {
            if matches(doc, filter)? {
                ids.push(id.clone());
            }
        }
        Ok(ids)
    }

    fn apply_op(data: &mut DomainData, op: &BulkOp, summary: &mut BulkWriteSummary) -> NativeResult<()> {
        match op {
            BulkOp::InsertOne { document } => {
                let id = document
                    .get("_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| NativeError::InvalidOperator("insert without _id".to_string()))?;
                if data.contains_key(id) {
                    return Err(NativeError::DuplicateKey(id.to_string()));
                }
                data.insert(id.to_string(), document.clone());
                summary.inserted += 1;
            }
            BulkOp::UpdateOne {
                filter,
                update,
                upsert,
            } => {
                let ids = Self::select(data, filter)?;
                match ids.first() {
                    Some(id) => {
                        summary.matched += 1;
                        if let Some(doc) = data.get_mut(id) {
                            let mut next = doc.clone();
                            if apply_update(&mut next, update, filter)? {
                                *doc = next;
                                summary.modified += 1;
                            }
                        }
                    }
                    None if *upsert => {
                        let mut doc = seed_from_filter(filter);
                        apply_update(&mut doc, update, filter)?;
                        let id = doc
                            .get("_id")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                            .ok_or_else(|| {
                                NativeError::InvalidOperator("upsert without _id".to_string())
                            })?;
                        data.insert(id, doc);
                        summary.upserted += 1;
                    }
                    None => {}
                }
            }
            BulkOp::UpdateMany { filter, update } => {
                for id in Self::select(data, filter)? {
                    summary.matched += 1;
                    if let Some(doc) = data.get_mut(&id) {
                        let mut next = doc.clone();
                        if apply_update(&mut next, update, filter)? {
                            *doc = next;
                            summary.modified += 1;
                        }
                    }
                }
            }
            BulkOp::DeleteOne { filter } => {
                if let Some(id) = Self::select(data, filter)?.first() {
                    data.remove(id);
                    summary.deleted += 1;
                }
            }
            BulkOp::DeleteMany { filter } => {
                for id in Self::select(data, filter)? {
                    data.remove(&id);
                    summary.deleted += 1;
                }
            }
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let domains = self.domains.read();
        let counts: BTreeMap<&String, usize> = domains.iter().map(|(k, v)| (k, v.len())).collect();
        f.debug_struct("MemoryStore").field("domains", &counts).finish()
    }
}

/// Equality conditions of a filter become the initial upserted document.
fn seed_from_filter(filter: &Value) -> Value {
    let mut doc = Map::new();
    if let Some(map) = filter.as_object() {
        for (k, v) in map {
            if !k.starts_with('$') && !k.contains('.') && !is_operator_object(v) {
                doc.insert(k.clone(), v.clone());
            }
        }
    }
    Value::Object(doc)
}

#[async_trait::async_trait]
impl NativeStore for MemoryStore {
    async fn find(
        &self,
        domain: &str,
        filter: &Value,
        options: &NativeFindOptions,
    ) -> NativeResult<Vec<Value>> {
        let mut docs = {
            let domains = self.domains.read();
            let Some(data) = domains.get(domain) else {
                return Ok(Vec::new());
            };
            Self::select(data, filter)?
                .into_iter()
                .filter_map(|id| data.get(&id).cloned())
                .collect::<Vec<_>>()
        };
        sort_documents(&mut docs, &options.sort);
        if let Some(limit) = options.limit {
            docs.truncate(limit);
        }
        if let Some(projection) = &options.projection {
            docs = docs.iter().map(|d| project(d, projection)).collect();
        }
        Ok(docs)
    }

    async fn count(&self, domain: &str, filter: &Value) -> NativeResult<u64> {
        let domains = self.domains.read();
        match domains.get(domain) {
            Some(data) => Ok(Self::select(data, filter)?.len() as u64),
            None => Ok(0),
        }
    }

    async fn aggregate(&self, domain: &str, pipeline: &[Value]) -> NativeResult<Vec<Value>> {
        let domains = self.domains.read();
        let source = |name: &str| -> Vec<Value> {
            domains
                .get(name)
                .map(|d| d.values().cloned().collect())
                .unwrap_or_default()
        };
        let docs = source(domain);
        run_pipeline(docs, pipeline, &source)
    }

    async fn bulk_write(
        &self,
        domain: &str,
        ops: &[BulkOp],
        ordered: bool,
    ) -> NativeResult<BulkWriteSummary> {
        self.write_log.lock().push(RecordedWrite {
            domain: domain.to_string(),
            ops: ops.to_vec(),
            ordered,
        });
        if self.take_injected_failure() {
            return Err(NativeError::BulkWrite { failures: Vec::new() });
        }

        let mut domains = self.domains.write();
        let data = domains.entry(domain.to_string()).or_default();
        let mut summary = BulkWriteSummary::default();
        let mut failures = Vec::new();
        for (index, op) in ops.iter().enumerate() {
            if let Err(e) = Self::apply_op(data, op, &mut summary) {
                failures.push(WriteFailure {
                    index,
                    message: e.to_string(),
                });
                if ordered {
                    break;
                }
            }
        }
        if failures.is_empty() {
            Ok(summary)
        } else {
            Err(NativeError::BulkWrite { failures })
        }
    }

    async fn find_one_and_update(
        &self,
        domain: &str,
        filter: &Value,
        update: &Value,
        return_after: bool,
    ) -> NativeResult<Option<Value>> {
        let mut domains = self.domains.write();
        let Some(data) = domains.get_mut(domain) else {
            return Ok(None);
        };
        let Some(id) = Self::select(data, filter)?.into_iter().next() else {
            return Ok(None);
        };
        let Some(doc) = data.get_mut(&id) else {
            return Ok(None);
        };
        let before = doc.clone();
        let mut next = before.clone();
        apply_update(&mut next, update, filter)?;
        *doc = next.clone();
        Ok(Some(if return_after { next } else { before }))
    }

    async fn update_many(&self, domain: &str, filter: &Value, update: &Value) -> NativeResult<u64> {
        let mut domains = self.domains.write();
        let Some(data) = domains.get_mut(domain) else {
            return Ok(0);
        };
        let mut summary = BulkWriteSummary::default();
        Self::apply_op(
            data,
            &BulkOp::UpdateMany {
                filter: filter.clone(),
                update: update.clone(),
            },
            &mut summary,
        )?;
        Ok(summary.modified)
    }

    async fn open_cursor(
        &self,
        domain: &str,
        filter: &Value,
    ) -> NativeResult<Box<dyn NativeCursor>> {
        let docs = self
            .find(domain, filter, &NativeFindOptions::default())
            .await?;
        Ok(Box::new(MemoryCursor {
            docs: docs.into(),
            closed: false,
        }))
    }
}

/// Snapshot cursor: sees the matching documents as of opening time.
pub struct MemoryCursor {
    docs: VecDeque<Value>,
    closed: bool,
}

#[async_trait::async_trait]
impl NativeCursor for MemoryCursor {
    async fn next(&mut self) -> NativeResult<Option<Value>> {
        if self.closed {
            return Err(NativeError::Unavailable("cursor closed".to_string()));
        }
        Ok(self.docs.pop_front())
    }

    async fn close(&mut self) -> NativeResult<()> {
        self.closed = true;
        self.docs.clear();
        Ok(())
    }
}
