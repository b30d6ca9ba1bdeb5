//! The document adapter: hierarchy-aware queries, transaction processing
//! and change records over a [`NativeStore`].

use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::config::AdapterConfig;
use crate::error::AdapterResult;
use crate::limiter::RateLimiter;
use crate::model::document::{DIGEST_FIELD, ID_FIELD, LOOKUP_FIELD};
use crate::model::{DocId, Document, Hierarchy, ModelLookup};
use crate::native::{BulkOp, BulkWriteSummary, NativeStore};
use crate::query::{FindOptions, FindResult, QueryExecutor};
use crate::sync::ChangeHashIterator;
use crate::transaction::{translate, FlushPipeline, Transaction};

pub struct DocumentAdapter {
    store: Arc<dyn NativeStore>,
    hierarchy: Arc<dyn Hierarchy>,
    config: AdapterConfig,
    queries: QueryExecutor,
    flush: FlushPipeline,
}

impl DocumentAdapter {
    pub fn new(
        store: Arc<dyn NativeStore>,
        hierarchy: Arc<dyn Hierarchy>,
        model: Option<Arc<dyn ModelLookup>>,
        config: AdapterConfig,
    ) -> Self {
        let read = RateLimiter::new("read", config.read_concurrency, config.slow_threshold());
        let write = RateLimiter::new("write", config.write_concurrency, config.slow_threshold());
        tracing::info!(
            "Document adapter ready (read limit {}, write limit {})",
            read.capacity(),
            write.capacity()
        );
        Self {
            queries: QueryExecutor::new(
                store.clone(),
                hierarchy.clone(),
                model,
                read.clone(),
                config.log_truncate,
            ),
            flush: FlushPipeline::new(store.clone(), write, read),
            store,
            hierarchy,
            config,
        }
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn hierarchy(&self) -> &dyn Hierarchy {
        self.hierarchy.as_ref()
    }

    /// Apply transactions in order. Returns the documents the transactions
    /// asked to read back.
    pub async fn execute_transactions(&self, txs: &[Transaction]) -> AdapterResult<Vec<Document>> {
        let bulks = translate(self.hierarchy.as_ref(), txs)?;
        if bulks.is_empty() {
            return Ok(Vec::new());
        }
        tracing::debug!(
            "Applying {} transactions across {} domains",
            txs.len(),
            bulks.len()
        );
        self.flush.apply(bulks).await
    }

    pub async fn find_all(
        &self,
        class: &str,
        query: &Map<String, Value>,
        options: &FindOptions,
    ) -> AdapterResult<FindResult> {
        self.queries.find_all(class, query, options).await
    }

    pub async fn load_by_ids(&self, domain: &str, ids: &[DocId]) -> AdapterResult<Vec<Document>> {
        self.queries.load_by_ids(domain, ids).await
    }

    /// Insert or replace attributes of whole documents.
    pub async fn bulk_upsert(&self, domain: &str, docs: &[Document]) -> AdapterResult<BulkWriteSummary> {
        let ops = docs
            .iter()
            .map(|doc| {
                let mut set = match doc.to_value() {
                    Value::Object(map) => map,
                    _ => Map::new(),
                };
                set.remove(ID_FIELD);
                set.remove(LOOKUP_FIELD);
                set.insert(DIGEST_FIELD.to_string(), Value::Null);
                BulkOp::UpdateOne {
                    filter: json!({ ID_FIELD: doc.id }),
                    update: json!({ "$set": set }),
                    upsert: true,
                }
            })
            .collect();
        self.flush.write(domain, ops).await
    }

    /// Merge attribute patches into existing documents.
    pub async fn bulk_patch(
        &self,
        domain: &str,
        patches: &[(DocId, Map<String, Value>)],
    ) -> AdapterResult<BulkWriteSummary> {
        let ops = patches
            .iter()
            .map(|(id, patch)| {
                let mut set = patch.clone();
                set.insert(DIGEST_FIELD.to_string(), Value::Null);
                BulkOp::update_one(json!({ ID_FIELD: id }), json!({ "$set": set }))
            })
            .collect();
        self.flush.write(domain, ops).await
    }

    pub async fn delete_by_ids(&self, domain: &str, ids: &[DocId]) -> AdapterResult<BulkWriteSummary> {
        if ids.is_empty() {
            return Ok(BulkWriteSummary::default());
        }
        let op = BulkOp::DeleteMany {
            filter: json!({ ID_FIELD: { "$in": ids } }),
        };
        self.flush.write(domain, vec![op]).await
    }

    /// Change records of every document in `domain`.
    pub async fn stream_change_records(
        &self,
        domain: &str,
        force_recheck: bool,
    ) -> AdapterResult<ChangeHashIterator> {
        ChangeHashIterator::open(
            self.store.clone(),
            self.flush.limiter().clone(),
            domain,
            force_recheck,
            self.config.hash_batch_size,
        )
        .await
    }
}

impl std::fmt::Debug for DocumentAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentAdapter")
            .field("config", &self.config)
            .field("read", self.queries.limiter())
            .field("flush", &self.flush)
            .finish()
    }
}
