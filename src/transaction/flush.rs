//! Flushing translated bulks to the document database.
//!
//! Write entries are appended to a per-domain pending list shared by all
//! callers and flushed as one unordered batched write per domain under the
//! write limiter. Only one flush per domain runs at a time; entries queued
//! by a concurrent caller may be written by whichever flush drains them.
//!
//! A failed batch is retried once, entry by entry, to isolate the failing
//! entries. Entries that still fail surface as [`AdapterError::BulkWrite`].
//! Read-backs after a write run under the read limiter.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;

use crate::error::{AdapterError, AdapterResult, NativeError, WriteFailure};
use crate::limiter::RateLimiter;
use crate::model::document::{into_document, ID_FIELD};
use crate::model::{Document, Domain};
use crate::native::{BulkOp, BulkWriteSummary, NativeFindOptions, NativeStore};
use crate::transaction::bulk::OperationBulk;

pub struct FlushPipeline {
    store: Arc<dyn NativeStore>,
    limiter: RateLimiter,
    reader: RateLimiter,
    pending: Mutex<HashMap<Domain, Vec<BulkOp>>>,
    domain_locks: DashMap<Domain, Arc<tokio::sync::Mutex<()>>>,
}

impl FlushPipeline {
    pub fn new(store: Arc<dyn NativeStore>, limiter: RateLimiter, reader: RateLimiter) -> Self {
        Self {
            store,
            limiter,
            reader,
            pending: Mutex::new(HashMap::new()),
            domain_locks: DashMap::new(),
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Append write entries to a domain's pending list.
    pub fn enqueue(&self, domain: &str, ops: Vec<BulkOp>) {
        if ops.is_empty() {
            return;
        }
        self.pending
            .lock()
            .entry(domain.to_string())
            .or_default()
            .extend(ops);
    }

    /// Number of entries waiting for a domain
    pub fn pending_len(&self, domain: &str) -> usize {
        self.pending.lock().get(domain).map(Vec::len).unwrap_or(0)
    }

    /// Write everything pending for `domain`.
    pub async fn flush_domain(&self, domain: &str) -> AdapterResult<BulkWriteSummary> {
        let lock = self
            .domain_locks
            .entry(domain.to_string())
            .or_default()
            .value()
            .clone();
        let _guard = lock.lock().await;

        let ops = self.pending.lock().remove(domain).unwrap_or_default();
        if ops.is_empty() {
            return Ok(BulkWriteSummary::default());
        }
        tracing::debug!("Flushing {} operations to '{}'", ops.len(), domain);
        self.limiter
            .exec("bulk_write", domain, self.write_with_retry(domain, &ops))
            .await
    }

    /// Queue and flush `ops` right away.
    pub async fn write(&self, domain: &str, ops: Vec<BulkOp>) -> AdapterResult<BulkWriteSummary> {
        self.enqueue(domain, ops);
        self.flush_domain(domain).await
    }

    /// Write translated bulks, then read back the documents they asked for
    /// and run the deferred calls.
    pub async fn apply(&self, bulks: Vec<(Domain, OperationBulk)>) -> AdapterResult<Vec<Document>> {
        for (domain, bulk) in &bulks {
            self.enqueue(domain, bulk.write_ops());
        }
        // every domain is drained even when an earlier one fails
        let mut failed = None;
        for (domain, _) in &bulks {
            if let Err(e) = self.flush_domain(domain).await {
                tracing::error!("Flush of '{}' failed: {}", domain, e);
                failed.get_or_insert(e);
            }
        }
        if let Some(e) = failed {
            return Err(e);
        }

        let mut results = Vec::new();
        for (domain, bulk) in &bulks {
            if bulk.fetch_after.is_empty() {
                continue;
            }
            let filter = json!({ ID_FIELD: { "$in": bulk.fetch_after } });
            let rows = self
                .reader
                .exec("fetch_after", domain, async {
                    Ok(self
                        .store
                        .find(domain, &filter, &NativeFindOptions::default())
                        .await?)
                })
                .await?;
            for row in rows {
                results.push(into_document(row)?);
            }
        }

        for (domain, bulk) in &bulks {
            for call in &bulk.raw {
                let updated = self
                    .limiter
                    .exec("find_one_and_update", domain, async {
                        Ok(self
                            .store
                            .find_one_and_update(domain, &call.filter, &call.update, true)
                            .await?)
                    })
                    .await?;
                match updated {
                    Some(row) => results.push(into_document(row)?),
                    None => tracing::debug!("No document matched {} in '{}'", call.filter, domain),
                }
            }
        }
        Ok(results)
    }

    async fn write_with_retry(&self, domain: &str, ops: &[BulkOp]) -> AdapterResult<BulkWriteSummary> {
        let failures = match self.store.bulk_write(domain, ops, false).await {
            Ok(summary) => return Ok(summary),
            Err(NativeError::BulkWrite { failures }) => failures,
            Err(other) => return Err(other.into()),
        };

        // no indexes means nothing was applied
        let retry: Vec<usize> = if failures.is_empty() {
            (0..ops.len()).collect()
        } else {
            failures.iter().map(|f| f.index).collect()
        };
        tracing::warn!(
            "Bulk write on '{}' failed for {} of {} operations, retrying one by one",
            domain,
            retry.len(),
            ops.len()
        );

        let mut summary = BulkWriteSummary::default();
        let mut still_failing = Vec::new();
        for index in retry {
            let Some(op) = ops.get(index) else {
                continue;
            };
            match self
                .store
                .bulk_write(domain, std::slice::from_ref(op), true)
                .await
            {
                Ok(single) => summary.merge(&single),
                Err(e) => {
                    tracing::error!(
                        "Bulk write on '{}' failed for {} #{}: {}",
                        domain,
                        op.kind(),
                        index,
                        e
                    );
                    still_failing.push(WriteFailure {
                        index,
                        message: e.to_string(),
                    });
                }
            }
        }

        if still_failing.is_empty() {
            Ok(summary)
        } else {
            Err(AdapterError::BulkWrite {
                domain: domain.to_string(),
                failures: still_failing,
            })
        }
    }
}

impl std::fmt::Debug for FlushPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushPipeline")
            .field("limiter", &self.limiter)
            .field("reader", &self.reader)
            .field("pending_domains", &self.pending.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::MemoryStore;
    use serde_json::{json, Value};
    use std::time::Duration;

    fn pipeline() -> (Arc<MemoryStore>, FlushPipeline) {
        let store = Arc::new(MemoryStore::new());
        let flush = FlushPipeline::new(
            store.clone(),
            RateLimiter::new("write", 2, Duration::from_secs(1)),
            RateLimiter::new("read", 2, Duration::from_secs(1)),
        );
        (store, flush)
    }

    fn insert(id: &str) -> Value {
        json!({"_id": id, "_class": "A"})
    }

    #[tokio::test]
    async fn test_enqueue_appends_and_flush_drains() {
        let (store, flush) = pipeline();
        flush.enqueue("task", vec![BulkOp::InsertOne { document: json!({"_id": "a"}) }]);
        flush.enqueue("task", vec![BulkOp::InsertOne { document: json!({"_id": "b"}) }]);
        assert_eq!(flush.pending_len("task"), 2);

        let summary = flush.flush_domain("task").await.unwrap();
        assert_eq!(summary.inserted, 2);
        assert_eq!(flush.pending_len("task"), 0);
        assert_eq!(store.write_log().len(), 1);
        assert!(!store.write_log()[0].ordered);

        let again = flush.flush_domain("task").await.unwrap();
        assert_eq!(again, BulkWriteSummary::default());
        assert_eq!(store.write_log().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_per_entry() {
        let (store, flush) = pipeline();
        store.fail_next_bulk_writes(1);
        let ops = vec![
            BulkOp::InsertOne { document: json!({"_id": "a"}) },
            BulkOp::InsertOne { document: json!({"_id": "b"}) },
        ];
        let summary = flush.write("task", ops).await.unwrap();
        assert_eq!(summary.inserted, 2);
        // the failed batch plus one single-entry retry per operation
        assert_eq!(store.write_log().len(), 3);
        assert!(store.get_raw("task", "b").is_some());
    }

    #[tokio::test]
    async fn test_persistent_failure_surfaces() {
        let (store, flush) = pipeline();
        store.insert_documents("task", vec![json!({"_id": "a"})]);
        let ops = vec![
            BulkOp::InsertOne { document: json!({"_id": "a"}) },
            BulkOp::InsertOne { document: json!({"_id": "c"}) },
        ];
        let err = flush.write("task", ops).await.unwrap_err();
        match err {
            AdapterError::BulkWrite { domain, failures } => {
                assert_eq!(domain, "task");
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].index, 0);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(store.get_raw("task", "c").is_some());
        // only the failing entry is retried
        assert_eq!(store.write_log().len(), 2);
    }

    #[tokio::test]
    async fn test_apply_fetches_and_runs_raw_calls() {
        let (store, flush) = pipeline();
        store.insert_documents(
            "task",
            vec![
                json!({"_id": "t1", "_class": "A", "n": 1, "%hash%": "h|1"}),
                json!({"_id": "t2", "_class": "A", "n": 1}),
            ],
        );
        let bulk = OperationBulk {
            updates: vec![("t1".to_string(), json!({"n": 5, "%hash%": null}).as_object().unwrap().clone())],
            fetch_after: vec!["t1".to_string()],
            raw: vec![crate::transaction::RawCall {
                filter: json!({"_id": "t2"}),
                update: json!({"$inc": {"n": 1}}),
            }],
            ..Default::default()
        };
        let results = flush.apply(vec![("task".to_string(), bulk)]).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "t1");
        assert_eq!(results[0].data["n"], 5);
        assert!(results[0].digest().is_none());
        assert_eq!(results[1].data["n"], 2);
    }

    #[tokio::test]
    async fn test_failed_domain_does_not_strand_others() {
        let (store, flush) = pipeline();
        store.insert_documents("task", vec![insert("t1")]);
        let task = OperationBulk {
            inserts: vec![insert("t1")],
            ..Default::default()
        };
        let chunter = OperationBulk {
            inserts: vec![insert("c1")],
            ..Default::default()
        };
        let err = flush
            .apply(vec![("task".to_string(), task), ("chunter".to_string(), chunter)])
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::BulkWrite { ref domain, .. } if domain == "task"));
        assert!(store.get_raw("chunter", "c1").is_some());
        assert_eq!(flush.pending_len("task"), 0);
        assert_eq!(flush.pending_len("chunter"), 0);

        // a later unrelated flush writes only its own entries
        store.clear_write_log();
        flush.write("chunter", vec![BulkOp::InsertOne { document: insert("c2") }]).await.unwrap();
        assert_eq!(store.write_log().len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_after_uses_read_limiter() {
        let store = Arc::new(MemoryStore::new());
        store.insert_documents("task", vec![insert("t1")]);
        let write = RateLimiter::new("write", 1, Duration::from_secs(1));
        let flush = FlushPipeline::new(
            store.clone(),
            write.clone(),
            RateLimiter::new("read", 1, Duration::from_secs(1)),
        );

        // occupy the only write permit
        let (release, held) = tokio::sync::oneshot::channel::<()>();
        let holder = write.clone();
        let busy = tokio::spawn(async move {
            holder
                .exec("hold", "task", async {
                    let _ = held.await;
                    Ok(())
                })
                .await
        });
        while write.available() > 0 {
            tokio::task::yield_now().await;
        }

        let bulk = OperationBulk {
            fetch_after: vec!["t1".to_string()],
            ..Default::default()
        };
        let results = tokio::time::timeout(
            Duration::from_secs(1),
            flush.apply(vec![("task".to_string(), bulk)]),
        )
        .await
        .expect("read-back waited on the write limiter")
        .unwrap();
        assert_eq!(results.len(), 1);

        release.send(()).unwrap();
        busy.await.unwrap().unwrap();
    }
}
