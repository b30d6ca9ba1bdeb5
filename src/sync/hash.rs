//! Incremental content hashing for backup and sync.
//!
//! A domain is scanned in two phases. Documents that already carry a digest
//! (`<sha256 hex>|<size hex>`) are reported straight from it; the rest are
//! hashed, reported, and get their digest written back in batches. Every
//! write through the adapter resets the digest, so a present digest is
//! always current.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::Stream;
use serde::Serialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{AdapterError, AdapterResult};
use crate::limiter::RateLimiter;
use crate::model::document::{DIGEST_FIELD, ID_FIELD};
use crate::model::{DocId, Domain};
use crate::native::{BulkOp, NativeCursor, NativeStore};

/// Content fingerprint of one document
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeRecord {
    pub id: DocId,
    pub hash: String,
    /// Serialized size in bytes
    pub size: u64,
}

impl ChangeRecord {
    /// Stored digest form, `hash|sizeHex`
    pub fn digest(&self) -> String {
        format!("{}|{:x}", self.hash, self.size)
    }

    pub fn from_digest(id: &str, digest: &str) -> AdapterResult<Self> {
        let (hash, size) = digest
            .rsplit_once('|')
            .ok_or_else(|| AdapterError::InvalidDigest(digest.to_string()))?;
        let size = u64::from_str_radix(size, 16)
            .map_err(|_| AdapterError::InvalidDigest(digest.to_string()))?;
        if hash.is_empty() {
            return Err(AdapterError::InvalidDigest(digest.to_string()));
        }
        Ok(Self {
            id: id.to_string(),
            hash: hash.to_string(),
            size,
        })
    }

    /// Hash a raw document, ignoring its digest field.
    pub fn compute(doc: &Value) -> AdapterResult<Self> {
        let id = doc
            .get(ID_FIELD)
            .and_then(Value::as_str)
            .ok_or_else(|| AdapterError::Internal("document without _id".to_string()))?;
        let mut content = doc.clone();
        if let Value::Object(map) = &mut content {
            map.remove(DIGEST_FIELD);
        }
        let bytes = serde_json::to_vec(&canonical(&content))?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(Self {
            id: id.to_string(),
            hash: hex::encode(hasher.finalize()),
            size: bytes.len() as u64,
        })
    }
}

/// Same value with object keys sorted at every level
fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonical(v))).collect();
            let mut out = Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Hashed,
    NonHashed,
    Done,
}

impl Phase {
    fn filter(self) -> Value {
        match self {
            Phase::Hashed => json!({ DIGEST_FIELD: { "$nin": [null, ""] } }),
            _ => json!({ DIGEST_FIELD: { "$in": [null, ""] } }),
        }
    }
}

/// Two-phase change-record iterator over one domain
pub struct ChangeHashIterator {
    store: Arc<dyn NativeStore>,
    limiter: RateLimiter,
    domain: Domain,
    batch_size: usize,
    phase: Phase,
    cursor: Option<Box<dyn NativeCursor>>,
    pending: Vec<(DocId, String)>,
    closed: bool,
}

impl ChangeHashIterator {
    /// Open an iterator. With `force_recheck` every digest is invalidated
    /// first and all documents are rehashed.
    pub async fn open(
        store: Arc<dyn NativeStore>,
        limiter: RateLimiter,
        domain: &str,
        force_recheck: bool,
        batch_size: usize,
    ) -> AdapterResult<Self> {
        let phase = if force_recheck {
            let invalidated = limiter
                .exec("invalidate_digests", domain, async {
                    Ok(store
                        .update_many(
                            domain,
                            &Phase::Hashed.filter(),
                            &json!({ "$set": { DIGEST_FIELD: null } }),
                        )
                        .await?)
                })
                .await?;
            tracing::info!("Invalidated {} digests in '{}'", invalidated, domain);
            Phase::NonHashed
        } else {
            Phase::Hashed
        };
        Ok(Self {
            store,
            limiter,
            domain: domain.to_string(),
            batch_size: batch_size.max(1),
            phase,
            cursor: None,
            pending: Vec::new(),
            closed: false,
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Next record, or `None` once both phases are exhausted.
    pub async fn next(&mut self) -> AdapterResult<Option<ChangeRecord>> {
        if self.closed {
            return Ok(None);
        }
        loop {
            if self.phase == Phase::Done {
                return Ok(None);
            }
            if self.cursor.is_none() {
                let cursor = self
                    .store
                    .open_cursor(&self.domain, &self.phase.filter())
                    .await?;
                self.cursor = Some(cursor);
            }
            let row = match self.cursor.as_mut() {
                Some(cursor) => cursor.next().await?,
                None => None,
            };
            let Some(row) = row else {
                if let Some(mut cursor) = self.cursor.take() {
                    cursor.close().await?;
                }
                self.phase = match self.phase {
                    Phase::Hashed => Phase::NonHashed,
                    _ => Phase::Done,
                };
                continue;
            };

            if self.phase == Phase::Hashed {
                let id = row.get(ID_FIELD).and_then(Value::as_str).unwrap_or_default();
                let digest = row.get(DIGEST_FIELD).and_then(Value::as_str).unwrap_or_default();
                match ChangeRecord::from_digest(id, digest) {
                    Ok(record) => return Ok(Some(record)),
                    Err(e) => {
                        tracing::warn!("Rehashing '{}' in '{}': {}", id, self.domain, e);
                    }
                }
            }

            let record = ChangeRecord::compute(&row)?;
            self.pending.push((record.id.clone(), record.digest()));
            if self.pending.len() >= self.batch_size {
                self.flush_pending().await?;
            }
            return Ok(Some(record));
        }
    }

    /// Write back buffered digests, then release the cursor.
    pub async fn close(&mut self) -> AdapterResult<()> {
        if self.closed {
            return Ok(());
        }
        self.flush_pending().await?;
        if let Some(mut cursor) = self.cursor.take() {
            cursor.close().await?;
        }
        self.closed = true;
        Ok(())
    }

    /// Records as a stream; the iterator is closed once it is exhausted.
    pub fn into_stream(mut self) -> impl Stream<Item = AdapterResult<ChangeRecord>> + Send {
        async_stream::try_stream! {
            while let Some(record) = self.next().await? {
                yield record;
            }
            self.close().await?;
        }
    }

    async fn flush_pending(&mut self) -> AdapterResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let ops: Vec<BulkOp> = self
            .pending
            .drain(..)
            .map(|(id, digest)| {
                BulkOp::update_one(
                    json!({ ID_FIELD: id }),
                    json!({ "$set": { DIGEST_FIELD: digest } }),
                )
            })
            .collect();
        tracing::debug!("Writing back {} digests to '{}'", ops.len(), self.domain);
        let store = &self.store;
        let domain = &self.domain;
        self.limiter
            .exec("write_digests", domain, async {
                Ok(store.bulk_write(domain, &ops, false).await?)
            })
            .await?;
        Ok(())
    }
}

impl Drop for ChangeHashIterator {
    fn drop(&mut self) {
        if !self.closed && !self.pending.is_empty() {
            tracing::warn!(
                "Change iterator on '{}' dropped with {} digests not written",
                self.domain,
                self.pending.len()
            );
        }
    }
}
