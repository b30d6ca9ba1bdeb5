//! Seam to the underlying document database.
//!
//! The adapter speaks a small document-database dialect: filters, update
//! documents and aggregation pipelines are plain JSON values (`$in`, `$set`,
//! `$lookup`, ...). Any backend implementing [`NativeStore`] can sit below
//! the adapter; [`MemoryStore`] is the in-process one.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::NativeResult;

pub mod expr;
pub mod filter;
pub mod memory;
pub mod pipeline;
pub mod update;

pub use memory::MemoryStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl SortOrder {
    pub fn as_i64(self) -> i64 {
        match self {
            SortOrder::Ascending => 1,
            SortOrder::Descending => -1,
        }
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        match value.as_i64()? {
            1 => Some(SortOrder::Ascending),
            -1 => Some(SortOrder::Descending),
            _ => None,
        }
    }
}

/// Options of a plain (non-pipeline) find
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NativeFindOptions {
    pub sort: Vec<(String, SortOrder)>,
    pub limit: Option<usize>,
    pub projection: Option<Map<String, Value>>,
}

/// One entry of a batched write
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BulkOp {
    InsertOne {
        document: Value,
    },
    UpdateOne {
        filter: Value,
        update: Value,
        upsert: bool,
    },
    UpdateMany {
        filter: Value,
        update: Value,
    },
    DeleteOne {
        filter: Value,
    },
    DeleteMany {
        filter: Value,
    },
}

impl BulkOp {
    pub fn update_one(filter: Value, update: Value) -> Self {
        BulkOp::UpdateOne {
            filter,
            update,
            upsert: false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BulkOp::InsertOne { .. } => "insertOne",
            BulkOp::UpdateOne { .. } => "updateOne",
            BulkOp::UpdateMany { .. } => "updateMany",
            BulkOp::DeleteOne { .. } => "deleteOne",
            BulkOp::DeleteMany { .. } => "deleteMany",
        }
    }
}

/// Counters reported by a successful batched write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BulkWriteSummary {
    pub inserted: u64,
    pub matched: u64,
    pub modified: u64,
    pub deleted: u64,
    pub upserted: u64,
}

impl BulkWriteSummary {
    pub fn merge(&mut self, other: &BulkWriteSummary) {
        self.inserted += other.inserted;
        self.matched += other.matched;
        self.modified += other.modified;
        self.deleted += other.deleted;
        self.upserted += other.upserted;
    }
}

/// Forward-only cursor over a domain
#[async_trait::async_trait]
pub trait NativeCursor: Send {
    async fn next(&mut self) -> NativeResult<Option<Value>>;

    async fn close(&mut self) -> NativeResult<()>;
}

/// Document database operations the adapter relies on
#[async_trait::async_trait]
pub trait NativeStore: Send + Sync {
    async fn find(
        &self,
        domain: &str,
        filter: &Value,
        options: &NativeFindOptions,
    ) -> NativeResult<Vec<Value>>;

    async fn find_one(
        &self,
        domain: &str,
        filter: &Value,
        options: &NativeFindOptions,
    ) -> NativeResult<Option<Value>> {
        let mut options = options.clone();
        options.limit = Some(1);
        Ok(self.find(domain, filter, &options).await?.into_iter().next())
    }

    async fn count(&self, domain: &str, filter: &Value) -> NativeResult<u64>;

    async fn aggregate(&self, domain: &str, pipeline: &[Value]) -> NativeResult<Vec<Value>>;

    /// Execute a batch of writes. With `ordered == false` every entry is
    /// attempted even when earlier ones fail.
    async fn bulk_write(
        &self,
        domain: &str,
        ops: &[BulkOp],
        ordered: bool,
    ) -> NativeResult<BulkWriteSummary>;

    async fn find_one_and_update(
        &self,
        domain: &str,
        filter: &Value,
        update: &Value,
        return_after: bool,
    ) -> NativeResult<Option<Value>>;

    async fn update_many(&self, domain: &str, filter: &Value, update: &Value) -> NativeResult<u64>;

    async fn open_cursor(&self, domain: &str, filter: &Value)
        -> NativeResult<Box<dyn NativeCursor>>;
}
