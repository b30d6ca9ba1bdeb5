//! Common test utilities for adapter tests
//!
//! Provides shared helper functions for:
//! - Building the tracker class hierarchy
//! - Creating adapters over an in-memory store
//! - Building transactions

#![allow(dead_code)]

use std::sync::Arc;

use docbridge::model::{AttributeType, DOC_CLASS};
use docbridge::transaction::{Transaction, TxMeta};
use docbridge::{AdapterConfig, ClassHierarchy, DocumentAdapter, MemoryStore};
use serde_json::{Map, Value};

pub const TASK: &str = "tracker:class:Task";
pub const ISSUE: &str = "tracker:class:Issue";
pub const MILESTONE: &str = "tracker:class:Milestone";
pub const COMMENT: &str = "chunter:class:Comment";
pub const ESTIMATE: &str = "tracker:mixin:Estimate";
pub const SPACE: &str = "core:class:Space";

pub fn hierarchy() -> ClassHierarchy {
    ClassHierarchy::builder()
        .class(TASK, DOC_CLASS, Some("task"))
        .class(ISSUE, TASK, None)
        .class(MILESTONE, DOC_CLASS, Some("task"))
        .class(COMMENT, DOC_CLASS, Some("chunter"))
        .class(SPACE, DOC_CLASS, Some("space"))
        .mixin(ESTIMATE, TASK)
        .attribute(TASK, "title", AttributeType::Plain)
        .attribute(
            TASK,
            "status",
            AttributeType::Enum(vec!["todo".into(), "doing".into(), "done".into()]),
        )
        .attribute(TASK, "dueDate", AttributeType::Date)
        .attribute(TASK, "space", AttributeType::Ref(SPACE.into()))
        .attribute(ESTIMATE, "hours", AttributeType::Plain)
        .build()
        .expect("Failed to build hierarchy")
}

pub fn create_test_adapter() -> (Arc<MemoryStore>, DocumentAdapter) {
    let store = Arc::new(MemoryStore::new());
    let adapter = DocumentAdapter::new(
        store.clone(),
        Arc::new(hierarchy()),
        None,
        AdapterConfig::default(),
    );
    (store, adapter)
}

pub fn meta(id: &str, class: &str) -> TxMeta {
    TxMeta::new(id, class, "s1", "user1").at(1_700_000_000_000)
}

pub fn map(value: Value) -> Map<String, Value> {
    value.as_object().cloned().expect("expected a JSON object")
}

pub fn create(id: &str, class: &str, attributes: Value) -> Transaction {
    Transaction::create(meta(id, class), map(attributes))
}

pub fn update(id: &str, class: &str, operations: Value) -> Transaction {
    Transaction::update(meta(id, class), map(operations))
}
