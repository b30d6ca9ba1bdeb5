//! Change detection for backup and sync.
//!
//! Consumers stream [`ChangeRecord`]s per domain and compare them with
//! their last snapshot to find what changed.

pub mod hash;

pub use hash::{ChangeHashIterator, ChangeRecord};
