pub mod adapter;
pub mod config;
pub mod error;
pub mod limiter;
pub mod model;
pub mod native;
pub mod query;
pub mod sync;
pub mod transaction;

pub use adapter::DocumentAdapter;
pub use config::AdapterConfig;
pub use error::{AdapterError, AdapterResult, NativeError, NativeResult};
pub use model::{ClassHierarchy, Document, Hierarchy, ModelLookup};
pub use native::{MemoryStore, NativeStore};
pub use query::{FindOptions, FindResult, LookupSpec, SortRules, SortSpec};
pub use sync::{ChangeHashIterator, ChangeRecord};
pub use transaction::{Transaction, TxMeta};
