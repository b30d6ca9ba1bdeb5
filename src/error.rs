use thiserror::Error;

/// A single entry of a batched write that the document database rejected.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct WriteFailure {
    /// Position of the operation inside the submitted batch
    pub index: usize,
    pub message: String,
}

/// Errors raised by a [`NativeStore`](crate::native::NativeStore) implementation
#[derive(Error, Debug, Clone)]
pub enum NativeError {
    /// Some entries of an unordered batch failed. An empty `failures` list
    /// means the whole batch was rejected before any entry was applied.
    #[error("Bulk write failed ({} failing entries)", failures.len())]
    BulkWrite { failures: Vec<WriteFailure> },

    #[error("Duplicate key '{0}'")]
    DuplicateKey(String),

    #[error("Invalid operator: {0}")]
    InvalidOperator(String),

    #[error("Invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub type NativeResult<T> = Result<T, NativeError>;

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("Class '{0}' not found")]
    ClassNotFound(String),

    #[error("No domain for class '{0}'")]
    DomainNotFound(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("Query on '{class}' failed: {message} (filter: {filter})")]
    Query {
        class: String,
        filter: String,
        message: String,
    },

    #[error("Bulk write on domain '{domain}' failed for {} operations", failures.len())]
    BulkWrite {
        domain: String,
        failures: Vec<WriteFailure>,
    },

    #[error("Native store error: {0}")]
    Native(#[from] NativeError),

    #[error("Invalid digest '{0}'")]
    InvalidDigest(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type AdapterResult<T> = Result<T, AdapterError>;

impl serde::Serialize for AdapterError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl From<tokio::sync::AcquireError> for AdapterError {
    fn from(err: tokio::sync::AcquireError) -> Self {
        AdapterError::Internal(format!("limiter closed: {}", err))
    }
}

/// Cut a string to at most `limit` characters, marking the cut.
pub fn truncate_for_log(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut out: String = text.chars().take(limit).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = AdapterError::ClassNotFound("tracker:class:Issue".to_string());
        assert_eq!(err.to_string(), "Class 'tracker:class:Issue' not found");

        let err = AdapterError::DomainNotFound("core:class:Obj".to_string());
        assert_eq!(err.to_string(), "No domain for class 'core:class:Obj'");

        let err = AdapterError::InvalidQuery("bad sort".to_string());
        assert_eq!(err.to_string(), "Invalid query: bad sort");

        let err = AdapterError::InvalidDigest("abc".to_string());
        assert_eq!(err.to_string(), "Invalid digest 'abc'");
    }

    #[test]
    fn test_bulk_write_errors() {
        let err = AdapterError::BulkWrite {
            domain: "task".to_string(),
            failures: vec![WriteFailure {
                index: 2,
                message: "duplicate".to_string(),
            }],
        };
        assert_eq!(
            err.to_string(),
            "Bulk write on domain 'task' failed for 1 operations"
        );

        let native = NativeError::BulkWrite { failures: vec![] };
        assert_eq!(native.to_string(), "Bulk write failed (0 failing entries)");
        let wrapped: AdapterError = native.into();
        assert!(matches!(wrapped, AdapterError::Native(_)));
    }

    #[test]
    fn test_truncate_for_log() {
        assert_eq!(truncate_for_log("short", 10), "short");
        assert_eq!(truncate_for_log("abcdefghij", 4), "abcd...");
    }

    #[test]
    fn test_error_serializes_as_message() {
        let err = AdapterError::Config("bad value".to_string());
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(json, "\"Configuration error: bad value\"");
    }
}
