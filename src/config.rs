//! Adapter configuration.
//!
//! Values come from defaults, a TOML file, or `DOCBRIDGE_*` environment
//! variables.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{AdapterError, AdapterResult};

/// Configuration for the document adapter
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Maximum number of concurrently executing queries
    pub read_concurrency: usize,
    /// Maximum number of concurrently executing batched writes
    pub write_concurrency: usize,
    /// Queue delay or execution time above which an operation is reported as slow
    pub slow_threshold_ms: u64,
    /// Number of digest write-backs buffered by the change-hash iterator
    pub hash_batch_size: usize,
    /// Maximum length of serialized filters embedded in log and error messages
    pub log_truncate: usize,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            read_concurrency: 1000,
            write_concurrency: 5,
            slow_threshold_ms: 1000,
            hash_batch_size: 1000,
            log_truncate: 512,
        }
    }
}

impl AdapterConfig {
    pub fn slow_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_threshold_ms)
    }

    /// Build a configuration from `DOCBRIDGE_*` environment variables,
    /// falling back to defaults for unset ones.
    pub fn from_env() -> AdapterResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> AdapterResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(v) = parse_var(&lookup, "DOCBRIDGE_READ_CONCURRENCY")? {
            config.read_concurrency = v as usize;
        }
        if let Some(v) = parse_var(&lookup, "DOCBRIDGE_WRITE_CONCURRENCY")? {
            config.write_concurrency = v as usize;
        }
        if let Some(v) = parse_var(&lookup, "DOCBRIDGE_SLOW_THRESHOLD_MS")? {
            config.slow_threshold_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "DOCBRIDGE_HASH_BATCH_SIZE")? {
            config.hash_batch_size = v as usize;
        }
        if let Some(v) = parse_var(&lookup, "DOCBRIDGE_LOG_TRUNCATE")? {
            config.log_truncate = v as usize;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> AdapterResult<Self> {
        let config: AdapterConfig =
            toml::from_str(text).map_err(|e| AdapterError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> AdapterResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            AdapterError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> AdapterResult<()> {
        if self.read_concurrency == 0 || self.write_concurrency == 0 {
            return Err(AdapterError::Config(
                "concurrency limits must be greater than zero".to_string(),
            ));
        }
        if self.hash_batch_size == 0 {
            return Err(AdapterError::Config(
                "hash_batch_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<F>(lookup: &F, name: &str) -> AdapterResult<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| AdapterError::Config(format!("{} must be a number, got '{}'", name, raw))),
    }
}
