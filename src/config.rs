use serde::Deserialize;

use crate::error::Result;
use crate::reactor::{DEFAULT_EVENTS_CAPACITY, DEFAULT_POLL_TIMEOUT_MS};
use crate::thread_pool::DEFAULT_POOL_CAPACITY;

/// Worker count used when none is configured: one per available CPU.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(DEFAULT_POOL_CAPACITY)
}

/// Reactor and dispatch pool settings.
///
/// ```toml
/// events_capacity = 1024
/// poll_timeout_ms = 100
/// workers = 8
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReactorConfig {
    /// Readiness entries returned by one poll.
    pub events_capacity: usize,
    /// Upper bound on how long one poll may block.
    pub poll_timeout_ms: u64,
    /// Dispatch worker threads.
    pub workers: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            events_capacity: DEFAULT_EVENTS_CAPACITY,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            workers: default_workers(),
        }
    }
}

impl ReactorConfig {
    pub fn builder() -> ReactorConfigBuilder {
        ReactorConfigBuilder::default()
    }

    pub fn from_toml_str(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }
}

#[derive(Default)]
pub struct ReactorConfigBuilder {
    events_capacity: Option<usize>,
    poll_timeout_ms: Option<u64>,
    workers: Option<usize>,
}

impl ReactorConfigBuilder {
    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = Some(capacity);
        self
    }

    pub fn poll_timeout_ms(mut self, timeout: u64) -> Self {
        self.poll_timeout_ms = Some(timeout);
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn build(self) -> ReactorConfig {
        let default = ReactorConfig::default();
        ReactorConfig {
            events_capacity: self.events_capacity.unwrap_or(default.events_capacity),
            poll_timeout_ms: self.poll_timeout_ms.unwrap_or(default.poll_timeout_ms),
            workers: self.workers.unwrap_or(default.workers),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_builder_overrides_defaults() {
        let config = ReactorConfig::builder().poll_timeout_ms(5).workers(3).build();
        assert_eq!(config.events_capacity, DEFAULT_EVENTS_CAPACITY);
        assert_eq!(config.poll_timeout_ms, 5);
        assert_eq!(config.workers, 3);
    }

    #[test]
    fn test_from_toml_partial() {
        let config = ReactorConfig::from_toml_str("events_capacity = 64").unwrap();
        assert_eq!(config.events_capacity, 64);
        assert_eq!(config.poll_timeout_ms, DEFAULT_POLL_TIMEOUT_MS);
        assert!(config.workers >= 1);
    }

    #[test]
    fn test_from_toml_rejects_bad_types() {
        let err = ReactorConfig::from_toml_str("poll_timeout_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
