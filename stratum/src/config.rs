//! Buffer pool configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StratumError};

/// Bytes per page, including the page header.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Default number of pages the buffer pool caches.
pub const DEFAULT_CAPACITY: usize = 50;

/// Default interval between lock acquisition attempts, in milliseconds.
pub const DEFAULT_LOCK_POLL_INTERVAL_MS: u64 = 500;

/// Configuration for [`BufferPool`](crate::buffer_pool::BufferPool).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferPoolConfig {
    /// Page size in bytes.
    pub page_size: usize,
    /// Maximum number of resident pages.
    pub capacity: usize,
    /// Upper bound on how long a blocked lock request sleeps before it
    /// retries and re-runs deadlock detection.
    pub lock_poll_interval_ms: u64,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            capacity: DEFAULT_CAPACITY,
            lock_poll_interval_ms: DEFAULT_LOCK_POLL_INTERVAL_MS,
        }
    }
}

impl BufferPoolConfig {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }

    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(StratumError::InvalidConfig(
                "capacity must be at least one page".to_string(),
            ));
        }
        if self.page_size == 0 {
            return Err(StratumError::InvalidConfig(
                "page_size must be positive".to_string(),
            ));
        }
        if self.lock_poll_interval_ms == 0 {
            return Err(StratumError::InvalidConfig(
                "lock_poll_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BufferPoolConfig::default();
        assert_eq!(config.page_size, 4096);
        assert_eq!(config.capacity, 50);
        assert_eq!(config.lock_poll_interval(), Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = BufferPoolConfig::from_json_str(r#"{ "capacity": 8 }"#).unwrap();
        assert_eq!(config.capacity, 8);
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(config.lock_poll_interval_ms, DEFAULT_LOCK_POLL_INTERVAL_MS);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = BufferPoolConfig::from_json_str(r#"{ "capacity": 0 }"#).unwrap_err();
        assert!(matches!(err, StratumError::InvalidConfig(_)));
    }

    #[test]
    fn test_malformed_json() {
        let err = BufferPoolConfig::from_json_str("{ capacity: ").unwrap_err();
        assert!(matches!(err, StratumError::Json(_)));
    }

    #[test]
    fn test_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.json");
        std::fs::write(&path, r#"{ "page_size": 512, "lock_poll_interval_ms": 5 }"#).unwrap();

        let config = BufferPoolConfig::from_path(&path).unwrap();
        assert_eq!(config.page_size, 512);
        assert_eq!(config.capacity, DEFAULT_CAPACITY);
        assert_eq!(config.lock_poll_interval(), Duration::from_millis(5));
    }
}
