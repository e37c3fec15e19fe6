//! Runtime sizing for a crypt target.
//!
//! Defaults follow the host: one crypt worker per CPU, and the pool sizes a
//! single device needs to keep making progress under memory pressure. Every
//! field can be overridden from the environment or from a JSON file.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CryptError, Result};

/// Control blocks reserved per device.
pub const MIN_IOS: usize = 256;

/// Data pages reserved per device.
pub const MIN_POOL_PAGES: usize = 32;

pub const ENV_WORKERS: &str = "CRYPT_WORKERS";
pub const ENV_IO_POOL: &str = "CRYPT_IO_POOL";
pub const ENV_POOL_PAGES: &str = "CRYPT_POOL_PAGES";
pub const ENV_ALLOC_TIMEOUT_MS: &str = "CRYPT_ALLOC_TIMEOUT_MS";
pub const ENV_BACKOFF_MS: &str = "CRYPT_BACKOFF_MS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Crypt workers running conversion and submission.
    pub workers: usize,
    /// Pending-request control blocks.
    pub io_pool_size: usize,
    /// Data pages for write clones; staged segments get a pool of the same size.
    pub page_pool_size: usize,
    /// Upper bound on one staging page allocation.
    pub alloc_timeout_ms: u64,
    /// Pause between partial write clones.
    pub congestion_backoff_ms: u64,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            workers: std::cmp::max(1, num_cpus::get()),
            io_pool_size: MIN_IOS,
            page_pool_size: MIN_POOL_PAGES,
            alloc_timeout_ms: 1_000,
            congestion_backoff_ms: 10,
        }
    }
}

fn env_override<T: std::str::FromStr>(name: &str, slot: &mut T) -> Result<()> {
    if let Ok(raw) = std::env::var(name) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|_| CryptError::config(format!("{name}={raw:?} is not a valid number")))?;
    }
    Ok(())
}

impl TargetConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Result<Self> {
        env_override(ENV_WORKERS, &mut self.workers)?;
        env_override(ENV_IO_POOL, &mut self.io_pool_size)?;
        env_override(ENV_POOL_PAGES, &mut self.page_pool_size)?;
        env_override(ENV_ALLOC_TIMEOUT_MS, &mut self.alloc_timeout_ms)?;
        env_override(ENV_BACKOFF_MS, &mut self.congestion_backoff_ms)?;
        self.validate()?;
        Ok(self)
    }

    /// Parse a JSON document; missing fields keep their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| CryptError::config(format!("bad config JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(CryptError::config("workers must be at least 1"));
        }
        if self.io_pool_size == 0 {
            return Err(CryptError::config("io_pool_size must be at least 1"));
        }
        if self.page_pool_size == 0 {
            return Err(CryptError::config("page_pool_size must be at least 1"));
        }
        Ok(())
    }

    pub fn alloc_timeout(&self) -> Duration {
        Duration::from_millis(self.alloc_timeout_ms)
    }

    pub fn congestion_backoff(&self) -> Duration {
        Duration::from_millis(self.congestion_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TargetConfig::default();
        assert!(config.workers >= 1);
        assert_eq!(config.io_pool_size, MIN_IOS);
        assert_eq!(config.page_pool_size, MIN_POOL_PAGES);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_partial_override() {
        let config = TargetConfig::from_json(r#"{"page_pool_size": 4, "workers": 2}"#).unwrap();
        assert_eq!(config.page_pool_size, 4);
        assert_eq!(config.workers, 2);
        assert_eq!(config.io_pool_size, MIN_IOS);
    }

    #[test]
    fn test_json_rejects_zero_pool() {
        let err = TargetConfig::from_json(r#"{"io_pool_size": 0}"#).unwrap_err();
        assert!(err.to_string().contains("io_pool_size"));
        assert!(TargetConfig::from_json("not json").is_err());
    }

    #[test]
    fn test_env_overrides() {
        // Only this test touches these variables.
        std::env::set_var(ENV_BACKOFF_MS, "3");
        std::env::set_var(ENV_POOL_PAGES, "12");
        let config = TargetConfig::from_env().unwrap();
        assert_eq!(config.congestion_backoff(), Duration::from_millis(3));
        assert_eq!(config.page_pool_size, 12);

        std::env::set_var(ENV_POOL_PAGES, "lots");
        assert!(TargetConfig::from_env().is_err());

        std::env::remove_var(ENV_BACKOFF_MS);
        std::env::remove_var(ENV_POOL_PAGES);
    }
}
