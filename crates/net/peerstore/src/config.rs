//! Address book configuration (TOML-serializable).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};

use crate::error::AddrBookError;

/// Default number of peers whose address lists are cached.
pub const DEFAULT_CACHE_SIZE: usize = 1024;

/// Default interval between TTL sweeps.
pub const DEFAULT_TTL_INTERVAL: Duration = Duration::from_secs(1);

/// Default number of attempts for a transactional write.
pub const DEFAULT_WRITE_RETRIES: u32 = 5;

/// Address book configuration.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrBookConfig {
    /// Peers kept in the address cache. Zero disables caching.
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,

    /// How often expired addresses are swept from the store, in milliseconds.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_ttl_interval")]
    pub ttl_interval: Duration,

    /// Attempts per transactional write before giving up. Zero is treated as one.
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,
}

impl Default for AddrBookConfig {
    fn default() -> Self {
        Self {
            cache_size: default_cache_size(),
            ttl_interval: default_ttl_interval(),
            write_retries: default_write_retries(),
        }
    }
}

impl AddrBookConfig {
    pub fn with_cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    pub fn with_ttl_interval(mut self, ttl_interval: Duration) -> Self {
        self.ttl_interval = ttl_interval;
        self
    }

    pub fn with_write_retries(mut self, write_retries: u32) -> Self {
        self.write_retries = write_retries;
        self
    }

    /// Number of write attempts actually made.
    pub fn write_attempts(&self) -> u32 {
        self.write_retries.max(1)
    }

    pub fn validate(&self) -> Result<(), AddrBookError> {
        if self.ttl_interval.is_zero() {
            return Err(AddrBookError::InvalidConfig(
                "ttl_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_cache_size() -> usize {
    DEFAULT_CACHE_SIZE
}

fn default_ttl_interval() -> Duration {
    DEFAULT_TTL_INTERVAL
}

fn default_write_retries() -> u32 {
    DEFAULT_WRITE_RETRIES
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AddrBookConfig::default();
        assert_eq!(config.cache_size, 1024);
        assert_eq!(config.ttl_interval, Duration::from_secs(1));
        assert_eq!(config.write_retries, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_partial() {
        let config: AddrBookConfig = toml::from_str("ttl_interval = 250\n").unwrap();
        assert_eq!(config.ttl_interval, Duration::from_millis(250));
        assert_eq!(config.cache_size, DEFAULT_CACHE_SIZE);
        assert_eq!(config.write_retries, DEFAULT_WRITE_RETRIES);
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = AddrBookConfig::default()
            .with_cache_size(0)
            .with_write_retries(2);
        let encoded = toml::to_string(&config).unwrap();
        assert!(encoded.contains("ttl_interval = 1000"));
        let decoded: AddrBookConfig = toml::from_str(&encoded).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn test_validate() {
        let config = AddrBookConfig::default().with_ttl_interval(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(AddrBookError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_write_attempts_at_least_one() {
        assert_eq!(AddrBookConfig::default().with_write_retries(0).write_attempts(), 1);
        assert_eq!(AddrBookConfig::default().with_write_retries(3).write_attempts(), 3);
    }
}
