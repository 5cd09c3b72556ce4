//! Typed, `serde`-deserializable configuration for the cache brain and
//! dispatcher.
//!
//! Durations are stored as plain integers (seconds/milliseconds) rather than
//! `std::time::Duration` so the type derives `Deserialize` without a helper
//! crate; the `*_duration()` accessors convert to `Duration` at the point of
//! use.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// 64 MiB, the fixed page size the design is built around.
pub const DEFAULT_PAGE_SIZE: u64 = 64 * 1024 * 1024;
pub const DEFAULT_HARD_MAX_CACHED: usize = 192;
pub const DEFAULT_SOFT_MAX_CACHED: usize = 176;
pub const DEFAULT_IDLE_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_WAIT_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_WRITE_THROTTLE_INTERVAL_MILLIS: u64 = 5;
pub const DEFAULT_MINIMUM_REDUNDANCY: f64 = 2.5;
/// Not a brain tunable; a property of the remote store collaborator, kept
/// here purely as the dispatcher's configured view of it (§4.3 step 3).
pub const DEFAULT_MAX_CONCURRENT_UPLOADS: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Size of the virtual device in bytes. `page_count` is derived from
    /// this and `page_size`.
    pub device_size: u64,
    pub page_size: u64,
    pub hard_max_cached: usize,
    pub soft_max_cached: usize,
    pub idle_interval_secs: u64,
    pub wait_interval_secs: u64,
    pub write_throttle_interval_millis: u64,
    pub minimum_redundancy: f64,
    pub max_concurrent_uploads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device_size: 0,
            page_size: DEFAULT_PAGE_SIZE,
            hard_max_cached: DEFAULT_HARD_MAX_CACHED,
            soft_max_cached: DEFAULT_SOFT_MAX_CACHED,
            idle_interval_secs: DEFAULT_IDLE_INTERVAL_SECS,
            wait_interval_secs: DEFAULT_WAIT_INTERVAL_SECS,
            write_throttle_interval_millis: DEFAULT_WRITE_THROTTLE_INTERVAL_MILLIS,
            minimum_redundancy: DEFAULT_MINIMUM_REDUNDANCY,
            max_concurrent_uploads: DEFAULT_MAX_CONCURRENT_UPLOADS,
        }
    }
}

impl Config {
    /// Parse a TOML document, filling in defaults for any field left unset.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and parse a TOML config file from disk.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// The same rule the brain enforces at construction, checked early so a
    /// misconfigured cache never even attempts its startup reconciliation.
    pub fn validate(&self) -> Result<()> {
        if self.soft_max_cached >= self.hard_max_cached {
            return Err(Error::ConfigInvalid {
                soft: self.soft_max_cached,
                hard: self.hard_max_cached,
            });
        }
        Ok(())
    }

    pub fn page_count(&self) -> u64 {
        if self.device_size == 0 {
            0
        } else {
            self.device_size.div_ceil(self.page_size)
        }
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_secs(self.idle_interval_secs)
    }

    pub fn wait_interval(&self) -> Duration {
        Duration::from_secs(self.wait_interval_secs)
    }

    pub fn write_throttle_interval(&self) -> Duration {
        Duration::from_millis(self.write_throttle_interval_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_tunables() {
        let config = Config::default();
        assert_eq!(config.page_size, 64 * 1024 * 1024);
        assert_eq!(config.hard_max_cached, 192);
        assert_eq!(config.soft_max_cached, 176);
        assert_eq!(config.idle_interval(), Duration::from_secs(30));
        assert_eq!(config.wait_interval(), Duration::from_secs(5));
        assert_eq!(config.write_throttle_interval(), Duration::from_millis(5));
        assert_eq!(config.minimum_redundancy, 2.5);
    }

    #[test]
    fn page_count_rounds_up() {
        let mut config = Config {
            device_size: 64 * 1024 * 1024 + 1,
            page_size: 64 * 1024 * 1024,
            ..Config::default()
        };
        assert_eq!(config.page_count(), 2);

        config.device_size = 64 * 1024 * 1024;
        assert_eq!(config.page_count(), 1);
    }

    #[test]
    fn from_toml_str_fills_in_defaults() {
        let config = Config::from_toml_str(
            r#"
            device_size = 1099511627776
            hard_max_cached = 8
            soft_max_cached = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.device_size, 1_099_511_627_776);
        assert_eq!(config.hard_max_cached, 8);
        assert_eq!(config.soft_max_cached, 4);
        // untouched fields keep their defaults
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn rejects_soft_ge_hard() {
        let err = Config::from_toml_str(
            r#"
            device_size = 1
            hard_max_cached = 10
            soft_max_cached = 10
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid { soft: 10, hard: 10 }));
    }
}
