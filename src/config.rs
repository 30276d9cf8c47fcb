//! Hinted-handoff configuration.
//!
//! All options have defaults; deserialization rejects unknown keys so a typo
//! in an operator's config surfaces as an error instead of a silently ignored
//! setting.

use crate::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Default base directory for all per-node queues.
pub const DEFAULT_DIR: &str = "/var/lib/driftq/hh";
/// Default maximum bytes per queue before head eviction.
pub const DEFAULT_MAX_SIZE: u64 = 1024 * 1024 * 1024;
/// Default maximum bytes per segment before rollover.
pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 10 * 1024 * 1024;

/// Configuration for the hinted-handoff subsystem.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Base directory for all per-node queues.
    pub dir: PathBuf,
    /// Whether the subsystem is active. When false, `write_shard_hinted`
    /// rejects with `Error::Disabled`.
    pub enabled: bool,
    /// Maximum bytes per queue. Appending past this drops segments from the
    /// head until the block fits.
    pub max_size: u64,
    /// Maximum bytes per segment file before a new segment is opened.
    pub max_segment_size: u64,
    /// Segments older than this are purged on the purge tick.
    #[serde(with = "duration_ms")]
    pub max_age: Duration,
    /// Replay egress cap per processor in bytes/sec. 0 disables the limit.
    pub retry_rate_limit: u64,
    /// Initial delay between replay attempts after a failure.
    #[serde(with = "duration_ms")]
    pub retry_interval: Duration,
    /// Cap on the replay backoff delay.
    #[serde(with = "duration_ms")]
    pub retry_max_interval: Duration,
    /// Period of the purge and reap timers.
    #[serde(with = "duration_ms")]
    pub purge_interval: Duration,
    /// How often segment files are fsynced. Zero syncs on every write.
    #[serde(with = "duration_ms")]
    pub sync_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_DIR),
            enabled: true,
            max_size: DEFAULT_MAX_SIZE,
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            max_age: Duration::from_secs(7 * 24 * 60 * 60),
            retry_rate_limit: 0,
            retry_interval: Duration::from_secs(1),
            retry_max_interval: Duration::from_secs(60),
            purge_interval: Duration::from_secs(60 * 60),
            sync_interval: Duration::from_millis(100),
        }
    }
}

impl Config {
    /// Validate option combinations that cannot be expressed in the types.
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::Config("max_size must be greater than zero".into()));
        }
        if self.max_segment_size == 0 {
            return Err(Error::Config(
                "max_segment_size must be greater than zero".into(),
            ));
        }
        if self.max_segment_size > self.max_size {
            return Err(Error::Config(format!(
                "max_segment_size ({}) cannot exceed max_size ({})",
                self.max_segment_size, self.max_size
            )));
        }
        if self.retry_interval.is_zero() {
            return Err(Error::Config(
                "retry_interval must be greater than zero".into(),
            ));
        }
        if self.purge_interval.is_zero() {
            return Err(Error::Config(
                "purge_interval must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Directory holding the queue for one target node.
    pub fn node_dir(&self, node_id: u64) -> PathBuf {
        self.dir.join(node_id.to_string())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert!(config.enabled);
        assert_eq!(config.max_size, DEFAULT_MAX_SIZE);
        assert_eq!(config.retry_interval, Duration::from_secs(1));
        assert_eq!(config.retry_max_interval, Duration::from_secs(60));
    }

    #[test]
    fn deserializes_partial_config_with_defaults() {
        let config: Config = serde_json::from_str(
            r#"{"dir": "/tmp/hh", "max_size": 4096, "retry_interval": 250}"#,
        )
        .unwrap();
        assert_eq!(config.dir, PathBuf::from("/tmp/hh"));
        assert_eq!(config.max_size, 4096);
        assert_eq!(config.retry_interval, Duration::from_millis(250));
        assert_eq!(config.max_segment_size, DEFAULT_MAX_SEGMENT_SIZE);
    }

    #[test]
    fn rejects_unknown_keys() {
        let err = serde_json::from_str::<Config>(r#"{"max_siez": 4096}"#).unwrap_err();
        assert!(
            err.to_string().contains("max_siez"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn validate_rejects_zero_sizes() {
        let config = Config {
            max_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = Config {
            max_segment_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn validate_rejects_segment_larger_than_queue() {
        let config = Config {
            max_size: 1024,
            max_segment_size: 2048,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_segment_size"));
    }

    #[test]
    fn validate_rejects_zero_intervals() {
        let config = Config {
            retry_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            purge_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn node_dir_is_numeric_subdirectory() {
        let config = Config {
            dir: PathBuf::from("/var/lib/driftq/hh"),
            ..Default::default()
        };
        assert_eq!(config.node_dir(42), PathBuf::from("/var/lib/driftq/hh/42"));
    }
}
