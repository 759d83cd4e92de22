//! Aggregation engine configuration.

use crate::error::{ConsumerError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_GROUP_ID: &str = "aggregators";
pub const DEFAULT_TOPIC: &str = "statistics";
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// Settings for one [`Aggregator`](crate::Aggregator).
///
/// - `group_id`: consumer group shared by every engine instance, so each partition
///   is owned by exactly one instance at a time
/// - `topic`: topic carrying statistics samples and delete requests
/// - `flush_interval`: minimum time between sample-triggered flushes
/// - `flush_timeout`: upper bound on one flush transaction; a flush that takes longer
///   counts as failed and is retried at the next trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub group_id: String,
    pub topic: String,
    pub flush_interval: Duration,
    pub flush_timeout: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            group_id: DEFAULT_GROUP_ID.to_string(),
            topic: DEFAULT_TOPIC.to_string(),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
        }
    }
}

impl AggregatorConfig {
    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = group_id.into();
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.group_id.trim().is_empty() {
            return Err(ConsumerError::ConfigError("group_id must not be empty".into()));
        }
        if self.topic.trim().is_empty() {
            return Err(ConsumerError::ConfigError("topic must not be empty".into()));
        }
        if self.flush_timeout.is_zero() {
            return Err(ConsumerError::ConfigError(
                "flush_timeout must be greater than zero".into(),
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
        let config = AggregatorConfig::default();
        assert_eq!(config.group_id, "aggregators");
        assert_eq!(config.topic, "statistics");
        assert_eq!(config.flush_interval, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let config = AggregatorConfig::default().group_id(" ");
        assert!(matches!(config.validate(), Err(ConsumerError::ConfigError(_))));

        let config = AggregatorConfig::default().flush_timeout(Duration::ZERO);
        assert!(matches!(config.validate(), Err(ConsumerError::ConfigError(_))));

        // A zero interval means flush after every sample
        let config = AggregatorConfig::default().flush_interval(Duration::ZERO);
        assert!(config.validate().is_ok());
    }
}
