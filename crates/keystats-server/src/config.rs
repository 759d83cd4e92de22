//! Environment configuration for the server binary.

use keystats_consumer::config::{
    AggregatorConfig, DEFAULT_FLUSH_INTERVAL, DEFAULT_FLUSH_TIMEOUT, DEFAULT_GROUP_ID,
    DEFAULT_TOPIC,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_DB_PATH: &str = "./data/keystats.db";
pub const DEFAULT_API_PORT: u16 = 8080;
pub const DEFAULT_PARTITIONS: u32 = 8;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?} ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid aggregator configuration: {0}")]
    Aggregator(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub db_path: PathBuf,
    pub api_addr: SocketAddr,
    pub aggregator: AggregatorConfig,
    /// Partition count of the in-process topic.
    pub partitions: u32,
    /// Kafka bootstrap servers. Only used when built with the `kafka` feature.
    pub brokers: Option<String>,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let db_path = lookup("KEYSTATS_DB").unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let api_addr = parse_var::<SocketAddr, _>(&lookup, "KEYSTATS_API_ADDR")?
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], DEFAULT_API_PORT)));

        let flush_interval = parse_var::<u64, _>(&lookup, "KEYSTATS_FLUSH_INTERVAL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_FLUSH_INTERVAL);
        let flush_timeout = parse_var::<u64, _>(&lookup, "KEYSTATS_FLUSH_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_FLUSH_TIMEOUT);

        let aggregator = AggregatorConfig::default()
            .group_id(lookup("KEYSTATS_GROUP_ID").unwrap_or_else(|| DEFAULT_GROUP_ID.to_string()))
            .topic(lookup("KEYSTATS_TOPIC").unwrap_or_else(|| DEFAULT_TOPIC.to_string()))
            .flush_interval(flush_interval)
            .flush_timeout(flush_timeout);
        aggregator
            .validate()
            .map_err(|e| ConfigError::Aggregator(e.to_string()))?;

        let partitions = parse_var::<u32, _>(&lookup, "KEYSTATS_PARTITIONS")?
            .unwrap_or(DEFAULT_PARTITIONS);
        if partitions == 0 {
            return Err(ConfigError::InvalidValue {
                var: "KEYSTATS_PARTITIONS",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            db_path: PathBuf::from(db_path),
            api_addr,
            aggregator,
            partitions,
            brokers: lookup("KEYSTATS_BROKERS").filter(|b| !b.is_empty()),
        })
    }
}

fn parse_var<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| invalid(var, &value, e)),
        None => Ok(None),
    }
}

fn invalid(var: &'static str, value: &str, reason: impl std::fmt::Display) -> ConfigError {
    ConfigError::InvalidValue {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
