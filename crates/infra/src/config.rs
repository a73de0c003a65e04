//! Subscriber configuration.
//!
//! Defaults come from `Default`; [`SubscriberConfig::from_env`] overrides them from
//! environment variables.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

pub const ENV_SUBSCRIPTION_GROUP: &str = "CUSTOS_SUBSCRIPTION_GROUP";
pub const ENV_POOL_SIZE: &str = "CUSTOS_SUBSCRIPTION_POOL_SIZE";
pub const ENV_BUFFER_SIZE: &str = "CUSTOS_SUBSCRIPTION_BUFFER_SIZE";
pub const ENV_RECEIVE_TIMEOUT_MS: &str = "CUSTOS_RECEIVE_TIMEOUT_MS";
pub const ENV_MAX_REDELIVERIES: &str = "CUSTOS_MAX_REDELIVERIES";
pub const ENV_MAX_CONFLICT_RETRIES: &str = "CUSTOS_MAX_CONFLICT_RETRIES";
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_REDIS_URL: &str = "REDIS_URL";
pub const ENV_STREAM_KEY: &str = "CUSTOS_STREAM_KEY";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

/// Persistent-subscription settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionConfig {
    /// Durable consumer group shared by every worker.
    pub group_name: String,
    /// Number of worker threads.
    pub pool_size: usize,
    /// Deliveries fetched per broker read.
    pub buffer_size: usize,
    /// How long one receive blocks before checking for cancellation.
    pub receive_timeout: Duration,
    /// Retries before a failing event is parked.
    pub max_redeliveries: u32,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            group_name: "custos-graph".to_string(),
            pool_size: 4,
            buffer_size: 32,
            receive_timeout: Duration::from_millis(250),
            max_redeliveries: 5,
        }
    }
}

impl SubscriptionConfig {
    pub fn with_group_name(mut self, name: impl Into<String>) -> Self {
        self.group_name = name.into();
        self
    }

    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }
}

/// Command-side settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Reload-and-retry attempts after an append conflict.
    pub max_conflict_retries: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { max_conflict_retries: 3 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberConfig {
    pub subscription: SubscriptionConfig,
    pub dispatch: DispatchConfig,
    /// Postgres event store and read model. In-memory backends when unset.
    pub database_url: Option<String>,
    /// Redis Streams broker. In-memory hub when unset.
    pub redis_url: Option<String>,
    /// Redis stream every event is published to.
    pub stream_key: String,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            subscription: SubscriptionConfig::default(),
            dispatch: DispatchConfig::default(),
            database_url: None,
            redis_url: None,
            stream_key: "custos:events".to_string(),
        }
    }
}

impl SubscriberConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Missing or blank keys keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(group) = get(ENV_SUBSCRIPTION_GROUP) {
            config.subscription.group_name = group;
        }
        if let Some(size) = parse::<usize>(ENV_POOL_SIZE, get(ENV_POOL_SIZE))? {
            if size == 0 {
                return Err(ConfigError::Invalid {
                    key: ENV_POOL_SIZE.to_string(),
                    value: "0".to_string(),
                });
            }
            config.subscription.pool_size = size;
        }
        if let Some(size) = parse::<usize>(ENV_BUFFER_SIZE, get(ENV_BUFFER_SIZE))? {
            config.subscription.buffer_size = size.max(1);
        }
        if let Some(ms) = parse::<u64>(ENV_RECEIVE_TIMEOUT_MS, get(ENV_RECEIVE_TIMEOUT_MS))? {
            config.subscription.receive_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = parse::<u32>(ENV_MAX_REDELIVERIES, get(ENV_MAX_REDELIVERIES))? {
            config.subscription.max_redeliveries = n;
        }
        if let Some(n) = parse::<u32>(ENV_MAX_CONFLICT_RETRIES, get(ENV_MAX_CONFLICT_RETRIES))? {
            config.dispatch.max_conflict_retries = n;
        }
        config.database_url = get(ENV_DATABASE_URL);
        config.redis_url = get(ENV_REDIS_URL);
        if let Some(key) = get(ENV_STREAM_KEY) {
            config.stream_key = key;
        }

        Ok(config)
    }
}

fn parse<T: FromStr>(key: &str, raw: Option<String>) -> Result<Option<T>, ConfigError> {
    raw.map(|value| {
        value.trim().parse::<T>().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value,
        })
    })
    .transpose()
}
