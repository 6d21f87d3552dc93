//! Configuration types for the legacy Kafka client

use std::time::Duration;

use config::{Config, Environment};
use serde::{Deserialize, Serialize};

use crate::compression::Compression;
use crate::error::KafkaClientError;
use crate::protocol::{OffsetTime, ProtocolVersion};
use crate::Result;

pub const DEFAULT_PORT: u16 = 9092;
pub const DEFAULT_MAX_FETCH_SIZE: u32 = 1_000_000;

/// Broker connection configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Broker host name or address
    pub host: String,
    /// Broker port
    pub port: u16,
    /// Timeout applied to connect, every write and every read
    pub timeout: Duration,
    /// Number of attempts for a request write before giving up
    pub send_retries: usize,
    /// Protocol generation spoken by channels of this connection
    pub protocol: ProtocolVersion,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            timeout: Duration::from_secs(6),
            send_retries: 3,
            protocol: ProtocolVersion::V07,
        }
    }
}

impl ConnectionConfig {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::new()
    }

    /// `tcp://host:port`
    pub fn connection_string(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(KafkaClientError::invalid_config("Broker host cannot be empty"));
        }
        if self.send_retries == 0 {
            return Err(KafkaClientError::invalid_config(
                "Send retries must be a positive integer",
            ));
        }
        if self.timeout.is_zero() {
            return Err(KafkaClientError::invalid_config("Timeout must be positive"));
        }
        Ok(())
    }

    /// Load from `KAFKA_HOST`, `KAFKA_PORT`, `KAFKA_TIMEOUT_MS`,
    /// `KAFKA_SEND_RETRIES` and `KAFKA_PROTOCOL` (`v07` or `v08`).
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        let env: ConnectionEnv = load_env("KAFKA")?;
        let mut config = Self::default();
        if let Some(host) = env.host {
            config.host = host;
        }
        if let Some(port) = env.port {
            config.port = port;
        }
        if let Some(timeout_ms) = env.timeout_ms {
            config.timeout = Duration::from_millis(timeout_ms);
        }
        if let Some(send_retries) = env.send_retries {
            config.send_retries = send_retries;
        }
        if let Some(protocol) = env.protocol {
            config.protocol = protocol;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Producer-specific configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerConfig {
    /// Codec applied to messages added without an explicit one
    pub compression: Compression,
    /// Re-routing rounds after a failed produce
    pub max_retries: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            compression: Compression::None,
            max_retries: 1,
        }
    }
}

impl ProducerConfig {
    pub fn builder() -> ProducerConfigBuilder {
        ProducerConfigBuilder::new()
    }
}

/// Where a stream starts when no usable committed offset exists
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    Earliest,
    #[default]
    Latest,
}

impl OffsetReset {
    pub fn offset_time(self) -> OffsetTime {
        match self {
            OffsetReset::Earliest => OffsetTime::Earliest,
            OffsetReset::Latest => OffsetTime::Latest,
        }
    }
}

/// Consumer-specific configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Consumer group; streams commit offsets only when set
    pub group_id: Option<String>,
    /// Upper bound of a single fetch response in bytes
    pub max_fetch_size: u32,
    /// Start position when no usable committed offset exists
    pub offset_reset: OffsetReset,
    /// Minimum time between two commits of the same stream
    pub commit_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: None,
            max_fetch_size: DEFAULT_MAX_FETCH_SIZE,
            offset_reset: OffsetReset::Latest,
            commit_interval: Duration::from_secs(10),
        }
    }
}

impl ConsumerConfig {
    pub fn builder() -> ConsumerConfigBuilder {
        ConsumerConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_fetch_size == 0 {
            return Err(KafkaClientError::invalid_config(
                "Maximum fetch size must be a positive integer.",
            ));
        }
        if matches!(&self.group_id, Some(group) if group.is_empty()) {
            return Err(KafkaClientError::invalid_config("Group id cannot be empty"));
        }
        Ok(())
    }

    /// Load from `KAFKA_CONSUMER_GROUP_ID`, `KAFKA_CONSUMER_MAX_FETCH_SIZE`,
    /// `KAFKA_CONSUMER_OFFSET_RESET` and `KAFKA_CONSUMER_COMMIT_INTERVAL_MS`.
    pub fn from_env() -> Result<Self> {
        let env: ConsumerEnv = load_env("KAFKA_CONSUMER")?;
        let mut config = Self::default();
        if env.group_id.is_some() {
            config.group_id = env.group_id;
        }
        if let Some(max_fetch_size) = env.max_fetch_size {
            config.max_fetch_size = max_fetch_size;
        }
        if let Some(offset_reset) = env.offset_reset {
            config.offset_reset = offset_reset;
        }
        if let Some(interval_ms) = env.commit_interval_ms {
            config.commit_interval = Duration::from_millis(interval_ms);
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConnectionEnv {
    host: Option<String>,
    port: Option<u16>,
    timeout_ms: Option<u64>,
    send_retries: Option<usize>,
    protocol: Option<ProtocolVersion>,
}

#[derive(Debug, Default, Deserialize)]
struct ConsumerEnv {
    group_id: Option<String>,
    max_fetch_size: Option<u32>,
    offset_reset: Option<OffsetReset>,
    commit_interval_ms: Option<u64>,
}

fn load_env<T: serde::de::DeserializeOwned>(prefix: &str) -> Result<T> {
    let settings = Config::builder()
        .add_source(Environment::with_prefix(prefix))
        .build()
        .map_err(|e| KafkaClientError::invalid_config(e.to_string()))?;

    settings
        .try_deserialize::<T>()
        .map_err(|e| KafkaClientError::invalid_config(e.to_string()))
}

/// Builder for ConnectionConfig
#[derive(Debug, Default)]
pub struct ConnectionConfigBuilder {
    config: ConnectionConfig,
}

impl ConnectionConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host<S: Into<String>>(mut self, host: S) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn send_retries(mut self, retries: usize) -> Self {
        self.config.send_retries = retries;
        self
    }

    pub fn protocol(mut self, protocol: ProtocolVersion) -> Self {
        self.config.protocol = protocol;
        self
    }

    pub fn build(self) -> ConnectionConfig {
        self.config
    }
}

/// Builder for ProducerConfig
#[derive(Debug, Default)]
pub struct ProducerConfigBuilder {
    config: ProducerConfig,
}

impl ProducerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.config.compression = compression;
        self
    }

    pub fn max_retries(mut self, retries: usize) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn build(self) -> ProducerConfig {
        self.config
    }
}

/// Builder for ConsumerConfig
#[derive(Debug, Default)]
pub struct ConsumerConfigBuilder {
    config: ConsumerConfig,
}

impl ConsumerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn group_id<S: Into<String>>(mut self, group_id: S) -> Self {
        self.config.group_id = Some(group_id.into());
        self
    }

    pub fn max_fetch_size(mut self, size: u32) -> Self {
        self.config.max_fetch_size = size;
        self
    }

    pub fn offset_reset(mut self, reset: OffsetReset) -> Self {
        self.config.offset_reset = reset;
        self
    }

    pub fn commit_interval(mut self, interval: Duration) -> Self {
        self.config.commit_interval = interval;
        self
    }

    pub fn build(self) -> ConsumerConfig {
        self.config
    }
}
