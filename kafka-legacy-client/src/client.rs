//! Single-broker entry point

use std::sync::Arc;

use crate::channel::{ConsumerChannel, ProducerChannel};
use crate::config::ConnectionConfig;
use crate::metrics::ClientMetrics;
use crate::protocol::ProtocolVersion;
use crate::Result;

/// Connection parameters of one broker and the channels created from them.
///
/// No socket is opened here; each channel connects on its first request.
/// Channels created by one client share its metrics.
#[derive(Debug, Clone)]
pub struct KafkaClient {
    config: ConnectionConfig,
    metrics: Arc<ClientMetrics>,
}

impl KafkaClient {
    /// Client for `host:port` speaking 0.7 with default timeouts.
    pub fn connect<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            config: ConnectionConfig::new(host, port),
            metrics: Arc::new(ClientMetrics::default()),
        }
    }

    pub fn new(config: ConnectionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            metrics: Arc::new(ClientMetrics::default()),
        })
    }

    /// Client configured from `KAFKA_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::new(ConnectionConfig::from_env()?)
    }

    pub fn with_protocol(mut self, protocol: ProtocolVersion) -> Self {
        self.config.protocol = protocol;
        self
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<ClientMetrics> {
        &self.metrics
    }

    /// `tcp://host:port`
    pub fn connection_string(&self) -> String {
        self.config.connection_string()
    }

    pub fn create_producer(&self) -> ProducerChannel {
        ProducerChannel::new(self.config.clone(), self.metrics.clone())
    }

    pub fn create_consumer(&self) -> ConsumerChannel {
        ConsumerChannel::new(self.config.clone(), self.metrics.clone())
    }
}
