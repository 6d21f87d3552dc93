//! Consumer connector: one message stream per virtual partition of the
//! selected topics

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::channel::ConsumerChannel;
use crate::config::{ConnectionConfig, ConsumerConfig, ConsumerConfigBuilder, OffsetReset};
use crate::error::KafkaClientError;
use crate::metadata::{Metadata, VirtualPartition};
use crate::metrics::ClientMetrics;
use crate::offset::Offset;
use crate::protocol::OffsetTime;
use crate::stream::{broker_offset, MessageStream};
use crate::topic_filter::TopicFilter;
use crate::Result;

/// Creates [`MessageStream`]s for topics selected by a [`TopicFilter`].
///
/// With a group id configured the connector registers itself as a consumer
/// process, resumes each partition from the group's committed offset and
/// hands a committer to every stream.
pub struct ConsumerConnector {
    metadata: Arc<dyn Metadata>,
    config: ConsumerConfig,
    connection: ConnectionConfig,
    process_id: String,
    metrics: Arc<ClientMetrics>,
}

impl ConsumerConnector {
    pub async fn new(metadata: Arc<dyn Metadata>, config: ConsumerConfig) -> Result<Self> {
        ConsumerConnectorBuilder::new(metadata).config(config).build().await
    }

    pub fn builder(metadata: Arc<dyn Metadata>) -> ConsumerConnectorBuilder {
        ConsumerConnectorBuilder::new(metadata)
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Identifier registered with the metadata collaborator
    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    pub fn metrics(&self) -> &Arc<ClientMetrics> {
        &self.metrics
    }

    /// Streams over every partition of exactly `topic`, with the configured
    /// fetch size and offset reset.
    pub async fn create_message_streams(&self, topic: &str) -> Result<ConsumerContext> {
        let filter = TopicFilter::topic(topic)?;
        self.create_message_streams_by_filter(
            &filter,
            self.config.max_fetch_size,
            self.config.offset_reset,
        )
        .await
    }

    /// One stream per virtual partition of every known topic passing `filter`.
    ///
    /// A partition starts at the group's committed offset when that offset is
    /// still within what the broker holds, otherwise at `offset_reset`.
    pub async fn create_message_streams_by_filter(
        &self,
        filter: &TopicFilter,
        max_fetch_size: u32,
        offset_reset: OffsetReset,
    ) -> Result<ConsumerContext> {
        if max_fetch_size == 0 {
            return Err(KafkaClientError::invalid_config(
                "Maximum fetch size must be a positive integer.",
            ));
        }
        let topic_metadata = self.metadata.topic_metadata().await?;
        let brokers = self.metadata.broker_metadata().await?;
        let topics = filter.topics(topic_metadata.keys().map(String::as_str));

        let mut streams = Vec::new();
        for topic in topics {
            let committed = match self.config.group_id.as_deref() {
                Some(group_id) => self.metadata.topic_offsets(group_id, &topic).await?,
                None => HashMap::new(),
            };
            let partitions = topic_metadata.get(&topic).map(Vec::as_slice).unwrap_or(&[]);
            for &partition in partitions {
                let broker = brokers.get(&partition.broker_id).ok_or(
                    KafkaClientError::UnknownBroker {
                        broker_id: partition.broker_id,
                    },
                )?;
                let mut connection = self.connection.clone();
                connection.host = broker.host.clone();
                connection.port = broker.port;
                let mut consumer = ConsumerChannel::new(connection, self.metrics.clone());

                let offset = self
                    .initial_offset(
                        &mut consumer,
                        &topic,
                        partition,
                        committed.get(&partition).copied(),
                        offset_reset,
                    )
                    .await?;
                debug!("Stream {}/{} starts at {}", topic, partition, offset);

                let mut stream =
                    MessageStream::new(consumer, topic.clone(), partition, max_fetch_size, offset);
                if let Some(group_id) = self.config.group_id.as_deref() {
                    stream = stream.with_commits(
                        self.metadata.clone(),
                        group_id,
                        self.config.commit_interval,
                    );
                }
                streams.push(stream);
            }
        }
        info!("Created {} message streams", streams.len());
        Ok(ConsumerContext::new(streams))
    }

    async fn initial_offset(
        &self,
        consumer: &mut ConsumerChannel,
        topic: &str,
        partition: VirtualPartition,
        committed: Option<Offset>,
        offset_reset: OffsetReset,
    ) -> Result<Offset> {
        if let Some(offset) = committed {
            let earliest =
                broker_offset(consumer, topic, partition.partition, OffsetTime::Earliest).await?;
            let latest =
                broker_offset(consumer, topic, partition.partition, OffsetTime::Latest).await?;
            if earliest <= offset && offset <= latest {
                return Ok(offset);
            }
            warn!(
                "Committed offset {} of {}/{} outside [{}, {}], resetting to {:?}",
                offset, topic, partition, earliest, latest, offset_reset
            );
        }
        broker_offset(consumer, topic, partition.partition, offset_reset.offset_time()).await
    }
}

impl std::fmt::Debug for ConsumerConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerConnector")
            .field("config", &self.config)
            .field("connection", &self.connection)
            .field("process_id", &self.process_id)
            .finish()
    }
}

/// Builder for ConsumerConnector
pub struct ConsumerConnectorBuilder {
    metadata: Arc<dyn Metadata>,
    config: ConsumerConfigBuilder,
    connection: ConnectionConfig,
    metrics: Option<Arc<ClientMetrics>>,
}

impl ConsumerConnectorBuilder {
    pub fn new(metadata: Arc<dyn Metadata>) -> Self {
        Self {
            metadata,
            config: ConsumerConfigBuilder::new(),
            connection: ConnectionConfig::default(),
            metrics: None,
        }
    }

    pub fn config(mut self, config: ConsumerConfig) -> Self {
        let mut builder = ConsumerConfigBuilder::new()
            .max_fetch_size(config.max_fetch_size)
            .offset_reset(config.offset_reset)
            .commit_interval(config.commit_interval);
        if let Some(group_id) = config.group_id {
            builder = builder.group_id(group_id);
        }
        self.config = builder;
        self
    }

    pub fn group_id<S: Into<String>>(mut self, group_id: S) -> Self {
        self.config = self.config.group_id(group_id);
        self
    }

    pub fn max_fetch_size(mut self, size: u32) -> Self {
        self.config = self.config.max_fetch_size(size);
        self
    }

    pub fn offset_reset(mut self, reset: OffsetReset) -> Self {
        self.config = self.config.offset_reset(reset);
        self
    }

    /// Timeout, retries and protocol for broker connections; host and port
    /// come from the metadata.
    pub fn connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    pub fn metrics(mut self, metrics: Arc<ClientMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn build(self) -> Result<ConsumerConnector> {
        let config = self.config.build();
        config.validate()?;

        let process_id = format!(
            "{}-{:08x}",
            std::process::id(),
            rand::thread_rng().gen::<u32>()
        );
        if let Some(group_id) = config.group_id.as_deref() {
            self.metadata
                .register_consumer_process(group_id, &process_id)
                .await?;
            info!("Registered consumer process {} in group {}", process_id, group_id);
        }

        Ok(ConsumerConnector {
            metadata: self.metadata,
            config,
            connection: self.connection,
            process_id,
            metrics: self.metrics.unwrap_or_default(),
        })
    }
}

/// The streams created for one filter, closed together.
///
/// Dropping a context closes the sockets but cannot commit; call
/// [`ConsumerContext::close`] to store the final watermarks.
#[derive(Debug, Default)]
pub struct ConsumerContext {
    streams: Vec<MessageStream>,
}

impl ConsumerContext {
    pub fn new(streams: Vec<MessageStream>) -> Self {
        Self { streams }
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn streams(&self) -> &[MessageStream] {
        &self.streams
    }

    pub fn streams_mut(&mut self) -> &mut [MessageStream] {
        &mut self.streams
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MessageStream> {
        self.streams.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, MessageStream> {
        self.streams.iter_mut()
    }

    /// Close every stream. A stream that fails to close is logged and the
    /// rest are still closed.
    pub async fn close(&mut self) {
        for mut stream in self.streams.drain(..) {
            if let Err(e) = stream.close().await {
                error!(
                    "Failed to close stream {}/{}: {}",
                    stream.topic(),
                    stream.virtual_partition(),
                    e
                );
            }
        }
    }
}

impl Drop for ConsumerContext {
    fn drop(&mut self) {
        if !self.streams.is_empty() {
            warn!(
                "Consumer context dropped with {} open streams, watermarks not committed",
                self.streams.len()
            );
        }
    }
}

impl<'a> IntoIterator for &'a mut ConsumerContext {
    type Item = &'a mut MessageStream;
    type IntoIter = std::slice::IterMut<'a, MessageStream>;

    fn into_iter(self) -> Self::IntoIter {
        self.streams.iter_mut()
    }
}

impl<'a> IntoIterator for &'a ConsumerContext {
    type Item = &'a MessageStream;
    type IntoIter = std::slice::Iter<'a, MessageStream>;

    fn into_iter(self) -> Self::IntoIter {
        self.streams.iter()
    }
}
