//! Partition-routing producer over every broker of the cluster

use std::sync::Arc;

use bytes::Bytes;
use indexmap::IndexMap;
use tracing::{debug, error, info, warn};

use crate::channel::ProducerChannel;
use crate::config::{ConnectionConfig, ProducerConfig, ProducerConfigBuilder};
use crate::compression::Compression;
use crate::error::KafkaClientError;
use crate::message::Message;
use crate::metadata::{BrokerMetadata, Metadata, TopicMetadata, VirtualPartition};
use crate::metrics::ClientMetrics;
use crate::partitioner::{DefaultPartitioner, PartitionKey, Partitioner};
use crate::Result;

/// Routes messages to virtual partitions and produces them through one
/// cached [`ProducerChannel`] per broker.
pub struct ProducerConnector {
    metadata: Arc<dyn Metadata>,
    topics: TopicMetadata,
    brokers: BrokerMetadata,
    partitioner: Box<dyn Partitioner>,
    config: ProducerConfig,
    connection: ConnectionConfig,
    producers: IndexMap<u32, ProducerChannel>,
    metrics: Arc<ClientMetrics>,
}

impl ProducerConnector {
    /// Connector with the default partitioner, loading the cluster layout.
    pub async fn new(metadata: Arc<dyn Metadata>, config: ProducerConfig) -> Result<Self> {
        ProducerConnectorBuilder::new(metadata).config(config).build().await
    }

    pub fn builder(metadata: Arc<dyn Metadata>) -> ProducerConnectorBuilder {
        ProducerConnectorBuilder::new(metadata)
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<ClientMetrics> {
        &self.metrics
    }

    /// Number of messages waiting for `produce()`
    pub fn queued_messages(&self) -> usize {
        self.producers.values().map(ProducerChannel::queued_messages).sum()
    }

    /// Pick a partition for `payload` and queue it on that partition's broker.
    ///
    /// An unknown topic triggers a metadata refresh only when the collaborator
    /// reports a change.
    pub async fn add_message<P: Into<Bytes>>(
        &mut self,
        topic: &str,
        payload: P,
        key: Option<PartitionKey>,
    ) -> Result<()> {
        if !self.topics.contains_key(topic) && self.metadata.needs_refreshing() {
            self.refresh_metadata().await?;
        }
        self.route(topic, payload.into(), key)
    }

    fn route(&mut self, topic: &str, payload: Bytes, key: Option<PartitionKey>) -> Result<()> {
        let partitions = self
            .topics
            .get(topic)
            .filter(|partitions| !partitions.is_empty())
            .ok_or_else(|| KafkaClientError::UnknownTopic {
                topic: topic.to_string(),
            })?;

        let num_partitions = partitions.len();
        let index = self.partitioner.partition(key.as_ref(), num_partitions)?;
        if index >= num_partitions {
            return Err(KafkaClientError::PartitionerContractViolation {
                num_partitions,
                returned: index,
            });
        }
        let target = partitions[index];

        let message = Message::new(topic, target.partition, payload, self.config.compression)?;
        self.producer_for(target.broker_id)?.add(message)
    }

    fn producer_for(&mut self, broker_id: u32) -> Result<&mut ProducerChannel> {
        if !self.producers.contains_key(&broker_id) {
            let broker = self
                .brokers
                .get(&broker_id)
                .ok_or(KafkaClientError::UnknownBroker { broker_id })?;
            let mut connection = self.connection.clone();
            connection.host = broker.host.clone();
            connection.port = broker.port;
            debug!("Producer for broker {} at {}", broker_id, connection.connection_string());
            self.producers
                .insert(broker_id, ProducerChannel::new(connection, self.metrics.clone()));
        }
        self.producers
            .get_mut(&broker_id)
            .ok_or(KafkaClientError::UnknownBroker { broker_id })
    }

    /// Put a message taken from `broker_id` back in a queue.
    ///
    /// It stays on its partition while that broker still owns it and is
    /// otherwise re-routed without its key.
    fn requeue(&mut self, broker_id: u32, message: Message) -> Result<()> {
        let target = VirtualPartition::new(broker_id, message.partition());
        let still_owned = self.brokers.contains_key(&broker_id)
            && self
                .topics
                .get(message.topic())
                .is_some_and(|partitions| partitions.contains(&target));
        if still_owned {
            return self.producer_for(broker_id)?.add(message);
        }
        let topic = message.topic().to_string();
        self.route(&topic, message.into_payload(), None)
    }

    fn requeue_all(&mut self, pending: Vec<(u32, Message)>) {
        for (broker_id, message) in pending {
            let topic = message.topic().to_string();
            if let Err(e) = self.requeue(broker_id, message) {
                error!("Dropping message for topic {}: {}", topic, e);
            }
        }
    }

    /// Flush every broker's queue.
    ///
    /// Messages of a broker that failed with a transport or broker error are
    /// re-routed against refreshed metadata. This repeats up to `max_retries`
    /// times. Other errors are returned immediately and leave every unsent
    /// message queued.
    pub async fn produce(&mut self) -> Result<()> {
        let mut retries = 0;
        loop {
            let (failed, last_error) = self.produce_all().await?;
            let Some(last_error) = last_error else {
                return Ok(());
            };
            if retries >= self.config.max_retries {
                error!(
                    "Dropping {} messages after {} retries: {}",
                    failed.len(),
                    retries,
                    last_error
                );
                return Err(last_error);
            }
            retries += 1;
            warn!(
                "Produce failed ({}), re-routing {} messages, retry {}/{}",
                last_error,
                failed.len(),
                retries,
                self.config.max_retries
            );

            if let Err(e) = self.refresh_metadata().await {
                self.requeue_all(failed);
                return Err(e);
            }
            self.requeue_all(failed);
        }
    }

    /// Queues of brokers failing with a retryable error are taken only once
    /// every broker was tried, so an early return keeps them queued.
    async fn produce_all(&mut self) -> Result<(Vec<(u32, Message)>, Option<KafkaClientError>)> {
        let mut failed_brokers = Vec::new();
        let mut last_error = None;
        for (&broker_id, producer) in self.producers.iter_mut() {
            match producer.produce().await {
                Ok(()) => {}
                Err(e) if e.is_retryable() => {
                    warn!("Produce to broker {} failed: {}", broker_id, e);
                    failed_brokers.push(broker_id);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        let mut failed = Vec::new();
        for broker_id in failed_brokers {
            if let Some(producer) = self.producers.get_mut(&broker_id) {
                failed.extend(producer.take_queue().into_iter().map(|m| (broker_id, m)));
            }
        }
        Ok((failed, last_error))
    }

    /// Reload the cluster layout and reconnect lazily.
    ///
    /// Queued messages move to the new layout: a message keeps its partition
    /// while the same broker still owns it and is re-routed otherwise.
    pub async fn refresh_metadata(&mut self) -> Result<()> {
        let topics = self.metadata.topic_metadata().await?;
        let brokers = self.metadata.broker_metadata().await?;

        let mut pending = Vec::new();
        for (&broker_id, producer) in self.producers.iter_mut() {
            pending.extend(producer.take_queue().into_iter().map(|m| (broker_id, m)));
        }
        self.close();
        self.topics = topics;
        self.brokers = brokers;
        info!(
            "Producer metadata refreshed: {} topics, {} brokers, {} messages queued",
            self.topics.len(),
            self.brokers.len(),
            pending.len()
        );
        self.requeue_all(pending);
        Ok(())
    }

    /// Known topics as `"name [partition count]"`
    pub fn available_topics(&self) -> Vec<String> {
        self.topics
            .iter()
            .map(|(topic, partitions)| format!("{} [{}]", topic, partitions.len()))
            .collect()
    }

    /// Close every broker connection.
    pub fn close(&mut self) {
        for (_, mut producer) in self.producers.drain(..) {
            producer.close();
        }
    }
}

impl std::fmt::Debug for ProducerConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerConnector")
            .field("topics", &self.topics)
            .field("brokers", &self.brokers)
            .field("config", &self.config)
            .field("producers", &self.producers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Builder for ProducerConnector
pub struct ProducerConnectorBuilder {
    metadata: Arc<dyn Metadata>,
    config: ProducerConfigBuilder,
    connection: ConnectionConfig,
    partitioner: Box<dyn Partitioner>,
    metrics: Option<Arc<ClientMetrics>>,
}

impl ProducerConnectorBuilder {
    pub fn new(metadata: Arc<dyn Metadata>) -> Self {
        Self {
            metadata,
            config: ProducerConfigBuilder::new(),
            connection: ConnectionConfig::default(),
            partitioner: Box::new(DefaultPartitioner),
            metrics: None,
        }
    }

    pub fn config(mut self, config: ProducerConfig) -> Self {
        self.config = ProducerConfigBuilder::new()
            .compression(config.compression)
            .max_retries(config.max_retries);
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.config = self.config.compression(compression);
        self
    }

    pub fn max_retries(mut self, retries: usize) -> Self {
        self.config = self.config.max_retries(retries);
        self
    }

    /// Timeout, retries and protocol for broker connections; host and port
    /// come from the metadata.
    pub fn connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    pub fn partitioner<P: Partitioner + 'static>(mut self, partitioner: P) -> Self {
        self.partitioner = Box::new(partitioner);
        self
    }

    pub fn metrics(mut self, metrics: Arc<ClientMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn build(self) -> Result<ProducerConnector> {
        let mut connector = ProducerConnector {
            metadata: self.metadata,
            topics: TopicMetadata::new(),
            brokers: BrokerMetadata::new(),
            partitioner: self.partitioner,
            config: self.config.build(),
            connection: self.connection,
            producers: IndexMap::new(),
            metrics: self.metrics.unwrap_or_default(),
        };
        connector.refresh_metadata().await?;
        Ok(connector)
    }
}
