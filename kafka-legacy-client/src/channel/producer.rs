//! Produce requests over a [`Channel`]

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use indexmap::IndexMap;
use tracing::debug;

use super::Channel;
use crate::compression::Compression;
use crate::config::ConnectionConfig;
use crate::error::KafkaClientError;
use crate::message::{pack_batch, pack_frame, Message};
use crate::metrics::ClientMetrics;
use crate::protocol::ProduceSet;
use crate::Result;

type PartitionQueue = IndexMap<u32, Vec<Message>>;

/// Producer side of a broker channel.
///
/// Messages are queued per topic, then per partition, in insertion order.
#[derive(Debug)]
pub struct ProducerChannel {
    channel: Channel,
    queue: IndexMap<String, PartitionQueue>,
}

impl ProducerChannel {
    pub fn new(config: ConnectionConfig, metrics: Arc<ClientMetrics>) -> Self {
        Self::from_channel(Channel::new(config, metrics))
    }

    pub fn from_channel(channel: Channel) -> Self {
        Self {
            channel,
            queue: IndexMap::new(),
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Queue a message for the next `produce()`.
    pub fn add(&mut self, message: Message) -> Result<()> {
        if message.compression() == Compression::Snappy {
            return Err(KafkaClientError::UnsupportedCompression {
                codec: Compression::Snappy.into(),
            });
        }
        self.queue
            .entry(message.topic().to_string())
            .or_default()
            .entry(message.partition())
            .or_default()
            .push(message);
        Ok(())
    }

    pub fn queued_messages(&self) -> usize {
        self.queue
            .values()
            .flat_map(|partitions| partitions.values())
            .map(Vec::len)
            .sum()
    }

    /// Remove and return every message that has not been sent yet.
    pub fn take_queue(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.queue)
            .into_values()
            .flat_map(|partitions| partitions.into_values())
            .flatten()
            .collect()
    }

    /// Send every queued message.
    ///
    /// In 0.7 each topic-partition goes out as its own request and is
    /// dropped from the queue as soon as the socket accepts it; there is no
    /// acknowledgement. In 0.8 the whole queue is one request and the broker
    /// response is validated before the queue is cleared.
    pub async fn produce(&mut self) -> Result<()> {
        if self.queue.is_empty() {
            return Ok(());
        }
        let codec = self.channel.codec();
        if codec.acknowledges_produce() {
            let sets = self.produce_sets()?;
            let count = self.queued_messages() as u64;
            for payload in codec.encode_produce(&sets)? {
                self.channel.send(&payload, true).await?;
                if !self.channel.has_incoming_data().await? {
                    return Err(KafkaClientError::corrupt_response(
                        "Produce request was not acknowledged by the broker",
                    ));
                }
                let body = self.channel.read(self.channel.remaining_bytes()).await?;
                self.channel.has_incoming_data().await?;
                codec.check_produce_response(body)?;
            }
            self.queue.clear();
            self.channel.metrics().record_produced(count);
            return Ok(());
        }

        while let Some((topic, partitions)) = self.queue.first_mut() {
            let Some((&partition, messages)) = partitions.first() else {
                self.queue.shift_remove_index(0);
                continue;
            };
            let set = ProduceSet {
                topic: topic.clone(),
                partition,
                message_set: encode_message_set(messages)?,
            };
            let count = messages.len() as u64;
            for payload in codec.encode_produce(std::slice::from_ref(&set))? {
                self.channel.send(&payload, false).await?;
            }
            debug!(
                "Produced {} messages to {}-{}",
                count, set.topic, set.partition
            );
            self.channel.metrics().record_produced(count);
            if let Some((_, partitions)) = self.queue.first_mut() {
                partitions.shift_remove_index(0);
            }
        }
        Ok(())
    }

    fn produce_sets(&self) -> Result<Vec<ProduceSet>> {
        let mut sets = Vec::new();
        for (topic, partitions) in &self.queue {
            for (&partition, messages) in partitions {
                sets.push(ProduceSet {
                    topic: topic.clone(),
                    partition,
                    message_set: encode_message_set(messages)?,
                });
            }
        }
        Ok(sets)
    }

    pub fn close(&mut self) {
        self.channel.close();
    }
}

/// Encode messages of one topic-partition into a message set.
///
/// Uncompressed messages are framed one by one. A contiguous run of messages
/// sharing a compression codec is framed uncompressed, then wrapped into a
/// single compressed frame.
pub fn encode_message_set(messages: &[Message]) -> Result<Bytes> {
    let mut data = BytesMut::new();
    let mut batch = BytesMut::new();
    let mut batch_compression = Compression::None;

    for message in messages {
        if message.compression() != batch_compression {
            if batch_compression.is_compressed() && !batch.is_empty() {
                pack_batch(&mut data, &batch, batch_compression)?;
                batch.clear();
            }
            batch_compression = message.compression();
        }
        if batch_compression.is_compressed() {
            pack_frame(&mut batch, message.payload(), Compression::None);
        } else {
            pack_frame(&mut data, message.payload(), Compression::None);
        }
    }
    if batch_compression.is_compressed() && !batch.is_empty() {
        pack_batch(&mut data, &batch, batch_compression)?;
    }
    Ok(data.freeze())
}
