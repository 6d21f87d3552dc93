//! Fetch and Offsets requests over a [`Channel`]

use std::sync::Arc;

use tracing::debug;

use super::Channel;
use crate::config::ConnectionConfig;
use crate::error::KafkaClientError;
use crate::message::{self, Decoded, InnerBatch, Message, FRAME_SIZE_LEN};
use crate::metrics::ClientMetrics;
use crate::offset::Offset;
use crate::protocol::{self, FetchRequest, OffsetTime, OffsetsRequest};
use crate::Result;

/// Consumer side of a broker channel.
///
/// Tracks the watermark of the partition being fetched: the offset right
/// after the last message handed out. Messages of a compressed batch all
/// carry the batch's start offset, and the watermark only moves past the
/// batch once its last message has been returned.
#[derive(Debug)]
pub struct ConsumerChannel {
    channel: Channel,
    topic: String,
    partition: u32,
    offset: Offset,
    pending: Option<PendingBatch>,
}

#[derive(Debug)]
struct PendingBatch {
    batch: InnerBatch,
    frame_size: u64,
}

impl ConsumerChannel {
    pub fn new(config: ConnectionConfig, metrics: Arc<ClientMetrics>) -> Self {
        Self::from_channel(Channel::new(config, metrics))
    }

    pub fn from_channel(channel: Channel) -> Self {
        Self {
            channel,
            topic: String::new(),
            partition: 0,
            offset: Offset::default(),
            pending: None,
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Send a Fetch request and report whether the response carries data.
    pub async fn fetch(
        &mut self,
        topic: &str,
        partition: u32,
        offset: Offset,
        max_fetch_size: u32,
    ) -> Result<bool> {
        if topic.is_empty() {
            return Err(KafkaClientError::invalid_config(
                "Topic must be a non-empty string.",
            ));
        }
        if max_fetch_size == 0 {
            return Err(KafkaClientError::invalid_config(
                "Maximum fetch size must be a positive integer.",
            ));
        }
        self.discard_pending().await?;

        self.topic = topic.to_string();
        self.partition = partition;
        self.offset = offset;

        let payload = self.channel.codec().encode_fetch(&FetchRequest {
            topic: self.topic.clone(),
            partition,
            offset,
            max_size: max_fetch_size,
        })?;
        self.channel.send(&payload, true).await?;
        debug!("Fetch {}-{} at {}", topic, partition, offset);
        self.channel.has_incoming_data().await
    }

    /// Next message of the current fetch response.
    ///
    /// `Ok(None)` means the response is exhausted, including when it ends in
    /// a partial frame; the caller should fetch again from the watermark.
    pub async fn next_message(&mut self) -> Result<Option<Message>> {
        loop {
            if let Some(message) = self.next_pending()? {
                return Ok(Some(message));
            }

            match self.channel.has_incoming_data().await {
                Ok(true) => {}
                Ok(false) => return Ok(None),
                Err(e) if e.is_end_of_stream() => return Ok(None),
                Err(e) => return Err(e),
            }

            let body = match self.read_frame().await {
                Ok(body) => body,
                Err(e) if e.is_end_of_stream() => return Ok(None),
                Err(e) => return Err(e),
            };
            let frame_size = self.channel.read_bytes() as u64;

            match message::decode_body(&self.topic, self.partition, self.offset, body) {
                Ok(Decoded::Message(message)) => {
                    self.offset.add_int(frame_size);
                    self.channel.metrics().record_consumed(1);
                    return Ok(Some(message));
                }
                Ok(Decoded::Batch(batch)) => {
                    self.pending = Some(PendingBatch { batch, frame_size });
                }
                Err(e) => {
                    // skip the broken frame, the rest of the response is intact
                    self.offset.add_int(frame_size);
                    return Err(e);
                }
            }
        }
    }

    fn next_pending(&mut self) -> Result<Option<Message>> {
        let Some(pending) = self.pending.as_mut() else {
            return Ok(None);
        };
        let result = pending.batch.next_message(&self.topic, self.partition);
        let frame_size = pending.frame_size;
        match result {
            Ok(Some(message)) => {
                if pending.batch.is_exhausted() {
                    self.pending = None;
                    self.offset.add_int(frame_size);
                }
                self.channel.metrics().record_consumed(1);
                Ok(Some(message))
            }
            Ok(None) => {
                self.pending = None;
                self.offset.add_int(frame_size);
                Ok(None)
            }
            Err(e) => {
                self.pending = None;
                self.offset.add_int(frame_size);
                Err(e)
            }
        }
    }

    async fn read_frame(&mut self) -> Result<bytes::Bytes> {
        let size = self.channel.read(FRAME_SIZE_LEN).await?;
        let bounds = u32::from_be_bytes([size[0], size[1], size[2], size[3]]) as usize;
        self.channel.read(bounds).await
    }

    /// Offset right after the last returned message
    pub fn watermark(&self) -> Offset {
        self.offset
    }

    /// Ask the broker for up to `max_num_offsets` offsets before `time`.
    ///
    /// Offsets come back newest first. An empty response yields an empty list.
    pub async fn offsets(
        &mut self,
        topic: &str,
        partition: u32,
        time: OffsetTime,
        max_num_offsets: u32,
    ) -> Result<Vec<Offset>> {
        self.discard_pending().await?;
        let payload = self.channel.codec().encode_offsets(&OffsetsRequest {
            topic: topic.to_string(),
            partition,
            time,
            max_num_offsets,
        })?;
        self.channel.send(&payload, true).await?;

        if !self.channel.has_incoming_data().await? {
            return Ok(Vec::new());
        }
        let body = self.channel.read(self.channel.remaining_bytes()).await?;
        self.channel.has_incoming_data().await?;
        protocol::decode_offsets(body)
    }

    async fn discard_pending(&mut self) -> Result<()> {
        self.pending = None;
        if self.channel.state().is_awaiting_response() {
            debug!("Discarding unread response of {}-{}", self.topic, self.partition);
            self.channel.flush_response().await?;
        }
        Ok(())
    }

    pub fn close(&mut self) {
        self.pending = None;
        self.channel.close();
    }
}
