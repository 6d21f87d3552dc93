//! Per-partition consumption cursor

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::channel::ConsumerChannel;
use crate::error::KafkaClientError;
use crate::message::Message;
use crate::metadata::{Metadata, VirtualPartition};
use crate::offset::Offset;
use crate::protocol::OffsetTime;
use crate::Result;

/// Where a stream is in its fetch cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Next call issues a Fetch at the current offset
    NeedsFetch,
    /// A fetch response is being consumed
    Draining,
    Closed,
}

struct OffsetCommitter {
    metadata: Arc<dyn Metadata>,
    group_id: String,
    interval: Duration,
    last_commit: Instant,
    uncommitted: bool,
}

/// Pull-based message sequence over one virtual partition.
///
/// Each call to [`MessageStream::next_message`] either returns the next
/// message or `None` once the broker has nothing more right now; callers back
/// off and call again. The watermark only moves after a message has been
/// returned, so a consumer that crashes mid-processing re-reads that message
/// from the last committed watermark (at-least-once delivery).
pub struct MessageStream {
    consumer: ConsumerChannel,
    topic: String,
    partition: VirtualPartition,
    max_fetch_size: u32,
    offset: Offset,
    state: StreamState,
    committer: Option<OffsetCommitter>,
}

impl MessageStream {
    pub fn new<T: Into<String>>(
        consumer: ConsumerChannel,
        topic: T,
        partition: VirtualPartition,
        max_fetch_size: u32,
        offset: Offset,
    ) -> Self {
        Self {
            consumer,
            topic: topic.into(),
            partition,
            max_fetch_size,
            offset,
            state: StreamState::NeedsFetch,
            committer: None,
        }
    }

    /// Open a stream at the offset the broker reports for `time`.
    pub async fn open_at<T: Into<String>>(
        mut consumer: ConsumerChannel,
        topic: T,
        partition: VirtualPartition,
        max_fetch_size: u32,
        time: OffsetTime,
    ) -> Result<Self> {
        let topic = topic.into();
        let offset = broker_offset(&mut consumer, &topic, partition.partition, time).await?;
        Ok(Self::new(consumer, topic, partition, max_fetch_size, offset))
    }

    /// Commit the watermark for `group_id` every `interval` and on close.
    pub fn with_commits<G: Into<String>>(
        mut self,
        metadata: Arc<dyn Metadata>,
        group_id: G,
        interval: Duration,
    ) -> Self {
        self.committer = Some(OffsetCommitter {
            metadata,
            group_id: group_id.into(),
            interval,
            last_commit: Instant::now(),
            uncommitted: false,
        });
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> u32 {
        self.partition.partition
    }

    pub fn broker_id(&self) -> u32 {
        self.partition.broker_id
    }

    pub fn virtual_partition(&self) -> VirtualPartition {
        self.partition
    }

    pub fn max_fetch_size(&self) -> u32 {
        self.max_fetch_size
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Offset right after the last returned message
    pub fn watermark(&self) -> Offset {
        self.offset
    }

    pub fn group_id(&self) -> Option<&str> {
        self.committer.as_ref().map(|c| c.group_id.as_str())
    }

    pub async fn next_message(&mut self) -> Result<Option<Message>> {
        if self.state == StreamState::Closed {
            return Err(KafkaClientError::illegal_state("Message stream is closed."));
        }
        if self.commit_due() {
            self.commit().await?;
        }

        if self.state == StreamState::NeedsFetch {
            let has_data = self
                .consumer
                .fetch(&self.topic, self.partition.partition, self.offset, self.max_fetch_size)
                .await?;
            if !has_data {
                return Ok(None);
            }
            self.state = StreamState::Draining;
        }

        match self.consumer.next_message().await {
            Ok(Some(message)) => {
                self.offset = self.consumer.watermark();
                if let Some(committer) = self.committer.as_mut() {
                    committer.uncommitted = true;
                }
                Ok(Some(message))
            }
            Ok(None) => {
                self.state = StreamState::NeedsFetch;
                Ok(None)
            }
            Err(e) => {
                // corrupt frames are skipped, the watermark moves past them
                self.offset = self.consumer.watermark();
                if !self.consumer.channel().state().is_awaiting_response() {
                    self.state = StreamState::NeedsFetch;
                }
                Err(e)
            }
        }
    }

    fn commit_due(&self) -> bool {
        self.committer
            .as_ref()
            .is_some_and(|c| c.last_commit.elapsed() >= c.interval)
    }

    /// Store the watermark with the metadata collaborator if it moved since
    /// the last commit.
    pub async fn commit(&mut self) -> Result<()> {
        let Some(committer) = self.committer.as_mut() else {
            return Ok(());
        };
        if committer.uncommitted {
            committer
                .metadata
                .commit_offset(&committer.group_id, &self.topic, self.partition, self.offset)
                .await?;
            committer.uncommitted = false;
            debug!(
                "Committed {} for {} {}/{}",
                self.offset, committer.group_id, self.topic, self.partition
            );
        }
        committer.last_commit = Instant::now();
        Ok(())
    }

    /// Commit the watermark and release the connection. Closing twice is a
    /// no-op.
    pub async fn close(&mut self) -> Result<()> {
        if self.state == StreamState::Closed {
            return Ok(());
        }
        let committed = self.commit().await;
        self.consumer.close();
        self.state = StreamState::Closed;
        info!(
            "Closed stream {}/{} at {}",
            self.topic, self.partition, self.offset
        );
        committed
    }
}

impl std::fmt::Debug for MessageStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStream")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .field("offset", &self.offset)
            .field("state", &self.state)
            .field("group_id", &self.group_id())
            .finish()
    }
}

/// Latest offset the broker has for `time`, or zero for an empty log.
pub(crate) async fn broker_offset(
    consumer: &mut ConsumerChannel,
    topic: &str,
    partition: u32,
    time: OffsetTime,
) -> Result<Offset> {
    let offsets = consumer.offsets(topic, partition, time, 1).await?;
    Ok(offsets.first().copied().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::metadata::StaticMetadata;
    use crate::metrics::ClientMetrics;

    fn stream() -> MessageStream {
        let consumer = ConsumerChannel::new(
            ConnectionConfig::new("127.0.0.1", 1),
            Arc::new(ClientMetrics::default()),
        );
        MessageStream::new(
            consumer,
            "topic1",
            VirtualPartition::new(3, 1),
            1024,
            Offset::new(42),
        )
    }

    #[test]
    fn test_accessors() {
        let stream = stream();
        assert_eq!(stream.topic(), "topic1");
        assert_eq!(stream.broker_id(), 3);
        assert_eq!(stream.partition(), 1);
        assert_eq!(stream.watermark(), Offset::new(42));
        assert_eq!(stream.state(), StreamState::NeedsFetch);
        assert_eq!(stream.group_id(), None);
    }

    #[tokio::test]
    async fn test_closed_stream_rejects_reads() {
        let mut stream = stream();
        stream.close().await.unwrap();
        stream.close().await.unwrap();
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(matches!(
            stream.next_message().await,
            Err(KafkaClientError::IllegalState { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_without_progress_commits_nothing() {
        let metadata = Arc::new(StaticMetadata::new());
        let mut stream = stream().with_commits(metadata.clone(), "group", Duration::from_secs(10));
        assert_eq!(stream.group_id(), Some("group"));
        stream.close().await.unwrap();
        assert_eq!(
            metadata.committed_offset("group", "topic1", VirtualPartition::new(3, 1)),
            None
        );
    }
}
