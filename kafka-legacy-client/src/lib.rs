//! # Kafka Legacy Client
//!
//! Async Rust client for the pre-0.8 Kafka wire protocol, with the
//! transitional 0.8 produce request.
//!
//! ## Features
//!
//! - **Framed channels**: one TCP connection per broker, one request in flight
//! - **Message codec**: magic 0/1 frames, CRC32 validation, gzip double-wrap
//!   and compressed batches
//! - **Offsets**: 64-bit log positions with the LATEST/EARLIEST sentinels
//! - **Connectors**: partition routing over cluster metadata, re-routing of
//!   failed produce requests, per-partition consumer streams with group
//!   offset commits
//!
//! Delivery is at-least-once: a stream's watermark is committed after
//! messages were returned, so a consumer that stops mid-processing sees the
//! uncommitted messages again.
//!
//! ## Quick Start
//!
//! ### Producer Example
//!
//! ```rust,no_run
//! use kafka_legacy_client::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = KafkaClient::connect("localhost", 9092);
//!     let mut producer = client.create_producer();
//!     producer.add(Message::new("my-topic", 0, "Hello Kafka!", Compression::None)?)?;
//!     producer.produce().await?;
//!     Ok(())
//! }
//! ```
//!
//! ### Consumer Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use kafka_legacy_client::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let metadata = Arc::new(
//!         StaticMetadata::new()
//!             .with_broker(0, "localhost", 9092)
//!             .with_topic("my-topic", 0, 1),
//!     );
//!     let connector = ConsumerConnector::builder(metadata)
//!         .group_id("my-group")
//!         .build()
//!         .await?;
//!
//!     let mut context = connector.create_message_streams("my-topic").await?;
//!     for stream in &mut context {
//!         while let Some(message) = stream.next_message().await? {
//!             println!("{}: {}", message.offset(), String::from_utf8_lossy(message.payload()));
//!         }
//!     }
//!     context.close().await;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod client;
pub mod compression;
pub mod config;
pub mod consumer;
pub mod error;
pub mod message;
pub mod metadata;
pub mod metrics;
pub mod offset;
pub mod partitioner;
pub mod producer;
pub mod protocol;
pub mod stream;
pub mod topic_filter;

pub use channel::{Channel, ChannelState, ConsumerChannel, ProducerChannel};
pub use client::KafkaClient;
pub use compression::Compression;
pub use config::*;
pub use consumer::{ConsumerConnector, ConsumerConnectorBuilder, ConsumerContext};
pub use error::*;
pub use message::Message;
pub use metadata::{
    BrokerInfo, BrokerMetadata, CachedMetadata, ClusterLayout, Metadata, StaticMetadata,
    TopicMetadata, VirtualPartition,
};
pub use metrics::{ClientMetrics, MetricsSnapshot};
pub use offset::Offset;
pub use partitioner::{DefaultPartitioner, PartitionKey, Partitioner};
pub use producer::{ProducerConnector, ProducerConnectorBuilder};
pub use protocol::{OffsetTime, ProtocolVersion};
pub use stream::{MessageStream, StreamState};
pub use topic_filter::TopicFilter;

/// Client library result type
pub type Result<T> = std::result::Result<T, KafkaClientError>;

/// Client library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
