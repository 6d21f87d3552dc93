//! Cluster metadata contract and in-process implementations
//!
//! Connectors never discover brokers or topics themselves. They ask a
//! [`Metadata`] implementation for the topic to virtual-partition map and
//! broker addresses, and hand consumer group offsets back to it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::KafkaClientError;
use crate::offset::Offset;
use crate::Result;

/// How long [`CachedMetadata`] trusts a snapshot
pub const DEFAULT_METADATA_TTL: Duration = Duration::from_secs(60);

/// A physical partition addressable by the client: one partition on one broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VirtualPartition {
    pub broker_id: u32,
    pub partition: u32,
}

impl VirtualPartition {
    pub fn new(broker_id: u32, partition: u32) -> Self {
        Self {
            broker_id,
            partition,
        }
    }
}

/// `{brokerId}-{partition}`, the key under which group offsets are stored
impl fmt::Display for VirtualPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.broker_id, self.partition)
    }
}

impl FromStr for VirtualPartition {
    type Err = KafkaClientError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || KafkaClientError::metadata(format!("Invalid partition id `{}`", s));
        let (broker, partition) = s.split_once('-').ok_or_else(invalid)?;
        Ok(Self {
            broker_id: broker.parse().map_err(|_| invalid())?,
            partition: partition.parse().map_err(|_| invalid())?,
        })
    }
}

/// Address of one broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerInfo {
    #[serde(default)]
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl BrokerInfo {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            name: String::new(),
            host: host.into(),
            port,
        }
    }
}

/// Topic name to its virtual partitions, in discovery order
pub type TopicMetadata = IndexMap<String, Vec<VirtualPartition>>;

/// Broker id to address
pub type BrokerMetadata = BTreeMap<u32, BrokerInfo>;

/// Source of cluster layout and consumer group state.
#[async_trait]
pub trait Metadata: Send + Sync {
    async fn topic_metadata(&self) -> Result<TopicMetadata>;

    async fn broker_metadata(&self) -> Result<BrokerMetadata>;

    async fn broker_info(&self, broker_id: u32) -> Result<BrokerInfo> {
        self.broker_metadata()
            .await?
            .remove(&broker_id)
            .ok_or(KafkaClientError::UnknownBroker { broker_id })
    }

    /// Whether the layout changed since it was last read.
    fn needs_refreshing(&self) -> bool;

    async fn register_consumer_process(&self, group_id: &str, process_id: &str) -> Result<()>;

    /// Last committed offset of every partition of `topic` the group has committed.
    async fn topic_offsets(
        &self,
        group_id: &str,
        topic: &str,
    ) -> Result<HashMap<VirtualPartition, Offset>>;

    async fn commit_offset(
        &self,
        group_id: &str,
        topic: &str,
        partition: VirtualPartition,
        offset: Offset,
    ) -> Result<()>;
}

/// Serializable cluster layout
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterLayout {
    #[serde(default)]
    pub brokers: BrokerMetadata,
    #[serde(default)]
    pub topics: TopicMetadata,
}

/// In-memory metadata with a fixed or manually updated layout.
#[derive(Debug, Default)]
pub struct StaticMetadata {
    layout: RwLock<ClusterLayout>,
    changed: AtomicBool,
    offsets: Mutex<HashMap<(String, String), HashMap<VirtualPartition, Offset>>>,
    processes: Mutex<HashMap<String, HashSet<String>>>,
}

impl StaticMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_layout(layout: ClusterLayout) -> Self {
        Self {
            layout: RwLock::new(layout),
            ..Self::default()
        }
    }

    /// Layout from JSON: `{"brokers": {"1": {"host": .., "port": ..}}, "topics": {"t": [{"broker_id": 1, "partition": 0}]}}`
    pub fn from_json(json: &str) -> Result<Self> {
        let layout: ClusterLayout = serde_json::from_str(json)
            .map_err(|e| KafkaClientError::metadata(format!("Invalid cluster layout: {}", e)))?;
        Ok(Self::from_layout(layout))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&*self.layout.read())
            .map_err(|e| KafkaClientError::metadata(e.to_string()))
    }

    pub fn with_broker<S: Into<String>>(mut self, broker_id: u32, host: S, port: u16) -> Self {
        self.layout
            .get_mut()
            .brokers
            .insert(broker_id, BrokerInfo::new(host, port));
        self
    }

    /// Add `partitions` partitions of `topic` hosted on `broker_id`.
    pub fn with_topic<S: Into<String>>(mut self, topic: S, broker_id: u32, partitions: u32) -> Self {
        self.layout
            .get_mut()
            .topics
            .entry(topic.into())
            .or_default()
            .extend((0..partitions).map(|p| VirtualPartition::new(broker_id, p)));
        self
    }

    pub fn set_broker<S: Into<String>>(&self, broker_id: u32, host: S, port: u16) {
        self.layout
            .write()
            .brokers
            .insert(broker_id, BrokerInfo::new(host, port));
        self.changed.store(true, Ordering::Release);
    }

    /// Replace the partition layout of `topic`.
    pub fn set_topic<S: Into<String>>(&self, topic: S, partitions: Vec<VirtualPartition>) {
        self.layout.write().topics.insert(topic.into(), partitions);
        self.changed.store(true, Ordering::Release);
    }

    pub fn committed_offset(
        &self,
        group_id: &str,
        topic: &str,
        partition: VirtualPartition,
    ) -> Option<Offset> {
        self.offsets
            .lock()
            .get(&(group_id.to_string(), topic.to_string()))
            .and_then(|offsets| offsets.get(&partition).copied())
    }

    pub fn registered_processes(&self, group_id: &str) -> Vec<String> {
        let mut processes: Vec<String> = self
            .processes
            .lock()
            .get(group_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        processes.sort();
        processes
    }
}

#[async_trait]
impl Metadata for StaticMetadata {
    async fn topic_metadata(&self) -> Result<TopicMetadata> {
        self.changed.store(false, Ordering::Release);
        Ok(self.layout.read().topics.clone())
    }

    async fn broker_metadata(&self) -> Result<BrokerMetadata> {
        self.changed.store(false, Ordering::Release);
        Ok(self.layout.read().brokers.clone())
    }

    async fn broker_info(&self, broker_id: u32) -> Result<BrokerInfo> {
        self.layout
            .read()
            .brokers
            .get(&broker_id)
            .cloned()
            .ok_or(KafkaClientError::UnknownBroker { broker_id })
    }

    fn needs_refreshing(&self) -> bool {
        self.changed.load(Ordering::Acquire)
    }

    async fn register_consumer_process(&self, group_id: &str, process_id: &str) -> Result<()> {
        self.processes
            .lock()
            .entry(group_id.to_string())
            .or_default()
            .insert(process_id.to_string());
        Ok(())
    }

    async fn topic_offsets(
        &self,
        group_id: &str,
        topic: &str,
    ) -> Result<HashMap<VirtualPartition, Offset>> {
        Ok(self
            .offsets
            .lock()
            .get(&(group_id.to_string(), topic.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn commit_offset(
        &self,
        group_id: &str,
        topic: &str,
        partition: VirtualPartition,
        offset: Offset,
    ) -> Result<()> {
        self.offsets
            .lock()
            .entry((group_id.to_string(), topic.to_string()))
            .or_default()
            .insert(partition, offset);
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Snapshot {
    fetched_at: Instant,
    topics: TopicMetadata,
    brokers: BrokerMetadata,
}

/// Layout cache in front of a slower metadata source.
///
/// Topic and broker maps are served from memory for `ttl`, or until the
/// wrapped source reports a change; group offsets and registrations always
/// go to the wrapped source.
#[derive(Debug)]
pub struct CachedMetadata<M> {
    inner: M,
    ttl: Duration,
    snapshot: RwLock<Option<Snapshot>>,
}

impl<M: Metadata> CachedMetadata<M> {
    pub fn new(inner: M) -> Self {
        Self::with_ttl(inner, DEFAULT_METADATA_TTL)
    }

    pub fn with_ttl(inner: M, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            snapshot: RwLock::new(None),
        }
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }

    /// Drop the cached layout so the next read hits the source.
    pub fn invalidate(&self) {
        *self.snapshot.write() = None;
    }

    fn fresh(&self) -> Option<Snapshot> {
        self.snapshot
            .read()
            .as_ref()
            .filter(|snapshot| snapshot.fetched_at.elapsed() < self.ttl)
            .cloned()
    }

    /// Cached layout, reloaded once it expired or the source changed.
    async fn load(&self) -> Result<Snapshot> {
        if !self.inner.needs_refreshing() {
            if let Some(snapshot) = self.fresh() {
                return Ok(snapshot);
            }
        }
        let topics = self.inner.topic_metadata().await?;
        let brokers = self.inner.broker_metadata().await?;
        debug!(
            "Refreshed metadata: {} topics, {} brokers",
            topics.len(),
            brokers.len()
        );
        let snapshot = Snapshot {
            fetched_at: Instant::now(),
            topics,
            brokers,
        };
        *self.snapshot.write() = Some(snapshot.clone());
        Ok(snapshot)
    }
}

#[async_trait]
impl<M: Metadata> Metadata for CachedMetadata<M> {
    async fn topic_metadata(&self) -> Result<TopicMetadata> {
        Ok(self.load().await?.topics)
    }

    async fn broker_metadata(&self) -> Result<BrokerMetadata> {
        Ok(self.load().await?.brokers)
    }

    async fn broker_info(&self, broker_id: u32) -> Result<BrokerInfo> {
        self.load()
            .await?
            .brokers
            .remove(&broker_id)
            .ok_or(KafkaClientError::UnknownBroker { broker_id })
    }

    fn needs_refreshing(&self) -> bool {
        self.fresh().is_none() || self.inner.needs_refreshing()
    }

    async fn register_consumer_process(&self, group_id: &str, process_id: &str) -> Result<()> {
        self.inner.register_consumer_process(group_id, process_id).await
    }

    async fn topic_offsets(
        &self,
        group_id: &str,
        topic: &str,
    ) -> Result<HashMap<VirtualPartition, Offset>> {
        self.inner.topic_offsets(group_id, topic).await
    }

    async fn commit_offset(
        &self,
        group_id: &str,
        topic: &str,
        partition: VirtualPartition,
        offset: Offset,
    ) -> Result<()> {
        self.inner
            .commit_offset(group_id, topic, partition, offset)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster() -> StaticMetadata {
        StaticMetadata::new()
            .with_broker(1, "host1", 9092)
            .with_broker(2, "host2", 9092)
            .with_topic("topic1", 1, 3)
            .with_topic("topic1", 2, 2)
    }

    #[test]
    fn test_virtual_partition_key() {
        let vp = VirtualPartition::new(2, 7);
        assert_eq!(vp.to_string(), "2-7");
        assert_eq!("2-7".parse::<VirtualPartition>().unwrap(), vp);
        assert!("27".parse::<VirtualPartition>().is_err());
    }

    #[tokio::test]
    async fn test_static_layout() {
        let metadata = cluster();
        let topics = metadata.topic_metadata().await.unwrap();
        assert_eq!(
            topics["topic1"],
            vec![
                VirtualPartition::new(1, 0),
                VirtualPartition::new(1, 1),
                VirtualPartition::new(1, 2),
                VirtualPartition::new(2, 0),
                VirtualPartition::new(2, 1),
            ]
        );
        assert_eq!(metadata.broker_info(2).await.unwrap().host, "host2");
        assert!(matches!(
            metadata.broker_info(9).await,
            Err(KafkaClientError::UnknownBroker { broker_id: 9 })
        ));
    }

    #[tokio::test]
    async fn test_changes_flag_refresh() {
        let metadata = cluster();
        assert!(!metadata.needs_refreshing());
        metadata.set_topic("topic2", vec![VirtualPartition::new(1, 0)]);
        assert!(metadata.needs_refreshing());
        metadata.topic_metadata().await.unwrap();
        assert!(!metadata.needs_refreshing());
    }

    #[tokio::test]
    async fn test_offsets_and_processes() {
        let metadata = cluster();
        let vp = VirtualPartition::new(1, 2);
        metadata
            .commit_offset("group", "topic1", vp, Offset::new(300))
            .await
            .unwrap();
        let offsets = metadata.topic_offsets("group", "topic1").await.unwrap();
        assert_eq!(offsets.get(&vp), Some(&Offset::new(300)));
        assert!(metadata.topic_offsets("other", "topic1").await.unwrap().is_empty());

        metadata.register_consumer_process("group", "p-1").await.unwrap();
        metadata.register_consumer_process("group", "p-1").await.unwrap();
        assert_eq!(metadata.registered_processes("group"), vec!["p-1"]);
    }

    #[test]
    fn test_json_layout() {
        let metadata = StaticMetadata::from_json(
            r#"{"brokers": {"1": {"host": "localhost", "port": 9092}},
                "topics": {"t": [{"broker_id": 1, "partition": 0}]}}"#,
        )
        .unwrap();
        let json = metadata.to_json().unwrap();
        let reloaded = StaticMetadata::from_json(&json).unwrap();
        assert_eq!(*reloaded.layout.read(), *metadata.layout.read());
        assert!(StaticMetadata::from_json("{\"topics\": 3}").is_err());
    }

    #[tokio::test]
    async fn test_cache_reloads_on_source_change() {
        let cached = CachedMetadata::new(cluster());
        assert!(cached.needs_refreshing());
        assert_eq!(cached.topic_metadata().await.unwrap().len(), 1);
        assert!(!cached.needs_refreshing());

        cached
            .inner()
            .set_topic("topic2", vec![VirtualPartition::new(2, 0)]);
        assert!(cached.needs_refreshing());
        assert_eq!(cached.topic_metadata().await.unwrap().len(), 2);
        assert!(!cached.needs_refreshing());
        assert_eq!(cached.broker_info(1).await.unwrap().host, "host1");
    }

    #[tokio::test]
    async fn test_cache_serves_snapshot_until_invalidated() {
        let cached = CachedMetadata::new(cluster());
        cached.topic_metadata().await.unwrap();

        // edits behind the source's back raise no change flag
        cached
            .inner()
            .layout
            .write()
            .topics
            .insert("topic2".to_string(), vec![VirtualPartition::new(2, 0)]);
        assert!(!cached.needs_refreshing());
        assert_eq!(cached.topic_metadata().await.unwrap().len(), 1);
        cached.invalidate();
        assert_eq!(cached.topic_metadata().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_cache_expires() {
        let cached = CachedMetadata::with_ttl(cluster(), Duration::ZERO);
        cached.topic_metadata().await.unwrap();
        assert!(cached.needs_refreshing());
    }
}
