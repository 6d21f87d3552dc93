//! Routing of produced messages to partitions

use std::fmt;

use rand::Rng;

use crate::error::KafkaClientError;
use crate::Result;

/// Routing key attached to a produced message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PartitionKey {
    Int(i64),
    Str(String),
}

impl From<i64> for PartitionKey {
    fn from(key: i64) -> Self {
        PartitionKey::Int(key)
    }
}

impl From<i32> for PartitionKey {
    fn from(key: i32) -> Self {
        PartitionKey::Int(key as i64)
    }
}

impl From<u32> for PartitionKey {
    fn from(key: u32) -> Self {
        PartitionKey::Int(key as i64)
    }
}

impl From<&str> for PartitionKey {
    fn from(key: &str) -> Self {
        PartitionKey::Str(key.to_string())
    }
}

impl From<String> for PartitionKey {
    fn from(key: String) -> Self {
        PartitionKey::Str(key)
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionKey::Int(key) => write!(f, "{}", key),
            PartitionKey::Str(key) => write!(f, "{}", key),
        }
    }
}

/// Maps an optional key and a partition count to a partition index.
///
/// Implementations must return a value in `0..num_partitions`; the producer
/// connector rejects anything else.
pub trait Partitioner: Send + Sync {
    fn partition(&self, key: Option<&PartitionKey>, num_partitions: usize) -> Result<usize>;
}

/// Random partition without a key, `key mod n` for integer keys
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPartitioner;

impl Partitioner for DefaultPartitioner {
    fn partition(&self, key: Option<&PartitionKey>, num_partitions: usize) -> Result<usize> {
        if num_partitions == 0 {
            return Err(KafkaClientError::invalid_config(
                "Cannot partition over zero partitions",
            ));
        }
        match key {
            None => Ok(rand::thread_rng().gen_range(0..num_partitions)),
            Some(PartitionKey::Int(key)) => Ok(key.rem_euclid(num_partitions as i64) as usize),
            Some(PartitionKey::Str(_)) => Err(KafkaClientError::InvalidPartitionKey {
                message: "Default Kafka Partitioner only accepts integer keys".to_string(),
            }),
        }
    }
}

impl<F> Partitioner for F
where
    F: Fn(Option<&PartitionKey>, usize) -> Result<usize> + Send + Sync,
{
    fn partition(&self, key: Option<&PartitionKey>, num_partitions: usize) -> Result<usize> {
        self(key, num_partitions)
    }
}
