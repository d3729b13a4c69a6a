use serde::{Deserialize, Serialize};

use crate::error::ConsumerError;

/// A (topic, partition) pair identifying one independently-ordered shard of a
/// topic's message log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: String, partition_number: i32) -> Self {
        Self {
            topic,
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

/// Partition metadata returned by `BrokerAdmin::fetch_topic_metadata`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub partition_number: i32,
}

impl PartitionInfo {
    pub fn new(partition_number: i32) -> Self {
        Self { partition_number }
    }
}

/// A single consumed message. Offsets are decimal-string-encoded unsigned
/// 64-bit integers, monotonically increasing within a partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub offset: String,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, Vec<u8>)>,
    pub timestamp_ms: i64,
}

impl Message {
    pub fn new(offset: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            offset: offset.into(),
            key: None,
            payload,
            headers: Vec::new(),
            timestamp_ms: 0,
        }
    }
}

/// An ordered group of messages for one partition, delivered atomically by the
/// broker client and processed by a single consuming task.
#[derive(Debug, Clone)]
pub struct Batch {
    partition: Partition,
    messages: Vec<Message>,
}

impl Batch {
    pub fn new(partition: Partition, messages: Vec<Message>) -> Self {
        Self {
            partition,
            messages,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last_offset(&self) -> Option<&str> {
        self.messages.last().map(|m| m.offset.as_str())
    }
}

/// An explicit offset commit entry. `offset` is always the NEXT offset to
/// read: callers commit the successor of the last resolved offset, and broker
/// clients commit the value verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicPartitionOffset {
    partition: Partition,
    offset: String,
}

impl TopicPartitionOffset {
    pub fn new(partition: Partition, offset: String) -> Self {
        Self { partition, offset }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn offset(&self) -> &str {
        &self.offset
    }
}

/// Parse a decimal-string offset.
pub fn parse_offset(offset: &str) -> Result<u64, ConsumerError> {
    offset
        .parse::<u64>()
        .map_err(|_| ConsumerError::InvalidOffset {
            offset: offset.to_string(),
        })
}

/// Successor of a resolved offset: the next offset to read after `offset` has
/// been processed.
pub fn next_offset(offset: &str) -> Result<String, ConsumerError> {
    let parsed = parse_offset(offset)?;
    let next = parsed
        .checked_add(1)
        .ok_or_else(|| ConsumerError::InvalidOffset {
            offset: offset.to_string(),
        })?;
    Ok(next.to_string())
}
