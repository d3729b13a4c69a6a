//! Broker client seam.
//!
//! The consumer core owns no wire protocol; it drives a partitioned-log broker
//! through these traits. Production adapters implement them against a real
//! client library; tests use the in-memory implementation in
//! [`crate::test_utils`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{BrokerError, ConsumerError};
use crate::types::{Batch, PartitionInfo, TopicPartitionOffset};

/// Options handed to [`BrokerClient::run`]. The commit-interval policy is
/// enforced by the broker client, not reimplemented by the consumer core.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Upper bound on partition-processing tasks running concurrently.
    pub partitions_consumed_concurrently: usize,
    /// Whether the client may commit resolved offsets on its own schedule.
    pub auto_commit: bool,
    /// How often the client's opportunistic commit policy fires.
    pub commit_interval: Duration,
}

/// Consumer-side connection to the broker.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn connect(&self) -> Result<(), BrokerError>;

    async fn disconnect(&self) -> Result<(), BrokerError>;

    async fn subscribe(&self, topic: &str, from_beginning: bool) -> Result<(), BrokerError>;

    /// Begin delivering batches to `dispatch`, one task per partition up to
    /// `options.partitions_consumed_concurrently`. Returns once delivery is
    /// set up; the client drives delivery from its own tasks.
    async fn run(
        &self,
        options: RunOptions,
        dispatch: Arc<dyn BatchDispatch>,
    ) -> Result<(), BrokerError>;

    /// Stop delivering batches. Called after in-flight partition loops have
    /// wound down, before `disconnect`.
    async fn stop(&self) -> Result<(), BrokerError>;
}

/// Admin-side connection, used at start time to size partition concurrency.
#[async_trait]
pub trait BrokerAdmin: Send + Sync {
    async fn connect(&self) -> Result<(), BrokerError>;

    async fn disconnect(&self) -> Result<(), BrokerError>;

    async fn fetch_topic_metadata(
        &self,
        topics: &[String],
    ) -> Result<HashMap<String, Vec<PartitionInfo>>, BrokerError>;
}

/// Per-batch operations the broker client exposes to the processing loop.
///
/// Every method is a suspension point: heartbeats, offset resolution and
/// commits all go through broker I/O.
#[async_trait]
pub trait BatchContext: Send + Sync {
    /// Send a consumer-group heartbeat for this batch's session.
    async fn heartbeat(&self) -> Result<(), BrokerError>;

    /// Record `offset` as processed for this batch's partition. Feeds the
    /// client's opportunistic commit policy.
    async fn resolve_offset(&self, offset: &str) -> Result<(), BrokerError>;

    /// With `Some(offsets)`, commit exactly those entries now (each entry
    /// already holds the next offset to read). With `None`, commit resolved
    /// offsets only if the configured commit interval says so.
    async fn commit_offsets_if_necessary(
        &self,
        explicit: Option<&[TopicPartitionOffset]>,
    ) -> Result<(), BrokerError>;
}

/// Entry point the broker client invokes once per delivered batch. Implemented
/// by the consumer core.
#[async_trait]
pub trait BatchDispatch: Send + Sync {
    async fn process_batch(
        &self,
        batch: Batch,
        ctx: Arc<dyn BatchContext>,
    ) -> Result<(), ConsumerError>;
}
