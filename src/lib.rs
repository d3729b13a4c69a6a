//! Message-consumption core for backend services.
//!
//! Drives batched consumption from a partitioned log through an injected
//! broker client, coordinating consumer-group heartbeats, offset commits, and
//! cooperative resynchronization across concurrently-processed partition
//! batch loops. Graceful shutdown and rebalance recovery both reduce to one
//! primitive: a [`sync::WorkerController`] broadcast that every in-flight
//! loop observes at its next poll point, performing one forced commit before
//! winding down.
//!
//! The broker itself is an external collaborator reached through the traits
//! in [`broker`]; an in-memory implementation for tests lives in
//! [`test_utils`].

pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod metrics_consts;
pub mod sync;
pub mod test_utils;
pub mod types;

// Re-export commonly used types for convenience
pub use broker::{BatchContext, BatchDispatch, BrokerAdmin, BrokerClient, RunOptions};
pub use config::{Config, ConsumerOptions};
pub use consumer::{
    BatchHandler, BatchSubscription, Lifecycle, MessageConsumer, MessageHandler,
};
pub use error::{BrokerError, ConsumerError};
pub use sync::{Synchronizer, WorkerController};
pub use types::{Batch, Message, Partition, PartitionInfo, TopicPartitionOffset};
