use thiserror::Error;

/// Errors surfaced by the broker client seam.
///
/// Rebalance-in-progress and coordinator-changed are the transient coordinator
/// conditions a heartbeat can report; the consumer recovers from them locally
/// by broadcasting a resync instead of failing the partition task.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("consumer group rebalance in progress")]
    RebalanceInProgress,

    #[error("group coordinator changed")]
    CoordinatorChanged,

    #[error("broker transport error: {0}")]
    Transport(#[from] anyhow::Error),
}

impl BrokerError {
    /// Whether this error should trigger a forced resync rather than abort the
    /// partition task.
    pub fn is_rebalance_trigger(&self) -> bool {
        matches!(
            self,
            BrokerError::RebalanceInProgress | BrokerError::CoordinatorChanged
        )
    }
}

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("invalid consumer configuration: {0}")]
    Configuration(String),

    #[error("received batch for unsubscribed topic {topic}")]
    UnsubscribedTopic { topic: String },

    #[error("invalid offset {offset:?}: expected a decimal u64 with a successor")]
    InvalidOffset { offset: String },

    #[error("subscriptions are frozen once the consumer has started")]
    AlreadyRunning,

    #[error("topic {topic} already has a subscription")]
    DuplicateSubscription { topic: String },

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("message handler failed: {0}")]
    Handler(#[source] anyhow::Error),

    #[error("forced offset commit failed: {0}")]
    Commit(#[source] anyhow::Error),

    #[error("teardown failed: {0}")]
    Teardown(#[source] anyhow::Error),

    #[error("consumer previously failed to start: {0}")]
    StartFailed(String),

    #[error("consumer has been stopped")]
    Stopped,
}
