use std::time::Duration;

use envconfig::Envconfig;

use crate::error::ConsumerError;

/// Environment-driven configuration for services embedding the consumer.
#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BROKER_HOSTS", default = "localhost:9092")]
    pub broker_hosts: String,

    #[envconfig(from = "CONSUMER_GROUP_ID", default = "message-consumer")]
    pub group_id: String,

    #[envconfig(from = "COMMIT_INTERVAL_MS", default = "5000")]
    pub commit_interval_ms: u64,

    #[envconfig(from = "AUTO_COMMIT", default = "true")]
    pub auto_commit: bool,

    #[envconfig(from = "MAX_PARTITION_CONCURRENCY", default = "32")]
    pub max_partition_concurrency: usize,
}

impl Config {
    pub fn broker_host_list(&self) -> Vec<String> {
        self.broker_hosts
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Programmatic construction options for [`crate::MessageConsumer`].
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub broker_hosts: Vec<String>,
    pub group_id: String,
    pub commit_interval: Duration,
    pub auto_commit: bool,
    pub max_partition_concurrency: usize,
}

impl ConsumerOptions {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            broker_hosts: vec!["localhost:9092".to_string()],
            group_id: group_id.into(),
            commit_interval: Duration::from_secs(5),
            auto_commit: true,
            max_partition_concurrency: 32,
        }
    }

    pub fn with_broker_hosts(mut self, hosts: Vec<String>) -> Self {
        self.broker_hosts = hosts;
        self
    }

    pub fn with_commit_interval(mut self, interval: Duration) -> Self {
        self.commit_interval = interval;
        self
    }

    pub fn with_auto_commit(mut self, auto_commit: bool) -> Self {
        self.auto_commit = auto_commit;
        self
    }

    pub fn with_max_partition_concurrency(mut self, max: usize) -> Self {
        self.max_partition_concurrency = max;
        self
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            broker_hosts: config.broker_host_list(),
            group_id: config.group_id.clone(),
            commit_interval: Duration::from_millis(config.commit_interval_ms),
            auto_commit: config.auto_commit,
            max_partition_concurrency: config.max_partition_concurrency,
        }
    }

    pub fn validate(&self) -> Result<(), ConsumerError> {
        if self.group_id.trim().is_empty() {
            return Err(ConsumerError::Configuration(
                "group_id must not be empty".to_string(),
            ));
        }
        if self.broker_hosts.is_empty() {
            return Err(ConsumerError::Configuration(
                "at least one broker host is required".to_string(),
            ));
        }
        if self.commit_interval.is_zero() {
            return Err(ConsumerError::Configuration(
                "commit_interval must be non-zero".to_string(),
            ));
        }
        if self.max_partition_concurrency == 0 {
            return Err(ConsumerError::Configuration(
                "max_partition_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
