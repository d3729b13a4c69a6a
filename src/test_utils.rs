//! In-memory broker for tests: scripted heartbeats, recorded commits, and a
//! `deliver` entry point that drives the consumer's batch dispatch the way a
//! real client would.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::broker::{BatchContext, BatchDispatch, BrokerAdmin, BrokerClient, RunOptions};
use crate::error::{BrokerError, ConsumerError};
use crate::types::{next_offset, Batch, Message, Partition, PartitionInfo, TopicPartitionOffset};

pub fn test_message(offset: &str, payload: &str) -> Message {
    Message::new(offset, payload.as_bytes().to_vec())
}

pub fn test_batch(topic: &str, partition: i32, offsets: &[&str]) -> Batch {
    let messages = offsets
        .iter()
        .map(|offset| test_message(offset, &format!("payload-{offset}")))
        .collect();
    Batch::new(Partition::new(topic.to_string(), partition), messages)
}

/// One recorded commit: whether it was explicit (forced) and its entries.
#[derive(Debug, Clone)]
pub struct RecordedCommit {
    pub explicit: bool,
    pub entries: Vec<TopicPartitionOffset>,
}

#[derive(Default)]
struct BrokerRecords {
    subscriptions: Vec<(String, bool)>,
    resolved: HashMap<Partition, Vec<String>>,
    /// Resolves since the last commit, per partition (drives the emulated
    /// commit-interval policy).
    uncommitted: HashMap<Partition, usize>,
    commits: Vec<RecordedCommit>,
    heartbeats: HashMap<Partition, usize>,
    heartbeat_script: VecDeque<BrokerError>,
}

/// Scripted broker implementing both the consumer and admin seams.
#[derive(Default)]
pub struct InMemoryBroker {
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    admin_connects: AtomicUsize,
    admin_disconnects: AtomicUsize,
    stops: AtomicUsize,
    fail_connect: AtomicBool,
    topic_partitions: Mutex<HashMap<String, usize>>,
    /// Commit every N resolves when `commit_offsets_if_necessary(None)` is
    /// polled; `None` disables opportunistic commits entirely.
    commit_every: Mutex<Option<usize>>,
    run: Mutex<Option<(RunOptions, Arc<dyn BatchDispatch>)>>,
    records: Mutex<BrokerRecords>,
}

impl InMemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_topic_partitions(&self, topic: &str, partitions: usize) {
        self.topic_partitions
            .lock()
            .unwrap()
            .insert(topic.to_string(), partitions);
    }

    pub fn set_commit_every(&self, every: Option<usize>) {
        *self.commit_every.lock().unwrap() = every;
    }

    pub fn fail_next_connect(&self) {
        self.fail_connect.store(true, Ordering::SeqCst);
    }

    pub fn queue_heartbeat_error(&self, error: BrokerError) {
        self.records
            .lock()
            .unwrap()
            .heartbeat_script
            .push_back(error);
    }

    /// Deliver one batch to the running dispatcher, as the broker client
    /// would from its own partition task.
    pub async fn deliver(self: &Arc<Self>, batch: Batch) -> Result<(), ConsumerError> {
        let dispatch = {
            let run = self.run.lock().unwrap();
            let (_, dispatch) = run.as_ref().expect("deliver called before run");
            Arc::clone(dispatch)
        };
        let ctx = Arc::new(PartitionContext {
            broker: Arc::clone(self),
            partition: batch.partition().clone(),
        });
        dispatch.process_batch(batch, ctx).await
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn subscriptions(&self) -> Vec<(String, bool)> {
        self.records.lock().unwrap().subscriptions.clone()
    }

    pub fn run_options(&self) -> Option<RunOptions> {
        self.run
            .lock()
            .unwrap()
            .as_ref()
            .map(|(options, _)| options.clone())
    }

    pub fn resolved_offsets(&self, partition: &Partition) -> Vec<String> {
        self.records
            .lock()
            .unwrap()
            .resolved
            .get(partition)
            .cloned()
            .unwrap_or_default()
    }

    pub fn commits(&self) -> Vec<RecordedCommit> {
        self.records.lock().unwrap().commits.clone()
    }

    pub fn explicit_commits(&self) -> Vec<RecordedCommit> {
        self.commits().into_iter().filter(|c| c.explicit).collect()
    }

    pub fn heartbeat_count(&self, partition: &Partition) -> usize {
        self.records
            .lock()
            .unwrap()
            .heartbeats
            .get(partition)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        if self.fail_connect.swap(false, Ordering::SeqCst) {
            return Err(BrokerError::Transport(anyhow::anyhow!(
                "connection refused"
            )));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, from_beginning: bool) -> Result<(), BrokerError> {
        self.records
            .lock()
            .unwrap()
            .subscriptions
            .push((topic.to_string(), from_beginning));
        Ok(())
    }

    async fn run(
        &self,
        options: RunOptions,
        dispatch: Arc<dyn BatchDispatch>,
    ) -> Result<(), BrokerError> {
        *self.run.lock().unwrap() = Some((options, dispatch));
        Ok(())
    }

    async fn stop(&self) -> Result<(), BrokerError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl BrokerAdmin for InMemoryBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        self.admin_connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.admin_disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch_topic_metadata(
        &self,
        topics: &[String],
    ) -> Result<HashMap<String, Vec<PartitionInfo>>, BrokerError> {
        let configured = self.topic_partitions.lock().unwrap();
        Ok(topics
            .iter()
            .map(|topic| {
                let count = configured.get(topic).copied().unwrap_or(1);
                let partitions = (0..count as i32).map(PartitionInfo::new).collect();
                (topic.clone(), partitions)
            })
            .collect())
    }
}

struct PartitionContext {
    broker: Arc<InMemoryBroker>,
    partition: Partition,
}

#[async_trait]
impl BatchContext for PartitionContext {
    async fn heartbeat(&self) -> Result<(), BrokerError> {
        let mut records = self.broker.records.lock().unwrap();
        *records.heartbeats.entry(self.partition.clone()).or_default() += 1;
        match records.heartbeat_script.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn resolve_offset(&self, offset: &str) -> Result<(), BrokerError> {
        let mut records = self.broker.records.lock().unwrap();
        records
            .resolved
            .entry(self.partition.clone())
            .or_default()
            .push(offset.to_string());
        *records.uncommitted.entry(self.partition.clone()).or_default() += 1;
        Ok(())
    }

    async fn commit_offsets_if_necessary(
        &self,
        explicit: Option<&[TopicPartitionOffset]>,
    ) -> Result<(), BrokerError> {
        let mut records = self.broker.records.lock().unwrap();
        match explicit {
            Some(entries) => {
                for entry in entries {
                    records.uncommitted.insert(entry.partition().clone(), 0);
                }
                records.commits.push(RecordedCommit {
                    explicit: true,
                    entries: entries.to_vec(),
                });
            }
            None => {
                let Some(every) = *self.broker.commit_every.lock().unwrap() else {
                    return Ok(());
                };
                let due = records
                    .uncommitted
                    .get(&self.partition)
                    .is_some_and(|count| *count >= every);
                if !due {
                    return Ok(());
                }
                let last = records
                    .resolved
                    .get(&self.partition)
                    .and_then(|offsets| offsets.last())
                    .cloned()
                    .expect("resolves recorded before commit");
                let committed = next_offset(&last)
                    .map_err(|e| BrokerError::Transport(anyhow::anyhow!(e)))?;
                records.uncommitted.insert(self.partition.clone(), 0);
                records.commits.push(RecordedCommit {
                    explicit: false,
                    entries: vec![TopicPartitionOffset::new(
                        self.partition.clone(),
                        committed,
                    )],
                });
            }
        }
        Ok(())
    }
}
