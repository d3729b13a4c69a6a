//! Message consumer: subscriptions, lifecycle, and the per-batch routine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};

use crate::broker::{BatchContext, BatchDispatch, BrokerAdmin, BrokerClient, RunOptions};
use crate::config::ConsumerOptions;
use crate::error::{BrokerError, ConsumerError};
use crate::metrics_consts::{
    CONSUMER_BATCHES_PROCESSED, CONSUMER_HEARTBEAT_FAILURES, CONSUMER_MESSAGES_PROCESSED,
    CONSUMER_UNSUBSCRIBED_BATCHES, RESYNC_FORCED_COMMITS,
};
use crate::sync::WorkerController;
use crate::types::{next_offset, Batch, Message, Partition, TopicPartitionOffset};

/// Per-message handler for simple-mode subscriptions.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, partition: &Partition, message: &Message) -> anyhow::Result<()>;
}

/// Whole-batch handler for batched subscriptions. Offset bookkeeping is the
/// handler's business (via `ctx`) unless the subscription opts into
/// auto-resolution.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle_batch(&self, batch: &Batch, ctx: &dyn BatchContext) -> anyhow::Result<()>;
}

/// Parameters for [`MessageConsumer::subscribe_batched`].
pub struct BatchSubscription {
    pub topic: String,
    pub handler: Arc<dyn BatchHandler>,
    pub from_beginning: bool,
    /// Resolve the batch's last offset automatically after the handler
    /// returns success.
    pub auto_resolve: bool,
}

impl BatchSubscription {
    pub fn new(topic: impl Into<String>, handler: Arc<dyn BatchHandler>) -> Self {
        Self {
            topic: topic.into(),
            handler,
            from_beginning: false,
            auto_resolve: true,
        }
    }

    pub fn from_beginning(mut self, from_beginning: bool) -> Self {
        self.from_beginning = from_beginning;
        self
    }

    pub fn auto_resolve(mut self, auto_resolve: bool) -> Self {
        self.auto_resolve = auto_resolve;
        self
    }
}

enum Subscription {
    Simple {
        handler: Arc<dyn MessageHandler>,
        from_beginning: bool,
    },
    Batched {
        handler: Arc<dyn BatchHandler>,
        from_beginning: bool,
        auto_resolve: bool,
    },
}

impl Subscription {
    fn from_beginning(&self) -> bool {
        match self {
            Subscription::Simple { from_beginning, .. } => *from_beginning,
            Subscription::Batched { from_beginning, .. } => *from_beginning,
        }
    }
}

/// Lifecycle states. `start()` and `stop()` are idempotent: concurrent
/// callers sequence behind the in-flight transition and observe its stored
/// outcome instead of re-executing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

struct SubscriptionRegistry {
    /// Set when `start()` snapshots the registry; later subscribe calls fail.
    frozen: bool,
    by_topic: HashMap<String, Subscription>,
}

/// Owns the broker connection, subscription topology, and the batch-commit
/// protocol.
pub struct MessageConsumer {
    options: ConsumerOptions,
    broker: Arc<dyn BrokerClient>,
    admin: Arc<dyn BrokerAdmin>,
    controller: Arc<WorkerController>,
    subscriptions: Mutex<SubscriptionRegistry>,
    /// Orders lifecycle transitions; held for the whole duration of a
    /// transition so concurrent start/stop callers queue behind it.
    lifecycle: AsyncMutex<LifecycleInner>,
    state_tx: watch::Sender<Lifecycle>,
    state_rx: watch::Receiver<Lifecycle>,
}

struct LifecycleInner {
    phase: Lifecycle,
    /// Start-failure message, replayed to later `start()` callers.
    failure: Option<String>,
}

impl MessageConsumer {
    pub fn new(
        options: ConsumerOptions,
        broker: Arc<dyn BrokerClient>,
        admin: Arc<dyn BrokerAdmin>,
    ) -> Result<Self, ConsumerError> {
        options.validate()?;
        let (state_tx, state_rx) = watch::channel(Lifecycle::Created);
        Ok(Self {
            options,
            broker,
            admin,
            controller: Arc::new(WorkerController::new()),
            subscriptions: Mutex::new(SubscriptionRegistry {
                frozen: false,
                by_topic: HashMap::new(),
            }),
            lifecycle: AsyncMutex::new(LifecycleInner {
                phase: Lifecycle::Created,
                failure: None,
            }),
            state_tx,
            state_rx,
        })
    }

    /// Current lifecycle state. Transient states (`Starting`, `Stopping`) are
    /// observable while a transition is in flight.
    pub fn state(&self) -> Lifecycle {
        *self.state_rx.borrow()
    }

    /// Register a simple-mode (per-message) subscription. Must be called
    /// before `start()`; one subscription per topic.
    pub fn subscribe(
        &self,
        topic: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
        from_beginning: bool,
    ) -> Result<(), ConsumerError> {
        self.register(
            topic.into(),
            Subscription::Simple {
                handler,
                from_beginning,
            },
        )
    }

    /// Register a batch-mode subscription. Must be called before `start()`.
    pub fn subscribe_batched(&self, subscription: BatchSubscription) -> Result<(), ConsumerError> {
        let BatchSubscription {
            topic,
            handler,
            from_beginning,
            auto_resolve,
        } = subscription;
        self.register(
            topic,
            Subscription::Batched {
                handler,
                from_beginning,
                auto_resolve,
            },
        )
    }

    fn register(&self, topic: String, subscription: Subscription) -> Result<(), ConsumerError> {
        let mut registry = self.lock_subscriptions();
        if registry.frozen {
            return Err(ConsumerError::AlreadyRunning);
        }
        if registry.by_topic.contains_key(&topic) {
            return Err(ConsumerError::DuplicateSubscription { topic });
        }
        debug!(topic = %topic, "registered subscription");
        registry.by_topic.insert(topic, subscription);
        Ok(())
    }

    /// Connect to the broker, subscribe all registered topics, and begin
    /// batch delivery. Idempotent: a second call (concurrent or later)
    /// observes the first call's outcome. A connect/setup failure is
    /// terminal; retries are the caller's responsibility.
    pub async fn start(&self) -> Result<(), ConsumerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        match lifecycle.phase {
            Lifecycle::Running => return Ok(()),
            Lifecycle::Failed => {
                let message = lifecycle.failure.clone().unwrap_or_default();
                return Err(ConsumerError::StartFailed(message));
            }
            Lifecycle::Stopping | Lifecycle::Stopped => return Err(ConsumerError::Stopped),
            Lifecycle::Created | Lifecycle::Starting => {}
        }

        self.set_phase(&mut lifecycle, Lifecycle::Starting);
        match self.connect_and_run().await {
            Ok(()) => {
                self.set_phase(&mut lifecycle, Lifecycle::Running);
                info!(group_id = %self.options.group_id, "consumer running");
                Ok(())
            }
            Err(e) => {
                error!(error = ?e, "consumer failed to start");
                lifecycle.failure = Some(format!("{e:#}"));
                self.set_phase(&mut lifecycle, Lifecycle::Failed);
                // Best-effort teardown of whatever was connected; the failed
                // state is terminal either way.
                if let Err(te) = self.broker.disconnect().await {
                    warn!(error = ?te, "broker disconnect after failed start");
                }
                if let Err(te) = self.admin.disconnect().await {
                    warn!(error = ?te, "admin disconnect after failed start");
                }
                Err(e)
            }
        }
    }

    async fn connect_and_run(&self) -> Result<(), ConsumerError> {
        let topics: Vec<(String, bool)> = {
            let mut registry = self.lock_subscriptions();
            registry.frozen = true;
            registry
                .by_topic
                .iter()
                .map(|(topic, sub)| (topic.clone(), sub.from_beginning()))
                .collect()
        };

        self.broker.connect().await?;
        self.admin.connect().await?;

        for (topic, from_beginning) in &topics {
            self.broker.subscribe(topic, *from_beginning).await?;
            info!(topic = %topic, from_beginning = *from_beginning, "subscribed");
        }

        let topic_names: Vec<String> = topics.iter().map(|(t, _)| t.clone()).collect();
        let metadata = self.admin.fetch_topic_metadata(&topic_names).await?;
        let total_partitions: usize = metadata.values().map(|partitions| partitions.len()).sum();
        let concurrency = total_partitions.clamp(1, self.options.max_partition_concurrency);
        info!(total_partitions, concurrency, "fetched topic metadata");

        let worker = Arc::new(BatchWorker {
            subscriptions: Arc::new(self.snapshot_subscriptions()),
            controller: Arc::clone(&self.controller),
        });
        let run_options = RunOptions {
            partitions_consumed_concurrently: concurrency,
            auto_commit: self.options.auto_commit,
            commit_interval: self.options.commit_interval,
        };
        self.broker.run(run_options, worker).await?;
        Ok(())
    }

    /// Drain in-flight partition loops (each performs one final forced
    /// commit), then stop delivery and disconnect. Idempotent; calling before
    /// `start()` is a no-op with no disconnect. A teardown failure is
    /// reported but the consumer still ends up `Stopped`.
    pub async fn stop(&self) -> Result<(), ConsumerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        match lifecycle.phase {
            Lifecycle::Created => {
                self.set_phase(&mut lifecycle, Lifecycle::Stopped);
                return Ok(());
            }
            Lifecycle::Stopped | Lifecycle::Failed => return Ok(()),
            Lifecycle::Running => {}
            // Unreachable while the lifecycle mutex is held.
            Lifecycle::Starting | Lifecycle::Stopping => return Err(ConsumerError::Stopped),
        }

        self.set_phase(&mut lifecycle, Lifecycle::Stopping);
        let acks = self.controller.synchronize().await;
        info!(drained = acks.len(), "in-flight partition loops drained");

        let mut teardown_error: Option<BrokerError> = None;
        for (what, result) in [
            ("stop", self.broker.stop().await),
            ("broker disconnect", self.broker.disconnect().await),
            ("admin disconnect", self.admin.disconnect().await),
        ] {
            if let Err(e) = result {
                warn!(step = what, error = ?e, "teardown step failed");
                teardown_error.get_or_insert(e);
            }
        }

        self.set_phase(&mut lifecycle, Lifecycle::Stopped);
        info!("consumer stopped");
        match teardown_error {
            Some(e) => Err(ConsumerError::Teardown(e.into())),
            None => Ok(()),
        }
    }

    fn set_phase(&self, lifecycle: &mut LifecycleInner, phase: Lifecycle) {
        lifecycle.phase = phase;
        let _ = self.state_tx.send(phase);
    }

    fn lock_subscriptions(&self) -> MutexGuard<'_, SubscriptionRegistry> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot_subscriptions(&self) -> HashMap<String, SubscriptionSnapshot> {
        self.lock_subscriptions()
            .by_topic
            .iter()
            .map(|(topic, sub)| {
                let snapshot = match sub {
                    Subscription::Simple { handler, .. } => SubscriptionSnapshot::Simple {
                        handler: Arc::clone(handler),
                    },
                    Subscription::Batched {
                        handler,
                        auto_resolve,
                        ..
                    } => SubscriptionSnapshot::Batched {
                        handler: Arc::clone(handler),
                        auto_resolve: *auto_resolve,
                    },
                };
                (topic.clone(), snapshot)
            })
            .collect()
    }
}

enum SubscriptionSnapshot {
    Simple {
        handler: Arc<dyn MessageHandler>,
    },
    Batched {
        handler: Arc<dyn BatchHandler>,
        auto_resolve: bool,
    },
}

/// Dispatch target handed to the broker client: runs the per-batch routine,
/// one instance concurrently per partition.
struct BatchWorker {
    subscriptions: Arc<HashMap<String, SubscriptionSnapshot>>,
    controller: Arc<WorkerController>,
}

#[async_trait]
impl BatchDispatch for BatchWorker {
    async fn process_batch(
        &self,
        batch: Batch,
        ctx: Arc<dyn BatchContext>,
    ) -> Result<(), ConsumerError> {
        metrics::counter!(CONSUMER_BATCHES_PROCESSED).increment(1);

        let Some(subscription) = self.subscriptions.get(batch.topic()) else {
            // Broker/subscription mismatch; fatal for this partition's task.
            metrics::counter!(CONSUMER_UNSUBSCRIBED_BATCHES).increment(1);
            error!(partition = %batch.partition(), "batch for unsubscribed topic");
            return Err(ConsumerError::UnsubscribedTopic {
                topic: batch.topic().to_string(),
            });
        };

        match subscription {
            SubscriptionSnapshot::Batched {
                handler,
                auto_resolve,
            } => {
                let last_offset = batch.last_offset().map(str::to_string);
                handler
                    .handle_batch(&batch, ctx.as_ref())
                    .await
                    .map_err(ConsumerError::Handler)?;
                if *auto_resolve {
                    if let Some(offset) = last_offset {
                        ctx.resolve_offset(&offset).await?;
                    }
                }
                Ok(())
            }
            SubscriptionSnapshot::Simple { handler } => {
                self.process_simple(handler.as_ref(), batch, ctx).await
            }
        }
    }
}

impl BatchWorker {
    /// The correctness-critical inner loop: messages strictly in delivery
    /// order, offsets resolved only after their handler completes, resync
    /// polled between messages so `stop()` and rebalances wind the loop down
    /// without losing processed work.
    async fn process_simple(
        &self,
        handler: &dyn MessageHandler,
        batch: Batch,
        ctx: Arc<dyn BatchContext>,
    ) -> Result<(), ConsumerError> {
        // Held for the whole loop; dropping it on any exit path releases the
        // slot so a pending broadcast can resolve.
        let sync = self.controller.create_synchronizer();
        let partition = batch.partition().clone();

        for message in batch.messages() {
            handler
                .handle(&partition, message)
                .await
                .map_err(ConsumerError::Handler)?;

            if let Err(e) = ctx.heartbeat().await {
                if e.is_rebalance_trigger() {
                    metrics::counter!(CONSUMER_HEARTBEAT_FAILURES, "resync" => "true").increment(1);
                    warn!(partition = %partition, error = %e, "heartbeat rejected; scheduling resync");
                    // Not awaited: this slot is part of the broadcast and
                    // only acknowledges at its own next poll.
                    let controller = Arc::clone(&self.controller);
                    tokio::spawn(async move {
                        let acks = controller.synchronize().await;
                        debug!(acks = acks.len(), "rebalance resync resolved");
                    });
                } else {
                    metrics::counter!(CONSUMER_HEARTBEAT_FAILURES, "resync" => "false")
                        .increment(1);
                    return Err(ConsumerError::Broker(e));
                }
            }

            ctx.resolve_offset(&message.offset).await?;
            metrics::counter!(CONSUMER_MESSAGES_PROCESSED).increment(1);

            let forced = sync
                .check_synchronized(|| {
                    let ctx = Arc::clone(&ctx);
                    let partition = partition.clone();
                    // The current message is the high-water mark: commit its
                    // successor as the next offset to read.
                    let commit_offset = next_offset(&message.offset);
                    async move {
                        let commit = [TopicPartitionOffset::new(partition, commit_offset?)];
                        ctx.commit_offsets_if_necessary(Some(&commit)).await?;
                        Ok(())
                    }
                })
                .await
                .map_err(ConsumerError::Commit)?;
            if forced {
                metrics::counter!(RESYNC_FORCED_COMMITS).increment(1);
                debug!(partition = %partition, offset = %message.offset, "forced commit; winding down batch");
                return Ok(());
            }

            // Opportunistic commit on the client's interval policy.
            ctx.commit_offsets_if_necessary(None).await?;
        }

        Ok(())
    }
}
