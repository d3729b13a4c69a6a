//! Cooperative resynchronization primitives.
//!
//! A [`WorkerController`] is the signaling bus between `stop()` (or a
//! heartbeat failure) and every in-flight partition batch loop. Each loop
//! registers a [`Synchronizer`] slot and polls it between messages; a
//! broadcast marks every registered slot pending and waits until each one has
//! either acknowledged (by running its forced-commit action at the poll point)
//! or detached. Nothing is preempted: the broadcast completes only through
//! cooperative polling.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{debug, warn};

use crate::metrics_consts::{RESYNC_ACTIVE_SLOTS, RESYNC_ROUNDS};

struct SlotState {
    /// Set by a broadcast (or at registration while a round is in flight),
    /// cleared when the slot polls.
    pending: bool,
    /// Round this slot must acknowledge, if it was registered when the round
    /// started. Late-registered slots carry `None`: they go pending locally
    /// but never join an in-flight round's acknowledgement set.
    round: Option<u64>,
}

struct Round<R> {
    id: u64,
    /// Slot ids that still owe an acknowledgement. Fixed at round start;
    /// members leave by acking or detaching, never by timeout.
    remaining: HashSet<u64>,
    results: Vec<R>,
    done_tx: Option<oneshot::Sender<Vec<R>>>,
}

struct ControllerState<R> {
    next_slot_id: u64,
    next_round_id: u64,
    slots: HashMap<u64, SlotState>,
    round: Option<Round<R>>,
}

/// Factory and registry of [`Synchronizer`] slots; broadcasts resync requests
/// and collects their acknowledgement results.
pub struct WorkerController<R = ()> {
    state: Mutex<ControllerState<R>>,
    /// Serializes broadcasts: at most one round in flight, later callers
    /// queue behind it.
    round_gate: AsyncMutex<()>,
}

impl<R: Send + 'static> Default for WorkerController<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Send + 'static> WorkerController<R> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ControllerState {
                next_slot_id: 0,
                next_round_id: 0,
                slots: HashMap::new(),
                round: None,
            }),
            round_gate: AsyncMutex::new(()),
        }
    }

    /// Register a new synchronization slot for one partition batch loop.
    ///
    /// If a broadcast round is currently unresolved the slot starts pending,
    /// so the new loop also winds down promptly, but it does not participate
    /// in that round's acknowledgement set.
    pub fn create_synchronizer(self: &Arc<Self>) -> Synchronizer<R> {
        let mut state = self.lock_state();
        let id = state.next_slot_id;
        state.next_slot_id += 1;

        let pending = state.round.is_some();
        state.slots.insert(id, SlotState {
            pending,
            round: None,
        });
        metrics::gauge!(RESYNC_ACTIVE_SLOTS).set(state.slots.len() as f64);

        debug!(slot = id, pending, "registered synchronizer slot");
        Synchronizer {
            controller: Arc::clone(self),
            id,
            detached: false,
        }
    }

    /// Broadcast a resync request to every currently-registered slot and wait
    /// for all of them to acknowledge. Returns the results contributed by the
    /// slots' poll-site actions (a slot that detaches or whose action fails
    /// acknowledges without contributing).
    ///
    /// Resolves immediately with an empty result set when no slots are
    /// registered. Concurrent calls serialize: a second broadcast starts only
    /// after the first has fully resolved.
    pub async fn synchronize(&self) -> Vec<R> {
        let _gate = self.round_gate.lock().await;

        let rx = {
            let mut state = self.lock_state();
            let members: HashSet<u64> = state.slots.keys().copied().collect();
            if members.is_empty() {
                debug!("resync requested with no registered slots");
                return Vec::new();
            }

            let id = state.next_round_id;
            state.next_round_id += 1;
            for slot in state.slots.values_mut() {
                slot.pending = true;
                slot.round = Some(id);
            }

            let (tx, rx) = oneshot::channel();
            debug!(round = id, slots = members.len(), "resync round started");
            state.round = Some(Round {
                id,
                remaining: members,
                results: Vec::new(),
                done_tx: Some(tx),
            });
            rx
        };
        metrics::counter!(RESYNC_ROUNDS).increment(1);

        // The sender lives in controller state until the last member acks or
        // detaches, so this only errs if the controller itself is dropped.
        rx.await.unwrap_or_default()
    }

    /// Number of currently-registered slots.
    pub fn slot_count(&self) -> usize {
        self.lock_state().slots.len()
    }
}

// Unbounded on R: everything `Synchronizer`'s Drop impl reaches lives here,
// since a Drop impl cannot carry bounds the struct definition lacks.
impl<R> WorkerController<R> {
    fn lock_state(&self) -> MutexGuard<'_, ControllerState<R>> {
        // Critical sections never await or panic mid-update; recover the
        // guard rather than propagate poisoning.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish_round_if_drained(state: &mut ControllerState<R>) {
        let drained = state
            .round
            .as_ref()
            .is_some_and(|round| round.remaining.is_empty());
        if !drained {
            return;
        }
        if let Some(mut round) = state.round.take() {
            debug!(round = round.id, acks = round.results.len(), "resync round resolved");
            if let Some(tx) = round.done_tx.take() {
                tx.send(std::mem::take(&mut round.results)).ok();
            }
        }
    }

    /// Acknowledge `slot_id` for `round_id`, contributing `result` if the
    /// slot's action succeeded.
    fn acknowledge(&self, slot_id: u64, round_id: u64, result: Option<R>) {
        let mut state = self.lock_state();
        if let Some(round) = state.round.as_mut() {
            if round.id == round_id && round.remaining.remove(&slot_id) {
                if let Some(value) = result {
                    round.results.push(value);
                }
            }
        }
        Self::finish_round_if_drained(&mut state);
    }

    fn detach_slot(&self, slot_id: u64) {
        let mut state = self.lock_state();
        state.slots.remove(&slot_id);
        metrics::gauge!(RESYNC_ACTIVE_SLOTS).set(state.slots.len() as f64);
        if let Some(round) = state.round.as_mut() {
            if round.remaining.remove(&slot_id) {
                debug!(slot = slot_id, round = round.id, "slot detached mid-broadcast");
            }
        }
        Self::finish_round_if_drained(&mut state);
    }

    /// Consume the slot's pending flag. Returns the round to acknowledge, if
    /// the slot is a member of one.
    fn take_pending(&self, slot_id: u64) -> Option<Option<u64>> {
        let mut state = self.lock_state();
        match state.slots.get_mut(&slot_id) {
            Some(slot) if slot.pending => {
                slot.pending = false;
                Some(slot.round.take())
            }
            _ => None,
        }
    }
}

/// Handle bound to one partition batch loop. Registered via
/// [`WorkerController::create_synchronizer`]; released on drop, so holding it
/// in the loop's scope satisfies the detach-on-every-exit-path contract.
pub struct Synchronizer<R = ()> {
    controller: Arc<WorkerController<R>>,
    id: u64,
    detached: bool,
}

impl<R: Send + 'static> Synchronizer<R> {
    /// Non-blocking poll for a pending resync. If one has been signaled, runs
    /// `on_synchronized` (the forced commit), acknowledges the slot, and
    /// returns `Ok(true)` — the caller should wind down its inner loop.
    /// Returns `Ok(false)` immediately otherwise.
    ///
    /// An error from `on_synchronized` propagates to the caller, but the slot
    /// is still acknowledged: a failing action cannot stall the broadcast.
    pub async fn check_synchronized<F, Fut>(&self, on_synchronized: F) -> anyhow::Result<bool>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        let Some(round) = self.controller.take_pending(self.id) else {
            return Ok(false);
        };

        let outcome = on_synchronized().await;
        match outcome {
            Ok(value) => {
                if let Some(round_id) = round {
                    self.controller.acknowledge(self.id, round_id, Some(value));
                }
                Ok(true)
            }
            Err(e) => {
                warn!(slot = self.id, error = ?e, "resync action failed; acknowledging anyway");
                if let Some(round_id) = round {
                    self.controller.acknowledge(self.id, round_id, None);
                }
                Err(e)
            }
        }
    }

    /// Unregister the slot. Equivalent to dropping the handle; provided for
    /// call sites that want the release to be explicit.
    pub fn detach(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        self.controller.detach_slot(self.id);
    }
}

impl<R> Drop for Synchronizer<R> {
    fn drop(&mut self) {
        if !self.detached {
            self.detached = true;
            self.controller.detach_slot(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test]
    async fn synchronize_with_no_slots_resolves_immediately() {
        let controller: Arc<WorkerController<u32>> = Arc::new(WorkerController::new());
        let results = controller.synchronize().await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn check_without_broadcast_returns_false() {
        let controller: Arc<WorkerController<u32>> = Arc::new(WorkerController::new());
        let sync = controller.create_synchronizer();
        let hit = sync
            .check_synchronized(|| async { Ok(7) })
            .await
            .unwrap();
        assert!(!hit);
    }

    #[tokio::test]
    async fn broadcast_collects_results_from_all_slots() {
        let controller: Arc<WorkerController<u32>> = Arc::new(WorkerController::new());

        let mut workers = Vec::new();
        for n in 0..3u32 {
            let sync = controller.create_synchronizer();
            workers.push(tokio::spawn(async move {
                loop {
                    let hit = sync
                        .check_synchronized(|| async move { Ok(n) })
                        .await
                        .unwrap();
                    if hit {
                        break;
                    }
                    sleep(Duration::from_millis(5)).await;
                }
            }));
        }

        let mut results = controller.synchronize().await;
        results.sort_unstable();
        assert_eq!(results, vec![0, 1, 2]);

        for worker in workers {
            worker.await.unwrap();
        }
        assert_eq!(controller.slot_count(), 0);
    }

    #[tokio::test]
    async fn detach_mid_broadcast_does_not_hang() {
        let controller: Arc<WorkerController<u32>> = Arc::new(WorkerController::new());
        let acking = controller.create_synchronizer();
        let leaving = controller.create_synchronizer();

        let controller_clone = controller.clone();
        let round = tokio::spawn(async move { controller_clone.synchronize().await });

        // Let the round start before slots react.
        sleep(Duration::from_millis(20)).await;

        leaving.detach();
        assert!(acking
            .check_synchronized(|| async { Ok(11) })
            .await
            .unwrap());

        let results = round.await.unwrap();
        assert_eq!(results, vec![11]);
    }

    #[tokio::test]
    async fn dropping_slot_mid_broadcast_keeps_other_results() {
        let controller: Arc<WorkerController<u32>> = Arc::new(WorkerController::new());
        let acking = controller.create_synchronizer();
        let dropped = controller.create_synchronizer();

        let controller_clone = controller.clone();
        let round = tokio::spawn(async move { controller_clone.synchronize().await });
        sleep(Duration::from_millis(20)).await;

        // Released by drop rather than an explicit detach call.
        drop(dropped);
        assert!(acking
            .check_synchronized(|| async { Ok(23) })
            .await
            .unwrap());

        let results = round.await.unwrap();
        assert_eq!(results, vec![23]);
        assert_eq!(controller.slot_count(), 1);
    }

    #[tokio::test]
    async fn dropping_all_slots_resolves_broadcast() {
        let controller: Arc<WorkerController> = Arc::new(WorkerController::new());
        let slot = controller.create_synchronizer();

        let controller_clone = controller.clone();
        let round = tokio::spawn(async move { controller_clone.synchronize().await });
        sleep(Duration::from_millis(20)).await;

        drop(slot);
        let results = round.await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn late_slot_goes_pending_but_skips_inflight_round() {
        let controller: Arc<WorkerController<u32>> = Arc::new(WorkerController::new());
        let member = controller.create_synchronizer();

        let controller_clone = controller.clone();
        let round = tokio::spawn(async move { controller_clone.synchronize().await });
        sleep(Duration::from_millis(20)).await;

        // Registered after broadcast start: pending locally, not a member.
        let late = controller.create_synchronizer();
        assert!(late
            .check_synchronized(|| async { Ok(99) })
            .await
            .unwrap());

        // Round still waits for its one member, and never sees 99.
        assert!(member
            .check_synchronized(|| async { Ok(1) })
            .await
            .unwrap());
        let results = round.await.unwrap();
        assert_eq!(results, vec![1]);
    }

    #[tokio::test]
    async fn failing_action_still_acknowledges() {
        let controller: Arc<WorkerController<u32>> = Arc::new(WorkerController::new());
        let slot = controller.create_synchronizer();

        let controller_clone = controller.clone();
        let round = tokio::spawn(async move { controller_clone.synchronize().await });
        sleep(Duration::from_millis(20)).await;

        let err = slot
            .check_synchronized(|| async { anyhow::bail!("commit failed") })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("commit failed"));

        // The broadcast resolves anyway, without the failed slot's result.
        let results = round.await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn concurrent_broadcasts_serialize() {
        let controller: Arc<WorkerController<u32>> = Arc::new(WorkerController::new());
        let sync = controller.create_synchronizer();

        let first = {
            let c = controller.clone();
            tokio::spawn(async move { c.synchronize().await })
        };
        let second = {
            let c = controller.clone();
            tokio::spawn(async move { c.synchronize().await })
        };

        // The slot acks whatever round is pending, twice.
        let poller = tokio::spawn(async move {
            let mut acks = 0u32;
            while acks < 2 {
                let hit = sync
                    .check_synchronized(|| async move { Ok(acks) })
                    .await
                    .unwrap();
                if hit {
                    acks += 1;
                }
                sleep(Duration::from_millis(5)).await;
            }
        });

        assert_eq!(first.await.unwrap().len(), 1);
        assert_eq!(second.await.unwrap().len(), 1);
        poller.await.unwrap();
    }
}
