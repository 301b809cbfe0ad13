//! Pending work: the action queue and the unconfirmed-action pool.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ledger_core::{Action, ActionId, ProcessedActionSet};
use tokio::time::Instant;

/// Unbounded FIFO of actions waiting for the next staging cycle.
///
/// Cloning shares the queue. `enqueue` never blocks on anything but the
/// brief internal lock.
#[derive(Debug, Clone, Default)]
pub struct ActionQueue {
    inner: Arc<Mutex<VecDeque<Action>>>,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Action>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueue(&self, action: Action) {
        self.lock().push_back(action);
    }

    /// Remove and return everything queued, oldest first.
    pub fn drain_all(&self) -> Vec<Action> {
        self.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[derive(Debug, Clone)]
struct PendingAction {
    action: Action,
    attempts: u32,
    last_submitted: Instant,
}

/// What a reconciliation pass decided for the pool.
#[derive(Debug, Default)]
pub struct Reconciliation {
    /// Found in the processed set and removed from the pool
    pub confirmed: Vec<ActionId>,
    /// Unconfirmed past the retry interval; to be queued again
    pub requeue: Vec<Action>,
    /// Unconfirmed after the last allowed attempt; removed from the pool
    pub exhausted: Vec<(Action, u32)>,
}

/// Actions submitted in a transaction but not yet seen in the processed set.
#[derive(Debug, Default)]
pub struct ActionPool {
    pending: Mutex<Vec<PendingAction>>,
}

impl ActionPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PendingAction>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Note a submission of each action at `now`.
    pub fn record_submitted(&self, actions: &[Action], now: Instant) {
        let mut pending = self.lock();
        for action in actions {
            match pending.iter_mut().find(|p| p.action.id == action.id) {
                Some(entry) => {
                    entry.attempts += 1;
                    entry.last_submitted = now;
                }
                None => pending.push(PendingAction {
                    action: action.clone(),
                    attempts: 1,
                    last_submitted: now,
                }),
            }
        }
    }

    /// Track `actions` again after the block that confirmed them was
    /// discarded. Actions still pending keep their attempt count.
    pub fn restore(&self, actions: &[Action], now: Instant) {
        let mut pending = self.lock();
        for action in actions {
            if !pending.iter().any(|p| p.action.id == action.id) {
                pending.push(PendingAction {
                    action: action.clone(),
                    attempts: 1,
                    last_submitted: now,
                });
            }
        }
    }

    /// Settle the pool against the chain's processed set.
    ///
    /// Confirmed actions leave the pool. An unconfirmed action is retried
    /// only once its last submission is at least `retry_after` old, and
    /// dropped instead when it has already been submitted `max_attempts`
    /// times. Retried actions stay in the pool until confirmed or dropped.
    pub fn reconcile(
        &self,
        processed: &ProcessedActionSet,
        now: Instant,
        retry_after: Duration,
        max_attempts: u32,
    ) -> Reconciliation {
        let mut outcome = Reconciliation::default();
        self.lock().retain_mut(|entry| {
            if processed.contains(&entry.action.id) {
                outcome.confirmed.push(entry.action.id);
                return false;
            }
            if now.saturating_duration_since(entry.last_submitted) < retry_after {
                return true;
            }
            if entry.attempts >= max_attempts {
                outcome.exhausted.push((entry.action.clone(), entry.attempts));
                return false;
            }
            entry.last_submitted = now;
            outcome.requeue.push(entry.action.clone());
            true
        });
        outcome
    }

    pub fn contains(&self, id: &ActionId) -> bool {
        self.lock().iter().any(|p| p.action.id == *id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
