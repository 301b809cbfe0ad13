//! Cloneable façade for game logic and UI.
//!
//! [`AgentHandle`] never blocks the caller: enqueueing is a queue push, and
//! state queries run on the blocking pool.

use std::collections::HashMap;
use std::sync::Arc;

use ledger_core::{Action, ActionId, ActionPayload, Address, StateValue};
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use crate::context::AgentContext;
use crate::error::{AgentError, Result};
use crate::events::{Event, TipSnapshot, Topic};
use crate::metrics::MetricsSnapshot;

/// Client-facing handle to a running (or not yet started) agent
#[derive(Clone)]
pub struct AgentHandle {
    ctx: Arc<AgentContext>,
}

impl AgentHandle {
    pub(crate) fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }

    /// Queue `action` for the next staging cycle.
    pub fn enqueue_action(&self, action: Action) {
        self.ctx.queue.enqueue(action);
    }

    /// Sign `payload` as this agent and queue it. Returns the new action's id.
    pub fn new_action(&self, payload: ActionPayload) -> ActionId {
        let action = Action::new(self.ctx.address, payload);
        let id = action.id;
        self.enqueue_action(action);
        id
    }

    /// Value stored at `address` as of the tip, or `None` if there is none.
    pub async fn get_state(&self, address: Address) -> Result<Option<StateValue>> {
        let mut states = self.get_state_bulk(vec![address]).await?;
        Ok(states.remove(&address).flatten())
    }

    /// Values stored at `addresses`; every requested address is present in
    /// the result, absent values as `None`.
    pub async fn get_state_bulk(
        &self,
        addresses: Vec<Address>,
    ) -> Result<HashMap<Address, Option<StateValue>>> {
        let ledger = Arc::clone(&self.ctx.ledger);
        let query = addresses.clone();
        let found = tokio::task::spawn_blocking(move || ledger.get_states(&query))
            .await
            .map_err(AgentError::WorkerJoin)??;

        Ok(addresses
            .into_iter()
            .map(|address| (address, found.get(&address).cloned()))
            .collect())
    }

    pub fn chain_id(&self) -> Uuid {
        self.ctx.ledger.chain_id()
    }

    pub fn address(&self) -> Address {
        self.ctx.address
    }

    pub fn tip(&self) -> Option<TipSnapshot> {
        self.ctx.tip()
    }

    /// Observe tip changes; the receiver always holds the latest snapshot.
    pub fn watch_tip(&self) -> watch::Receiver<Option<TipSnapshot>> {
        self.ctx.watch_tip()
    }

    /// Subscribe to events from a specific topic
    ///
    /// # Topics
    ///
    /// - `Topic::Preload` - `PreloadStarted`, `PreloadProcessed`, `PreloadEnded`
    /// - `Topic::Chain` - tip changes, mined and rejected blocks
    /// - `Topic::Action` - staged transactions, action results, dropped actions
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// use agent::Topic;
    ///
    /// let mut preload = handle.subscribe(Topic::Preload);
    /// while let Ok(event) = preload.recv().await {
    ///     // Drive a progress bar
    /// }
    /// ```
    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<Event> {
        self.ctx.events.subscribe(topic)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.ctx.metrics.snapshot()
    }

    /// Actions waiting for the next staging cycle.
    pub fn queued_actions(&self) -> usize {
        self.ctx.queue.len()
    }

    /// Actions submitted but not yet confirmed or dropped.
    pub fn unconfirmed_actions(&self) -> usize {
        self.ctx.pool.len()
    }
}
