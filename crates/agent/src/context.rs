//! State shared by the agent's loops and handles.

use std::sync::Arc;

use ledger_core::{Address, Ledger, PeerNetwork, PrivateKey};
use tokio::sync::watch;

use crate::config::AgentConfig;
use crate::events::{ChainEvent, EventBus, TipSnapshot};
use crate::metrics::AgentMetrics;
use crate::nonce::NonceAuthority;
use crate::queue::{ActionPool, ActionQueue};

/// Everything one agent instance owns, handed to each component at
/// construction.
pub(crate) struct AgentContext {
    pub ledger: Arc<dyn Ledger>,
    pub network: Arc<dyn PeerNetwork>,
    pub key: PrivateKey,
    pub address: Address,
    pub queue: ActionQueue,
    pub pool: ActionPool,
    pub nonces: NonceAuthority,
    pub events: EventBus,
    pub metrics: AgentMetrics,
    pub config: AgentConfig,
    tip: watch::Sender<Option<TipSnapshot>>,
    /// Flipped once the first preload has ended
    preloaded: watch::Sender<bool>,
}

impl AgentContext {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        network: Arc<dyn PeerNetwork>,
        key: PrivateKey,
        config: AgentConfig,
    ) -> Self {
        let tip = ledger.tip().map(|block| TipSnapshot {
            hash: block.hash,
            index: block.index,
        });
        let (tip, _) = watch::channel(tip);
        let (preloaded, _) = watch::channel(false);

        Self {
            address: key.address(),
            ledger,
            network,
            key,
            queue: ActionQueue::new(),
            pool: ActionPool::new(),
            nonces: NonceAuthority::new(),
            events: EventBus::with_capacity(config.event_buffer_size),
            metrics: AgentMetrics::new(),
            config,
            tip,
            preloaded,
        }
    }

    pub fn tip(&self) -> Option<TipSnapshot> {
        *self.tip.borrow()
    }

    pub fn watch_tip(&self) -> watch::Receiver<Option<TipSnapshot>> {
        self.tip.subscribe()
    }

    pub fn mark_preloaded(&self) {
        self.preloaded.send_replace(true);
    }

    /// Resolves once preload has ended, successfully or not.
    pub async fn wait_preloaded(&self) {
        let mut preloaded = self.preloaded.subscribe();
        // The sender lives as long as `self`, so this cannot observe a close.
        let _ = preloaded.wait_for(|done| *done).await;
    }

    /// Re-read the ledger tip and announce it if it moved.
    pub fn refresh_tip(&self) {
        let current = self.ledger.tip().map(|block| TipSnapshot {
            hash: block.hash,
            index: block.index,
        });
        let changed = self.tip.send_if_modified(|tip| {
            if *tip == current {
                false
            } else {
                *tip = current;
                true
            }
        });
        if changed && let Some(snapshot) = current {
            self.events.publish(ChainEvent::TipChanged(snapshot));
        }
    }
}
