//! Blockchain agent for an on-chain game client.
//!
//! The agent sits between game logic and a local ledger. Callers enqueue
//! actions through [`AgentHandle`]; background loops batch them into signed
//! transactions, mine blocks, reconcile which actions the chain has
//! processed, and keep the local chain in sync with peers.
//!
//! Modules are organized by responsibility:
//! - [`agent`] hosts the orchestrator and builder
//! - [`handle`] is the cloneable façade for game logic and UI
//! - [`events`] provides the topic-based event bus
//! - [`queue`] holds the action queue and the unconfirmed pool
//! - [`actions`] defines the built-in gold actions
//! - `workers` keeps the background loops internal to the crate
pub mod actions;
pub mod agent;
pub mod config;
pub mod error;
pub mod events;
pub mod handle;
pub mod metrics;
pub mod nonce;
pub mod queue;

mod context;
mod workers;

#[cfg(test)]
mod testing;

pub use actions::{
    REWARD_GOLD, RewardGold, TRANSFER_GOLD, TransferGold, default_registry, gold_balance,
    reward_gold_action, transfer_gold_payload,
};
pub use agent::{Agent, AgentBuilder};
pub use config::AgentConfig;
pub use error::{AgentError, Result};
pub use events::{
    ActionEvent, ChainEvent, DropReason, Event, EventBus, PreloadEvent, TipSnapshot, Topic,
};
pub use handle::AgentHandle;
pub use metrics::{AgentMetrics, MetricsSnapshot};
pub use queue::{ActionPool, ActionQueue};
