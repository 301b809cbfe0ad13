//! Ledger abstraction layer for the chronicle agent.
//!
//! This crate defines what the agent consumes from the outside world without
//! implementing any of it.
//!
//! # Architecture
//!
//! ```text
//! Layer 2: PeerNetwork (broadcast, preload, live sync)
//!
//! Layer 1: Ledger (stage / unstage / mine / append / query)
//!          ├── BlockPolicy      (difficulty + header validation)
//!          └── ActionEvaluator  (state transitions per action)
//!
//! Layer 0: Domain types (Address, Action, Transaction, Block, keys)
//! ```
//!
//! # Design Philosophy
//!
//! - **Layer 0**: Plain data with canonical bincode encoding and SHA-256 hashing
//! - **Layer 1**: A blocking local store; callers move long work off async tasks
//! - **Layer 2**: Async, eventually consistent, never owned by a single caller
//!
//! # Usage
//!
//! ```ignore
//! use ledger_core::{AbortSignal, Ledger, PeerNetwork};
//!
//! fn mine_once(ledger: &dyn Ledger, miner: Address) -> Result<Arc<Block>, LedgerError> {
//!     ledger.mine_block(miner, &AbortSignal::new())
//! }
//! ```

pub mod block;
pub mod crypto;
pub mod evaluation;
pub mod policy;
pub mod traits;
pub mod tx;
pub mod types;

pub use block::Block;
pub use crypto::{CryptoError, PrivateKey, PublicKey, Signature};
pub use evaluation::{
    ActionContext, ActionEvaluation, ActionEvaluator, ActionFailure, ActionHandler,
    ActionOutcome, ActionRegistry, FailureCode, StateDelta,
};
pub use policy::{BlockPolicy, DebugPolicy, DifficultyPolicy, InvalidBlock};
pub use traits::{
    AbortSignal, BlockStream, Ledger, LedgerError, PeerError, PeerNetwork, Reorganization,
};
pub use tx::{Transaction, TxId};
pub use types::{
    Action, ActionId, ActionPayload, Address, BlockDownloadState, EncodeError, HashDigest,
    PROCESSED_ACTIONS_ADDRESS, Peer, ProcessedActionSet, StateMap, StateValue, encode, sha256,
};
