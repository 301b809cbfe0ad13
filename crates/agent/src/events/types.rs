//! Event types for each topic.

use ledger_core::{ActionEvaluation, ActionId, BlockDownloadState, HashDigest, TxId};
use serde::{Deserialize, Serialize};

/// Immutable view of the chain tip shared with observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TipSnapshot {
    pub hash: HashDigest,
    pub index: u64,
}

/// Initial block download lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreloadEvent {
    Started,

    /// One more block was downloaded and appended
    Processed(BlockDownloadState),

    /// Preload finished. `error` is set when it gave up early; live sync
    /// starts either way.
    Ended { error: Option<String> },
}

/// Local chain changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainEvent {
    TipChanged(TipSnapshot),

    /// This agent mined a block
    BlockMined {
        index: u64,
        difficulty: u64,
        hash: HashDigest,
    },

    /// A block received from a peer failed validation
    BlockRejected { index: u64, reason: String },

    /// A longer peer branch replaced our blocks after `common_ancestor`
    Reorganized { common_ancestor: u64, discarded: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropReason {
    /// Submitted `attempts` times without reaching the chain
    RetriesExhausted { attempts: u32 },

    /// Signed by an address other than the agent's
    ForeignSigner,
}

/// Lifecycle of actions submitted through this agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionEvent {
    TransactionStaged {
        tx_id: TxId,
        nonce: u64,
        action_ids: Vec<ActionId>,
    },

    /// One of our actions was evaluated in an accepted block
    ActionResult(ActionEvaluation),

    ActionDropped {
        action_id: ActionId,
        reason: DropReason,
    },
}
