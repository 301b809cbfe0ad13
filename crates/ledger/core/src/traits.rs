//! Collaborator traits consumed by the agent.
//!
//! - [`Ledger`]: local append-only store (blocking, shared by every loop)
//! - [`PeerNetwork`]: eventually consistent peer set (async)

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::block::Block;
use crate::evaluation::ActionEvaluation;
use crate::policy::InvalidBlock;
use crate::tx::{Transaction, TxId};
use crate::types::{Address, BlockDownloadState, EncodeError, StateMap};

// ============================================================================
// Error Types
// ============================================================================

/// Ledger errors.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("invalid block: {0}")]
    InvalidBlock(#[from] InvalidBlock),

    #[error("transaction {0} failed verification")]
    InvalidTransaction(TxId),

    #[error("transaction {0} is already staged")]
    AlreadyStaged(TxId),

    #[error("nonce {actual} for {signer} is stale (next confirmed nonce is {expected})")]
    StaleNonce {
        signer: Address,
        expected: u64,
        actual: u64,
    },

    #[error("mining aborted")]
    MiningAborted,

    #[error("tip moved while mining on block {0}")]
    TipChanged(u64),

    #[error("branch starting at block {index} does not attach to the local chain")]
    DetachedBranch { index: u64 },

    #[error("branch ending at block {branch_tip} is not longer than local tip {local_tip}")]
    ShorterBranch { local_tip: u64, branch_tip: u64 },

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("store error: {0}")]
    Store(String),
}

/// Peer network errors.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("peer {0} timed out")]
    Timeout(String),

    #[error("peer network stopped")]
    Stopped,

    #[error("preload aborted at block {index}: {source}")]
    Preload {
        index: u64,
        #[source]
        source: LedgerError,
    },

    #[error("network error: {0}")]
    Network(String),
}

// ============================================================================
// Cancellation
// ============================================================================

/// Shared flag that asks an in-flight `mine_block` to give up.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    flag: Arc<AtomicBool>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

// ============================================================================
// Ledger
// ============================================================================

/// What replacing the local chain's tail with a longer branch changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reorganization {
    /// Index of the last block both chains share
    pub common_ancestor: u64,
    /// Blocks removed from the local chain, oldest first
    pub discarded: Vec<Arc<Block>>,
    /// Transactions from discarded blocks that the new branch does not
    /// include, in chain order. They are not staged again.
    pub orphaned: Vec<Transaction>,
}

/// Local append-only blockchain store.
///
/// Implementations serialize writes (staging, block append) and let reads
/// proceed concurrently; a reader observes either the pre- or post-write
/// state, never a torn one. Methods block, so async callers should use
/// `spawn_blocking` for anything that can take long (mining, bulk queries).
pub trait Ledger: Send + Sync {
    fn chain_id(&self) -> Uuid;

    /// Highest-index block accepted locally.
    fn tip(&self) -> Option<Arc<Block>>;

    fn block(&self, index: u64) -> Option<Arc<Block>>;

    /// Blocks with `index >= from`, in order.
    fn blocks_since(&self, from: u64) -> Vec<Arc<Block>>;

    /// Mark `tx` as pending inclusion.
    fn stage_transaction(&self, tx: Transaction) -> Result<(), LedgerError>;

    /// Remove a staged transaction. Returns it if it was staged.
    fn unstage_transaction(&self, tx_id: &TxId) -> Option<Transaction>;

    fn staged_transactions(&self) -> Vec<Transaction>;

    /// Next nonce for `signer`, counting confirmed and contiguously staged
    /// transactions.
    fn next_nonce(&self, signer: &Address) -> u64;

    /// Build a block from staged transactions on top of the current tip,
    /// search its proof of work, and append it.
    ///
    /// Nothing is committed unless the whole block is; aborting or losing the
    /// race against another block leaves the chain untouched.
    fn mine_block(&self, miner: Address, abort: &AbortSignal) -> Result<Arc<Block>, LedgerError>;

    /// Validate and append a block received from elsewhere.
    fn append_block(&self, block: Block) -> Result<Arc<Block>, LedgerError>;

    /// Replace every block after `branch[0].index - 1` with `branch`.
    ///
    /// The branch must attach to a block we hold and end above the current
    /// tip; on any error the chain is left untouched. Staged transactions
    /// the branch includes, or whose nonces it makes stale, are unstaged.
    fn reorganize(&self, branch: Vec<Block>) -> Result<Reorganization, LedgerError>;

    /// Values at `addresses` as of the tip. Addresses with no value are absent.
    fn get_states(&self, addresses: &[Address]) -> Result<StateMap, LedgerError>;

    /// Stream of evaluation results for every action in accepted blocks.
    fn subscribe_evaluations(&self) -> broadcast::Receiver<ActionEvaluation>;
}

// ============================================================================
// Peer Network
// ============================================================================

/// Blocks announced by peers, in arrival order.
pub type BlockStream = mpsc::Receiver<Block>;

/// Peer-to-peer transport for blocks and transactions.
#[async_trait]
pub trait PeerNetwork: Send + Sync {
    async fn broadcast_blocks(&self, blocks: Vec<Arc<Block>>) -> Result<(), PeerError>;

    async fn broadcast_transactions(&self, txs: Vec<Transaction>) -> Result<(), PeerError>;

    /// Download the blocks the best peer has and we lack, reporting progress
    /// per block.
    ///
    /// A peer chain that forked from ours is adopted only when it is longer;
    /// the returned [`Reorganization`] describes what was replaced.
    async fn preload(
        &self,
        ledger: Arc<dyn Ledger>,
        progress: mpsc::UnboundedSender<BlockDownloadState>,
    ) -> Result<Option<Reorganization>, PeerError>;

    /// Begin receiving live broadcasts. Transactions are staged into `ledger`
    /// directly; blocks are handed to the caller for validation.
    async fn start_sync(&self, ledger: Arc<dyn Ledger>) -> Result<BlockStream, PeerError>;

    /// Disconnect from every peer.
    async fn stop(&self);

    fn peer_count(&self) -> usize;
}
