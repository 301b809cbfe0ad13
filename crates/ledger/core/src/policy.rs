//! Block acceptance rules.
//!
//! A policy decides the difficulty the next block must carry and whether a
//! candidate block may extend a chain. Transaction-level checks (signatures,
//! nonce continuity) belong to the ledger, which knows account state.

use std::sync::Arc;
use std::time::Duration;

use crate::block::{Block, meets_difficulty};
use crate::types::HashDigest;

/// Reasons a block is refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidBlock {
    #[error("block belongs to chain {actual}, expected {expected}")]
    ChainIdMismatch {
        expected: uuid::Uuid,
        actual: uuid::Uuid,
    },

    #[error("block index {actual} does not follow tip (expected {expected})")]
    IndexMismatch { expected: u64, actual: u64 },

    #[error("previous hash {actual:?} does not match tip {expected:?}")]
    PreviousHashMismatch {
        expected: Option<HashDigest>,
        actual: Option<HashDigest>,
    },

    #[error("block hash does not match its contents")]
    HashMismatch,

    #[error("block difficulty {actual} does not match expected {expected}")]
    DifficultyMismatch { expected: u64, actual: u64 },

    #[error("block hash does not satisfy difficulty {0}")]
    InsufficientProof(u64),

    #[error("block timestamp precedes its predecessor")]
    TimestampRegression,

    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),
}

/// Policy consulted by the ledger for every appended block.
pub trait BlockPolicy: Send + Sync {
    /// Difficulty the block following `chain` must carry.
    fn next_difficulty(&self, chain: &[Arc<Block>]) -> u64;

    /// Validate `next` as the successor of `chain`.
    fn validate_next_block(&self, chain: &[Arc<Block>], next: &Block) -> Result<(), InvalidBlock> {
        validate_links(chain, next)?;

        let expected = self.next_difficulty(chain);
        if next.difficulty != expected {
            return Err(InvalidBlock::DifficultyMismatch {
                expected,
                actual: next.difficulty,
            });
        }
        if !meets_difficulty(&next.hash, next.difficulty) {
            return Err(InvalidBlock::InsufficientProof(next.difficulty));
        }
        Ok(())
    }
}

/// Index continuity, predecessor hash, content hash, and timestamp order.
pub fn validate_links(chain: &[Arc<Block>], next: &Block) -> Result<(), InvalidBlock> {
    let tip = chain.last();

    let expected_index = tip.map(|b| b.index + 1).unwrap_or(0);
    if next.index != expected_index {
        return Err(InvalidBlock::IndexMismatch {
            expected: expected_index,
            actual: next.index,
        });
    }

    if let Some(tip) = tip
        && next.chain_id != tip.chain_id
    {
        return Err(InvalidBlock::ChainIdMismatch {
            expected: tip.chain_id,
            actual: next.chain_id,
        });
    }

    // A block from another branch is told apart before its timestamp is
    // compared against a predecessor it does not have.
    let expected_previous = tip.map(|b| b.hash);
    if next.previous_hash != expected_previous {
        return Err(InvalidBlock::PreviousHashMismatch {
            expected: expected_previous,
            actual: next.previous_hash,
        });
    }

    if tip.is_some_and(|tip| next.timestamp < tip.timestamp) {
        return Err(InvalidBlock::TimestampRegression);
    }

    match next.compute_hash() {
        Ok(hash) if hash == next.hash => Ok(()),
        _ => Err(InvalidBlock::HashMismatch),
    }
}

/// Production policy: difficulty tracks a target block interval.
///
/// Each block moves difficulty by `previous / bound_divisor` scaled by how far
/// the last interval was from the target, never below `minimum_difficulty`.
#[derive(Debug, Clone)]
pub struct DifficultyPolicy {
    pub block_interval: Duration,
    pub minimum_difficulty: u64,
    pub difficulty_bound_divisor: u64,
}

impl DifficultyPolicy {
    pub fn new(block_interval: Duration) -> Self {
        Self {
            block_interval,
            minimum_difficulty: 0x2000,
            difficulty_bound_divisor: 256,
        }
    }
}

impl Default for DifficultyPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl BlockPolicy for DifficultyPolicy {
    fn next_difficulty(&self, chain: &[Arc<Block>]) -> u64 {
        match chain {
            [] => 0,
            [_genesis] => self.minimum_difficulty,
            [.., before, previous] => {
                let interval_ms = self.block_interval.as_millis().max(1) as i128;
                let elapsed_ms = (previous.timestamp - before.timestamp)
                    .num_milliseconds()
                    .max(0) as i128;

                let offset = i128::from(previous.difficulty / self.difficulty_bound_divisor.max(1));
                let multiplier = (1 - elapsed_ms / interval_ms).max(-99);
                let next = i128::from(previous.difficulty) + offset * multiplier;

                next.clamp(
                    i128::from(self.minimum_difficulty),
                    i128::from(u64::MAX),
                ) as u64
            }
        }
    }
}

/// Development policy: every well-linked block is valid at difficulty 1.
#[derive(Debug, Clone, Default)]
pub struct DebugPolicy;

impl BlockPolicy for DebugPolicy {
    fn next_difficulty(&self, chain: &[Arc<Block>]) -> u64 {
        if chain.is_empty() { 0 } else { 1 }
    }
}
