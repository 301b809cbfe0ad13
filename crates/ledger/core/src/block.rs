//! Hash-linked blocks and proof-of-work hashing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tx::Transaction;
use crate::types::{Address, EncodeError, HashDigest, encode, sha256};

/// Ledger unit containing zero or more transactions.
///
/// `hash` covers every other field, so a block is immutable once accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub chain_id: Uuid,
    pub index: u64,
    pub difficulty: u64,
    /// Proof-of-work nonce
    pub nonce: u64,
    pub miner: Option<Address>,
    pub previous_hash: Option<HashDigest>,
    pub timestamp: DateTime<Utc>,
    pub transactions: Vec<Transaction>,
    pub hash: HashDigest,
}

#[derive(Serialize)]
struct BlockHeader<'a> {
    chain_id: &'a Uuid,
    index: u64,
    difficulty: u64,
    miner: &'a Option<Address>,
    previous_hash: &'a Option<HashDigest>,
    timestamp: &'a DateTime<Utc>,
    tx_ids: Vec<HashDigest>,
}

/// Header bytes without the proof-of-work nonce.
///
/// Mining hashes `prefix || nonce` repeatedly, so the prefix is encoded once.
#[derive(Debug, Clone)]
pub struct PreHash {
    prefix: Vec<u8>,
}

impl PreHash {
    pub fn hash_with_nonce(&self, nonce: u64) -> HashDigest {
        let mut bytes = Vec::with_capacity(self.prefix.len() + 8);
        bytes.extend_from_slice(&self.prefix);
        bytes.extend_from_slice(&nonce.to_le_bytes());
        sha256(&bytes)
    }
}

impl Block {
    /// Deterministic first block of the chain identified by `chain_id`.
    pub fn genesis(chain_id: Uuid) -> Result<Self, EncodeError> {
        let timestamp = DateTime::<Utc>::UNIX_EPOCH;
        let pre_hash = Self::pre_hash(chain_id, 0, 0, &None, &None, &timestamp, &[])?;
        Ok(Self {
            chain_id,
            index: 0,
            difficulty: 0,
            nonce: 0,
            miner: None,
            previous_hash: None,
            timestamp,
            transactions: Vec::new(),
            hash: pre_hash.hash_with_nonce(0),
        })
    }

    pub fn pre_hash(
        chain_id: Uuid,
        index: u64,
        difficulty: u64,
        miner: &Option<Address>,
        previous_hash: &Option<HashDigest>,
        timestamp: &DateTime<Utc>,
        transactions: &[Transaction],
    ) -> Result<PreHash, EncodeError> {
        let header = BlockHeader {
            chain_id: &chain_id,
            index,
            difficulty,
            miner,
            previous_hash,
            timestamp,
            tx_ids: transactions.iter().map(|tx| tx.id).collect(),
        };
        Ok(PreHash {
            prefix: encode(&header)?,
        })
    }

    /// Recompute the hash from the block's own fields.
    pub fn compute_hash(&self) -> Result<HashDigest, EncodeError> {
        let pre_hash = Self::pre_hash(
            self.chain_id,
            self.index,
            self.difficulty,
            &self.miner,
            &self.previous_hash,
            &self.timestamp,
            &self.transactions,
        )?;
        Ok(pre_hash.hash_with_nonce(self.nonce))
    }

    pub fn is_genesis(&self) -> bool {
        self.index == 0 && self.previous_hash.is_none()
    }
}

/// True when `hash` satisfies `difficulty` expected attempts.
///
/// The leading 128 bits of the hash, read big-endian, must not exceed
/// `u128::MAX / difficulty`. Difficulties 0 and 1 accept every hash.
pub fn meets_difficulty(hash: &HashDigest, difficulty: u64) -> bool {
    if difficulty <= 1 {
        return true;
    }
    let mut leading = [0u8; 16];
    leading.copy_from_slice(&hash.0[..16]);
    u128::from_be_bytes(leading) <= u128::MAX / u128::from(difficulty)
}
