//! In-process ledger: hash-linked chain, stage pool, proof-of-work miner, and
//! action evaluation.
//!
//! All chain state sits behind one `RwLock`. Writers (stage, unstage, append)
//! take the write lock and are therefore serialized; readers take the read
//! lock and see the state either before or after any write. Proof-of-work
//! search runs without holding the lock and commits only if the tip it built
//! on is still the tip.
//!
//! Block writers also hold a persist lock, taken before the write lock and
//! released after the block reaches the store. Blocks are therefore written
//! in commit order, while readers only ever wait for the in-memory commit.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::mem;
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use chrono::Utc;
use ledger_core::block::meets_difficulty;
use ledger_core::{
    AbortSignal, ActionContext, ActionEvaluation, ActionEvaluator, ActionOutcome, Address,
    Block, BlockPolicy, HashDigest, InvalidBlock, Ledger, LedgerError, PROCESSED_ACTIONS_ADDRESS,
    ProcessedActionSet, Reorganization, StateDelta, StateMap, Transaction, TxId,
};
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace};
use uuid::Uuid;

use crate::store::FileBlockStore;

/// How many proof-of-work attempts run between abort/tip checks.
const ABORT_CHECK_INTERVAL: u64 = 1024;

const EVALUATION_BUFFER: usize = 1024;

#[derive(Default)]
struct ChainState {
    blocks: Vec<Arc<Block>>,
    states: StateMap,
    /// Next nonce each signer must use for its next included transaction
    confirmed_nonces: HashMap<Address, u64>,
    staged: HashMap<TxId, Transaction>,
}

impl ChainState {
    fn confirmed_nonce(&self, signer: &Address) -> u64 {
        self.confirmed_nonces.get(signer).copied().unwrap_or(0)
    }

    /// Staged transactions that can be included right now: per signer, the
    /// run of nonces starting at the confirmed nonce. Ordered by signer, then
    /// nonce.
    fn includable(&self) -> Vec<Transaction> {
        let mut by_signer: BTreeMap<Address, BTreeMap<u64, &Transaction>> = BTreeMap::new();
        for tx in self.staged.values() {
            by_signer.entry(tx.signer).or_default().insert(tx.nonce, tx);
        }

        let mut selected = Vec::new();
        for (signer, txs) in by_signer {
            let mut expected = self.confirmed_nonce(&signer);
            while let Some(tx) = txs.get(&expected) {
                selected.push((*tx).clone());
                expected += 1;
            }
        }
        selected
    }
}

/// Outcome of validating and evaluating a block against a chain state,
/// ready to be committed.
struct PreparedBlock {
    block: Arc<Block>,
    states: StateMap,
    confirmed_nonces: HashMap<Address, u64>,
    evaluations: Vec<ActionEvaluation>,
}

/// Local ledger backed by memory and, optionally, a [`FileBlockStore`].
pub struct LocalLedger {
    chain_id: Uuid,
    policy: Arc<dyn BlockPolicy>,
    evaluator: Arc<dyn ActionEvaluator>,
    store: Option<FileBlockStore>,
    persisting: Mutex<()>,
    inner: RwLock<ChainState>,
    evaluations: broadcast::Sender<ActionEvaluation>,
}

impl LocalLedger {
    /// Open a ledger, replaying any blocks already in `store`.
    ///
    /// An empty store is seeded with the genesis block for `chain_id`. Stored
    /// blocks that fail validation make the ledger unusable and are reported
    /// as [`LedgerError::Store`].
    pub fn open(
        chain_id: Uuid,
        policy: Arc<dyn BlockPolicy>,
        evaluator: Arc<dyn ActionEvaluator>,
        store: Option<FileBlockStore>,
    ) -> Result<Self, LedgerError> {
        let genesis = Block::genesis(chain_id)?;
        let stored = match &store {
            Some(store) => store
                .load_all()
                .map_err(|e| LedgerError::Store(e.to_string()))?,
            None => Vec::new(),
        };

        let (evaluations, _) = broadcast::channel(EVALUATION_BUFFER);
        let ledger = Self {
            chain_id,
            policy,
            evaluator,
            store,
            persisting: Mutex::new(()),
            inner: RwLock::new(ChainState::default()),
            evaluations,
        };

        let mut stored = stored.into_iter();
        match stored.next() {
            Some(first) if first != genesis => {
                return Err(LedgerError::Store(format!(
                    "stored genesis {} does not belong to chain {}",
                    first.hash, chain_id
                )));
            }
            Some(first) => ledger.replay(first)?,
            None => {
                ledger.persist(&genesis)?;
                ledger.replay(genesis)?;
            }
        }
        for block in stored {
            let index = block.index;
            ledger.replay(block).map_err(|e| {
                LedgerError::Store(format!("stored block {} is invalid: {}", index, e))
            })?;
        }

        Ok(ledger)
    }

    /// In-memory ledger without persistence.
    pub fn in_memory(
        chain_id: Uuid,
        policy: Arc<dyn BlockPolicy>,
        evaluator: Arc<dyn ActionEvaluator>,
    ) -> Result<Self, LedgerError> {
        Self::open(chain_id, policy, evaluator, None)
    }

    fn read(&self) -> RwLockReadGuard<'_, ChainState> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ChainState> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist_lock(&self) -> MutexGuard<'_, ()> {
        self.persisting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, block: &Block) -> Result<(), LedgerError> {
        match &self.store {
            Some(store) => store
                .save(block)
                .map_err(|e| LedgerError::Store(e.to_string())),
            None => Ok(()),
        }
    }

    /// Write already committed blocks. The chain stays committed in memory
    /// when the store fails; the next open reports the gap.
    fn persist_committed(&self, blocks: &[Arc<Block>]) {
        for block in blocks {
            if let Err(e) = self.persist(block) {
                error!(index = block.index, error = %e, "Failed to persist committed block");
            }
        }
    }

    fn replay(&self, block: Block) -> Result<(), LedgerError> {
        let mut state = self.write();
        let prepared = self.prepare(&state, block)?;
        Self::commit(&mut state, prepared);
        Ok(())
    }

    /// Validate `block` against `state` and evaluate its actions without
    /// touching `state`.
    fn prepare(&self, state: &ChainState, block: Block) -> Result<PreparedBlock, LedgerError> {
        self.policy.validate_next_block(&state.blocks, &block)?;

        let mut confirmed_nonces = state.confirmed_nonces.clone();
        for tx in &block.transactions {
            if !tx.verify() {
                return Err(InvalidBlock::InvalidTransaction(format!(
                    "transaction {} failed verification",
                    tx.id
                ))
                .into());
            }
            let expected = confirmed_nonces.entry(tx.signer).or_insert(0);
            if tx.nonce != *expected {
                return Err(InvalidBlock::InvalidTransaction(format!(
                    "transaction {} from {} has nonce {}, expected {}",
                    tx.id, tx.signer, tx.nonce, expected
                ))
                .into());
            }
            *expected += 1;
        }

        let mut states = state.states.clone();
        let mut processed =
            ProcessedActionSet::from_state(states.get(&PROCESSED_ACTIONS_ADDRESS));
        let mut evaluations = Vec::new();

        for tx in &block.transactions {
            let ctx = ActionContext {
                signer: tx.signer,
                miner: block.miner,
                block_index: block.index,
            };
            for action in &tx.actions {
                // A resubmitted action may land twice; only the first counts.
                if processed.contains(&action.id) {
                    trace!(action_id = %action.id, "Skipping already processed action");
                    continue;
                }
                let result = {
                    let mut delta = StateDelta::new(&states);
                    self.evaluator
                        .evaluate(&ctx, action, &mut delta)
                        .map(|()| delta.into_updates())
                };
                let outcome = match result {
                    Ok(updates) => {
                        states.extend(updates);
                        ActionOutcome::Succeeded
                    }
                    Err(failure) => {
                        debug!(
                            action_id = %action.id,
                            code = %failure.code,
                            "Action failed during evaluation: {}",
                            failure.message
                        );
                        ActionOutcome::Failed(failure)
                    }
                };
                processed.insert(action.id);
                evaluations.push(ActionEvaluation {
                    action_id: action.id,
                    signer: action.signer,
                    type_id: action.type_id().to_string(),
                    block_index: block.index,
                    outcome,
                });
            }
        }
        if !processed.is_empty() {
            states.insert(PROCESSED_ACTIONS_ADDRESS, processed.to_state());
        }

        Ok(PreparedBlock {
            block: Arc::new(block),
            states,
            confirmed_nonces,
            evaluations,
        })
    }

    fn commit(state: &mut ChainState, prepared: PreparedBlock) -> Vec<ActionEvaluation> {
        let PreparedBlock {
            block,
            states,
            confirmed_nonces,
            evaluations,
        } = prepared;

        state.states = states;
        state.confirmed_nonces = confirmed_nonces;
        for tx in &block.transactions {
            state.staged.remove(&tx.id);
        }
        let confirmed = &state.confirmed_nonces;
        state
            .staged
            .retain(|_, tx| tx.nonce >= confirmed.get(&tx.signer).copied().unwrap_or(0));
        state.blocks.push(block);

        evaluations
    }

    /// Validate and commit `block`, then persist it with the chain unlocked.
    ///
    /// `expected_tip`, when given, must still be the tip hash at commit time.
    fn append(
        &self,
        block: Block,
        expected_tip: Option<HashDigest>,
    ) -> Result<Arc<Block>, LedgerError> {
        let _persisting = self.persist_lock();
        let (block, evaluations) = {
            let mut state = self.write();
            if expected_tip.is_some() && state.blocks.last().map(|b| b.hash) != expected_tip {
                return Err(LedgerError::TipChanged(block.index));
            }
            let prepared = self.prepare(&state, block)?;
            let block = Arc::clone(&prepared.block);
            (block, Self::commit(&mut state, prepared))
        };
        self.publish(evaluations);
        self.persist_committed(std::slice::from_ref(&block));
        Ok(block)
    }

    fn publish(&self, evaluations: Vec<ActionEvaluation>) {
        for evaluation in evaluations {
            // No subscribers is normal
            let _ = self.evaluations.send(evaluation);
        }
    }
}

impl Ledger for LocalLedger {
    fn chain_id(&self) -> Uuid {
        self.chain_id
    }

    fn tip(&self) -> Option<Arc<Block>> {
        self.read().blocks.last().cloned()
    }

    fn block(&self, index: u64) -> Option<Arc<Block>> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.read().blocks.get(i).cloned())
    }

    fn blocks_since(&self, from: u64) -> Vec<Arc<Block>> {
        let state = self.read();
        let start = usize::try_from(from).unwrap_or(usize::MAX).min(state.blocks.len());
        state.blocks[start..].to_vec()
    }

    fn stage_transaction(&self, tx: Transaction) -> Result<(), LedgerError> {
        if !tx.verify() {
            return Err(LedgerError::InvalidTransaction(tx.id));
        }

        let mut state = self.write();
        if state.staged.contains_key(&tx.id) {
            return Err(LedgerError::AlreadyStaged(tx.id));
        }
        let expected = state.confirmed_nonce(&tx.signer);
        if tx.nonce < expected {
            return Err(LedgerError::StaleNonce {
                signer: tx.signer,
                expected,
                actual: tx.nonce,
            });
        }

        trace!(tx_id = %tx.id, nonce = tx.nonce, "Staged transaction");
        state.staged.insert(tx.id, tx);
        Ok(())
    }

    fn unstage_transaction(&self, tx_id: &TxId) -> Option<Transaction> {
        self.write().staged.remove(tx_id)
    }

    fn staged_transactions(&self) -> Vec<Transaction> {
        let mut txs: Vec<Transaction> = self.read().staged.values().cloned().collect();
        txs.sort_by(|a, b| (a.signer, a.nonce).cmp(&(b.signer, b.nonce)));
        txs
    }

    fn next_nonce(&self, signer: &Address) -> u64 {
        let state = self.read();
        let mut next = state.confirmed_nonce(signer);
        while state
            .staged
            .values()
            .any(|tx| tx.signer == *signer && tx.nonce == next)
        {
            next += 1;
        }
        next
    }

    fn mine_block(&self, miner: Address, abort: &AbortSignal) -> Result<Arc<Block>, LedgerError> {
        let (tip, difficulty, transactions) = {
            let state = self.read();
            let tip = state
                .blocks
                .last()
                .cloned()
                .ok_or_else(|| LedgerError::Store("ledger has no genesis block".into()))?;
            let difficulty = self.policy.next_difficulty(&state.blocks);
            (tip, difficulty, state.includable())
        };

        let index = tip.index + 1;
        let miner = Some(miner);
        let previous_hash = Some(tip.hash);
        let timestamp = Utc::now().max(tip.timestamp);
        let pre_hash = Block::pre_hash(
            self.chain_id,
            index,
            difficulty,
            &miner,
            &previous_hash,
            &timestamp,
            &transactions,
        )?;

        let mut nonce: u64 = 0;
        let hash = loop {
            let hash = pre_hash.hash_with_nonce(nonce);
            if meets_difficulty(&hash, difficulty) {
                break hash;
            }
            nonce = nonce.wrapping_add(1);
            if nonce % ABORT_CHECK_INTERVAL == 0 {
                if abort.is_aborted() {
                    return Err(LedgerError::MiningAborted);
                }
                if self.read().blocks.last().map(|b| b.hash) != previous_hash {
                    return Err(LedgerError::TipChanged(index));
                }
            }
        };

        if abort.is_aborted() {
            return Err(LedgerError::MiningAborted);
        }

        let block = Block {
            chain_id: self.chain_id,
            index,
            difficulty,
            nonce,
            miner,
            previous_hash,
            timestamp,
            transactions,
            hash,
        };

        let block = self.append(block, previous_hash)?;
        debug!(index = block.index, difficulty = block.difficulty, "Mined block");
        Ok(block)
    }

    fn append_block(&self, block: Block) -> Result<Arc<Block>, LedgerError> {
        self.append(block, None)
    }

    /// Rebuilds the state by replaying the kept prefix, then the branch, on
    /// a scratch copy; the live chain is swapped only when all of it passes.
    fn reorganize(&self, branch: Vec<Block>) -> Result<Reorganization, LedgerError> {
        let _persisting = self.persist_lock();
        let (reorganization, adopted, evaluations) = {
            let mut state = self.write();
            let local_tip = state.blocks.last().map(|b| b.index).unwrap_or(0);
            let branch_tip = branch.last().map(|b| b.index).unwrap_or(local_tip);
            if branch_tip <= local_tip {
                return Err(LedgerError::ShorterBranch {
                    local_tip,
                    branch_tip,
                });
            }

            let first = branch
                .first()
                .ok_or(LedgerError::ShorterBranch { local_tip, branch_tip })?;
            let fork = first.index;
            let ancestor = fork
                .checked_sub(1)
                .and_then(|i| usize::try_from(i).ok())
                .filter(|&i| {
                    state
                        .blocks
                        .get(i)
                        .is_some_and(|b| Some(b.hash) == first.previous_hash)
                })
                .ok_or(LedgerError::DetachedBranch { index: fork })?;

            let mut rebuilt = ChainState::default();
            for block in &state.blocks[..=ancestor] {
                let prepared = self.prepare(&rebuilt, (**block).clone())?;
                Self::commit(&mut rebuilt, prepared);
            }
            let mut evaluations = Vec::new();
            for block in branch {
                let prepared = self.prepare(&rebuilt, block)?;
                evaluations.extend(Self::commit(&mut rebuilt, prepared));
            }

            let adopted = rebuilt.blocks[ancestor + 1..].to_vec();
            let included: HashSet<TxId> = adopted
                .iter()
                .flat_map(|block| block.transactions.iter().map(|tx| tx.id))
                .collect();

            rebuilt.staged = mem::take(&mut state.staged);
            let confirmed = &rebuilt.confirmed_nonces;
            rebuilt.staged.retain(|id, tx| {
                !included.contains(id)
                    && tx.nonce >= confirmed.get(&tx.signer).copied().unwrap_or(0)
            });

            let previous = mem::replace(&mut *state, rebuilt);
            let discarded = previous.blocks[ancestor + 1..].to_vec();
            let orphaned = discarded
                .iter()
                .flat_map(|block| block.transactions.iter())
                .filter(|tx| !included.contains(&tx.id))
                .cloned()
                .collect();

            let reorganization = Reorganization {
                common_ancestor: ancestor as u64,
                discarded,
                orphaned,
            };
            (reorganization, adopted, evaluations)
        };

        info!(
            common_ancestor = reorganization.common_ancestor,
            discarded = reorganization.discarded.len(),
            adopted = adopted.len(),
            "Switched to longer branch"
        );
        self.publish(evaluations);
        self.persist_committed(&adopted);
        Ok(reorganization)
    }

    fn get_states(&self, addresses: &[Address]) -> Result<StateMap, LedgerError> {
        let state = self.read();
        Ok(addresses
            .iter()
            .filter_map(|address| {
                state
                    .states
                    .get(address)
                    .map(|value| (*address, value.clone()))
            })
            .collect())
    }

    fn subscribe_evaluations(&self) -> broadcast::Receiver<ActionEvaluation> {
        self.evaluations.subscribe()
    }
}
