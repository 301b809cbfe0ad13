//! Test fixtures: a ledger wrapper with failure switches and a wired node.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use ledger_core::{
    AbortSignal, Action, ActionEvaluation, Address, Block, DebugPolicy, Ledger, LedgerError,
    PrivateKey, Reorganization, StateMap, Transaction, TxId,
};
use ledger_local::{HubPeer, LocalLedger, NetworkHub};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::actions::{default_registry, reward_gold_action};
use crate::config::AgentConfig;
use crate::context::AgentContext;

/// [`LocalLedger`] that counts state queries and fails on demand.
pub(crate) struct TestLedger {
    inner: LocalLedger,
    get_states_calls: AtomicUsize,
    fail_staging: AtomicBool,
    fail_mining: AtomicBool,
    fail_queries: AtomicBool,
    append_thread: Mutex<Option<ThreadId>>,
}

impl TestLedger {
    pub fn new(chain_id: Uuid) -> Self {
        let inner = LocalLedger::in_memory(chain_id, Arc::new(DebugPolicy), Arc::new(default_registry()))
            .unwrap();
        Self {
            inner,
            get_states_calls: AtomicUsize::new(0),
            fail_staging: AtomicBool::new(false),
            fail_mining: AtomicBool::new(false),
            fail_queries: AtomicBool::new(false),
            append_thread: Mutex::new(None),
        }
    }

    pub fn get_states_calls(&self) -> usize {
        self.get_states_calls.load(Ordering::SeqCst)
    }

    /// Thread the last `append_block` ran on.
    pub fn append_thread(&self) -> Option<ThreadId> {
        *self.append_thread.lock().unwrap()
    }

    pub fn fail_staging(&self, fail: bool) {
        self.fail_staging.store(fail, Ordering::SeqCst);
    }

    pub fn fail_mining(&self, fail: bool) {
        self.fail_mining.store(fail, Ordering::SeqCst);
    }

    pub fn fail_queries(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::SeqCst);
    }
}

impl Ledger for TestLedger {
    fn chain_id(&self) -> Uuid {
        self.inner.chain_id()
    }

    fn tip(&self) -> Option<Arc<Block>> {
        self.inner.tip()
    }

    fn block(&self, index: u64) -> Option<Arc<Block>> {
        self.inner.block(index)
    }

    fn blocks_since(&self, from: u64) -> Vec<Arc<Block>> {
        self.inner.blocks_since(from)
    }

    fn stage_transaction(&self, tx: Transaction) -> Result<(), LedgerError> {
        if self.fail_staging.load(Ordering::SeqCst) {
            return Err(LedgerError::Store("staging disabled".into()));
        }
        self.inner.stage_transaction(tx)
    }

    fn unstage_transaction(&self, tx_id: &TxId) -> Option<Transaction> {
        self.inner.unstage_transaction(tx_id)
    }

    fn staged_transactions(&self) -> Vec<Transaction> {
        self.inner.staged_transactions()
    }

    fn next_nonce(&self, signer: &Address) -> u64 {
        self.inner.next_nonce(signer)
    }

    fn mine_block(&self, miner: Address, abort: &AbortSignal) -> Result<Arc<Block>, LedgerError> {
        if self.fail_mining.load(Ordering::SeqCst) {
            return Err(LedgerError::Store("mining disabled".into()));
        }
        self.inner.mine_block(miner, abort)
    }

    fn append_block(&self, block: Block) -> Result<Arc<Block>, LedgerError> {
        *self.append_thread.lock().unwrap() = Some(thread::current().id());
        self.inner.append_block(block)
    }

    fn reorganize(&self, branch: Vec<Block>) -> Result<Reorganization, LedgerError> {
        self.inner.reorganize(branch)
    }

    fn get_states(&self, addresses: &[Address]) -> Result<StateMap, LedgerError> {
        self.get_states_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(LedgerError::Store("queries disabled".into()));
        }
        self.inner.get_states(addresses)
    }

    fn subscribe_evaluations(&self) -> broadcast::Receiver<ActionEvaluation> {
        self.inner.subscribe_evaluations()
    }
}

/// One agent's collaborators joined to its own hub.
pub(crate) struct TestNode {
    pub ctx: Arc<AgentContext>,
    pub ledger: Arc<TestLedger>,
    pub peer: Arc<HubPeer>,
    pub hub: Arc<NetworkHub>,
}

impl TestNode {
    pub fn new() -> Self {
        Self::with_config(AgentConfig::default())
    }

    pub fn with_config(config: AgentConfig) -> Self {
        Self::join(NetworkHub::new(), Uuid::new_v4(), config)
    }

    /// Node on `hub` sharing its chain with every other node built on `chain_id`.
    pub fn join(hub: Arc<NetworkHub>, chain_id: Uuid, config: AgentConfig) -> Self {
        let key = PrivateKey::generate();
        let ledger = Arc::new(TestLedger::new(chain_id));
        let peer = Arc::new(HubPeer::join(
            hub.clone(),
            key.public_key(),
            ledger.clone(),
            &[],
            Duration::from_secs(5),
        ));
        let ctx = Arc::new(AgentContext::new(ledger.clone(), peer.clone(), key, config));
        Self {
            ctx,
            ledger,
            peer,
            hub,
        }
    }

    /// A valid action signed for this node.
    pub fn action(&self) -> Action {
        reward_gold_action(self.ctx.address, 1).unwrap()
    }
}
