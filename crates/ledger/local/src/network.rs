//! In-process peer network.
//!
//! A [`NetworkHub`] plays the role of the wire: every [`HubPeer`] joined to
//! the same hub sees the blocks and transactions the others broadcast, and
//! can preload history from their ledgers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use ledger_core::{
    Block, BlockDownloadState, BlockStream, Ledger, Peer, PeerError, PeerNetwork, PublicKey,
    Reorganization, Transaction,
};
use tokio::sync::{broadcast, mpsc};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

const HUB_BUFFER: usize = 256;
const SYNC_BUFFER: usize = 64;

#[derive(Clone)]
struct Envelope<T> {
    from: PublicKey,
    payload: T,
}

/// Shared medium connecting every [`HubPeer`] in the process.
pub struct NetworkHub {
    members: Mutex<HashMap<PublicKey, Arc<dyn Ledger>>>,
    blocks: broadcast::Sender<Envelope<Arc<Block>>>,
    transactions: broadcast::Sender<Envelope<Transaction>>,
}

impl NetworkHub {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(HUB_BUFFER)
    }

    /// Hub whose broadcast feeds hold up to `capacity` undelivered messages
    /// per subscriber before the slowest one starts skipping.
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        let (blocks, _) = broadcast::channel(capacity);
        let (transactions, _) = broadcast::channel(capacity);
        Arc::new(Self {
            members: Mutex::new(HashMap::new()),
            blocks,
            transactions,
        })
    }

    pub fn member_count(&self) -> usize {
        self.members().len()
    }

    fn members(&self) -> MutexGuard<'_, HashMap<PublicKey, Arc<dyn Ledger>>> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, identity: PublicKey, ledger: Arc<dyn Ledger>) {
        self.members().insert(identity, ledger);
    }

    fn unregister(&self, identity: &PublicKey) {
        self.members().remove(identity);
    }
}

/// Which remote identities a peer talks to.
#[derive(Debug, Clone)]
struct PeerFilter {
    identity: PublicKey,
    /// `None` accepts every other hub member
    allowed: Option<HashSet<PublicKey>>,
}

impl PeerFilter {
    fn accepts(&self, remote: &PublicKey) -> bool {
        *remote != self.identity
            && self
                .allowed
                .as_ref()
                .is_none_or(|allowed| allowed.contains(remote))
    }
}

/// One node's view of a [`NetworkHub`].
pub struct HubPeer {
    hub: Arc<NetworkHub>,
    filter: PeerFilter,
    dial_timeout: Duration,
    cancel: CancellationToken,
    blocks_sent: AtomicU64,
    transactions_sent: AtomicU64,
}

impl HubPeer {
    /// Join `hub` as `identity`, serving `ledger` to other peers.
    ///
    /// With an empty `peers` list every hub member is reachable; otherwise
    /// only the listed keys are. Our own key is never a peer.
    pub fn join(
        hub: Arc<NetworkHub>,
        identity: PublicKey,
        ledger: Arc<dyn Ledger>,
        peers: &[Peer],
        dial_timeout: Duration,
    ) -> Self {
        let allowed = if peers.is_empty() {
            None
        } else {
            Some(
                peers
                    .iter()
                    .filter(|peer| {
                        let is_self = peer.public_key == identity;
                        if is_self {
                            debug!("Skipping peer {} (self)", peer);
                        }
                        !is_self
                    })
                    .map(|peer| peer.public_key)
                    .collect(),
            )
        };

        hub.register(identity, ledger);
        Self {
            hub,
            filter: PeerFilter { identity, allowed },
            dial_timeout,
            cancel: CancellationToken::new(),
            blocks_sent: AtomicU64::new(0),
            transactions_sent: AtomicU64::new(0),
        }
    }

    pub fn identity(&self) -> PublicKey {
        self.filter.identity
    }

    /// Blocks this peer has broadcast so far.
    pub fn blocks_sent(&self) -> u64 {
        self.blocks_sent.load(Ordering::Relaxed)
    }

    /// Transactions this peer has broadcast so far.
    pub fn transactions_sent(&self) -> u64 {
        self.transactions_sent.load(Ordering::Relaxed)
    }

    fn reachable(&self) -> Vec<(PublicKey, Arc<dyn Ledger>)> {
        self.hub
            .members()
            .iter()
            .filter(|(key, _)| self.filter.accepts(key))
            .map(|(key, ledger)| (*key, Arc::clone(ledger)))
            .collect()
    }

    fn ensure_running(&self) -> Result<(), PeerError> {
        if self.cancel.is_cancelled() {
            Err(PeerError::Stopped)
        } else {
            Ok(())
        }
    }

    /// Run blocking ledger work on behalf of a request to `remote`, bounded
    /// by the dial timeout.
    async fn request<T, F>(&self, remote: &PublicKey, work: F) -> Result<T, PeerError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let task = tokio::task::spawn_blocking(work);
        tokio::select! {
            _ = self.cancel.cancelled() => Err(PeerError::Stopped),
            joined = tokio::time::timeout(self.dial_timeout, task) => joined
                .map_err(|_| PeerError::Timeout(remote.to_string()))?
                .map_err(|e| PeerError::Network(e.to_string())),
        }
    }
}

/// Highest index at which `remote` and `local` hold the same block, searching
/// down from `local_tip`. Genesis is assumed shared; a foreign genesis shows
/// up as an invalid block 1.
fn common_ancestor(remote: &dyn Ledger, local: &dyn Ledger, local_tip: u64) -> u64 {
    (1..=local_tip)
        .rev()
        .find(|&index| match (remote.block(index), local.block(index)) {
            (Some(theirs), Some(ours)) => theirs.hash == ours.hash,
            _ => false,
        })
        .unwrap_or(0)
}

#[async_trait]
impl PeerNetwork for HubPeer {
    async fn broadcast_blocks(&self, blocks: Vec<Arc<Block>>) -> Result<(), PeerError> {
        self.ensure_running()?;
        for block in blocks {
            trace!("Broadcasting block[{}]", block.index);
            self.blocks_sent.fetch_add(1, Ordering::Relaxed);
            // No listeners yet is not an error
            let _ = self.hub.blocks.send(Envelope {
                from: self.filter.identity,
                payload: block,
            });
        }
        Ok(())
    }

    async fn broadcast_transactions(&self, txs: Vec<Transaction>) -> Result<(), PeerError> {
        self.ensure_running()?;
        for tx in txs {
            trace!("Broadcasting tx {}", tx.id);
            self.transactions_sent.fetch_add(1, Ordering::Relaxed);
            let _ = self.hub.transactions.send(Envelope {
                from: self.filter.identity,
                payload: tx,
            });
        }
        Ok(())
    }

    async fn preload(
        &self,
        ledger: Arc<dyn Ledger>,
        progress: mpsc::UnboundedSender<BlockDownloadState>,
    ) -> Result<Option<Reorganization>, PeerError> {
        self.ensure_running()?;

        let best = self
            .reachable()
            .into_iter()
            .filter_map(|(key, source)| source.tip().map(|tip| (key, source, tip.index)))
            .max_by_key(|(_, _, index)| *index);
        let Some((key, source, target)) = best else {
            debug!("No peers to preload from");
            return Ok(None);
        };

        let local_tip = ledger.tip().map(|tip| tip.index);
        if local_tip.is_some_and(|tip| target <= tip) {
            debug!("Already at or past best peer tip {}", target);
            return Ok(None);
        }

        // With no local chain at all, everything from genesis is missing.
        let (start, forked) = match local_tip {
            Some(tip) => {
                let ancestor = {
                    let (source, ledger) = (Arc::clone(&source), Arc::clone(&ledger));
                    self.request(&key, move || {
                        common_ancestor(source.as_ref(), ledger.as_ref(), tip)
                    })
                    .await?
                };
                (ancestor + 1, ancestor < tip)
            }
            None => (0, false),
        };

        let total = target - start + 1;
        if forked {
            debug!("Peer {} forked after block {}; fetching {} block(s)", key, start - 1, total);
        } else {
            debug!("Preloading {} block(s) from {}", total, key);
        }

        let mut branch = Vec::new();
        for (received, index) in (start..=target).enumerate() {
            let fetched = {
                let source = Arc::clone(&source);
                self.request(&key, move || source.block(index)).await?
            };
            let block = fetched.ok_or_else(|| {
                PeerError::Network(format!("peer {} no longer serves block {}", key, index))
            })?;

            if forked {
                branch.push((*block).clone());
            } else {
                let ledger = Arc::clone(&ledger);
                self.request(&key, move || ledger.append_block((*block).clone()))
                    .await?
                    .map_err(|source| PeerError::Preload { index, source })?;
            }

            // The caller may stop listening; preload still completes.
            let _ = progress.send(BlockDownloadState {
                total_block_count: total,
                received_block_count: received as u64 + 1,
            });
        }

        if !forked {
            return Ok(None);
        }
        let reorganization = {
            let ledger = Arc::clone(&ledger);
            self.request(&key, move || ledger.reorganize(branch)).await?
        }
        .map_err(|source| PeerError::Preload { index: start, source })?;
        Ok(Some(reorganization))
    }

    async fn start_sync(&self, ledger: Arc<dyn Ledger>) -> Result<BlockStream, PeerError> {
        self.ensure_running()?;

        let mut blocks = self.hub.blocks.subscribe();
        let mut transactions = self.hub.transactions.subscribe();
        let (sender, receiver) = mpsc::channel(SYNC_BUFFER);
        let filter = self.filter.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sender.closed() => break,
                    received = blocks.recv() => match received {
                        Ok(envelope) if filter.accepts(&envelope.from) => {
                            if sender.send((*envelope.payload).clone()).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Block feed lagged; blocks dropped");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    received = transactions.recv() => match received {
                        Ok(envelope) if filter.accepts(&envelope.from) => {
                            let tx_id = envelope.payload.id;
                            if let Err(e) = ledger.stage_transaction(envelope.payload) {
                                debug!(tx_id = %tx_id, error = %e, "Ignored broadcast transaction");
                            }
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Transaction feed lagged; transactions dropped");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!("Sync feed for {} closed", filter.identity);
        });

        Ok(receiver)
    }

    async fn stop(&self) {
        self.cancel.cancel();
        self.hub.unregister(&self.filter.identity);
    }

    fn peer_count(&self) -> usize {
        if self.cancel.is_cancelled() {
            0
        } else {
            self.reachable().len()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LocalLedger;
    use chrono::Utc;
    use ledger_core::{AbortSignal, Action, ActionPayload, ActionRegistry, DebugPolicy, PrivateKey};
    use uuid::Uuid;

    fn ledger(chain_id: Uuid) -> Arc<LocalLedger> {
        Arc::new(
            LocalLedger::in_memory(chain_id, Arc::new(DebugPolicy), Arc::new(ActionRegistry::new()))
                .unwrap(),
        )
    }

    fn peer(key: &PrivateKey) -> Peer {
        Peer {
            public_key: key.public_key(),
            host: "localhost".into(),
            port: 31234,
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn self_is_never_a_peer() {
        let hub = NetworkHub::new();
        let chain_id = Uuid::new_v4();
        let me = PrivateKey::generate();
        let other = PrivateKey::generate();

        let local = HubPeer::join(
            hub.clone(),
            me.public_key(),
            ledger(chain_id),
            &[peer(&me), peer(&other)],
            TIMEOUT,
        );
        assert_eq!(local.peer_count(), 0);

        let _remote = HubPeer::join(hub.clone(), other.public_key(), ledger(chain_id), &[], TIMEOUT);
        assert_eq!(local.peer_count(), 1);
        assert_eq!(hub.member_count(), 2);
    }

    #[tokio::test]
    async fn preload_pulls_missing_blocks_with_progress() {
        let hub = NetworkHub::new();
        let chain_id = Uuid::new_v4();
        let miner = PrivateKey::generate();
        let source = ledger(chain_id);
        for _ in 0..3 {
            source.mine_block(miner.address(), &AbortSignal::new()).unwrap();
        }
        let _remote = HubPeer::join(hub.clone(), miner.public_key(), source.clone(), &[], TIMEOUT);

        let me = PrivateKey::generate();
        let target = ledger(chain_id);
        let local = HubPeer::join(hub, me.public_key(), target.clone(), &[], TIMEOUT);

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let reorg = local.preload(target.clone(), progress_tx).await.unwrap();

        assert!(reorg.is_none());
        assert_eq!(target.tip().unwrap().hash, source.tip().unwrap().hash);
        let mut reports = Vec::new();
        while let Ok(state) = progress_rx.try_recv() {
            reports.push(state.received_block_count);
            assert_eq!(state.total_block_count, 3);
        }
        assert_eq!(reports, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn preload_adopts_longer_fork() {
        let hub = NetworkHub::new();
        let chain_id = Uuid::new_v4();
        let miner = PrivateKey::generate();
        let source = ledger(chain_id);
        for _ in 0..3 {
            source.mine_block(miner.address(), &AbortSignal::new()).unwrap();
        }
        let _remote = HubPeer::join(hub.clone(), miner.public_key(), source.clone(), &[], TIMEOUT);

        let me = PrivateKey::generate();
        let target = ledger(chain_id);
        let ours = target.mine_block(me.address(), &AbortSignal::new()).unwrap();
        let local = HubPeer::join(hub, me.public_key(), target.clone(), &[], TIMEOUT);

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let reorg = local
            .preload(target.clone(), progress_tx)
            .await
            .unwrap()
            .expect("fork should be replaced");

        assert_eq!(reorg.common_ancestor, 0);
        assert_eq!(reorg.discarded, vec![ours]);
        assert_eq!(target.tip().unwrap().hash, source.tip().unwrap().hash);
        let mut reports = Vec::new();
        while let Ok(state) = progress_rx.try_recv() {
            reports.push(state.received_block_count);
        }
        assert_eq!(reports, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn preload_keeps_longer_local_fork() {
        let hub = NetworkHub::new();
        let chain_id = Uuid::new_v4();
        let miner = PrivateKey::generate();
        let source = ledger(chain_id);
        source.mine_block(miner.address(), &AbortSignal::new()).unwrap();
        let _remote = HubPeer::join(hub.clone(), miner.public_key(), source, &[], TIMEOUT);

        let me = PrivateKey::generate();
        let target = ledger(chain_id);
        for _ in 0..2 {
            target.mine_block(me.address(), &AbortSignal::new()).unwrap();
        }
        let tip = target.tip().unwrap();
        let local = HubPeer::join(hub, me.public_key(), target.clone(), &[], TIMEOUT);

        let (progress_tx, _progress_rx) = mpsc::unbounded_channel();
        assert!(local.preload(target.clone(), progress_tx).await.unwrap().is_none());
        assert_eq!(target.tip().unwrap(), tip);
    }

    #[tokio::test]
    async fn preload_without_peers_is_a_no_op() {
        let hub = NetworkHub::new();
        let me = PrivateKey::generate();
        let target = ledger(Uuid::new_v4());
        let local = HubPeer::join(hub, me.public_key(), target.clone(), &[], TIMEOUT);

        let (progress_tx, _progress_rx) = mpsc::unbounded_channel();
        assert!(local.preload(target.clone(), progress_tx).await.unwrap().is_none());
        assert_eq!(target.tip().unwrap().index, 0);
    }

    #[tokio::test]
    async fn preload_from_other_chain_fails() {
        let hub = NetworkHub::new();
        let miner = PrivateKey::generate();
        let source = ledger(Uuid::new_v4());
        source.mine_block(miner.address(), &AbortSignal::new()).unwrap();
        let _remote = HubPeer::join(hub.clone(), miner.public_key(), source, &[], TIMEOUT);

        let me = PrivateKey::generate();
        let target = ledger(Uuid::new_v4());
        let local = HubPeer::join(hub, me.public_key(), target.clone(), &[], TIMEOUT);

        let (progress_tx, _progress_rx) = mpsc::unbounded_channel();
        let result = local.preload(target.clone(), progress_tx).await;
        assert!(matches!(result, Err(PeerError::Preload { index: 1, .. })));
        assert_eq!(target.tip().unwrap().index, 0);
    }

    #[tokio::test]
    async fn sync_delivers_blocks_and_stages_transactions() {
        let hub = NetworkHub::new();
        let chain_id = Uuid::new_v4();
        let sender_key = PrivateKey::generate();
        let receiver_key = PrivateKey::generate();

        let sender_ledger = ledger(chain_id);
        let sender = HubPeer::join(
            hub.clone(),
            sender_key.public_key(),
            sender_ledger.clone(),
            &[],
            TIMEOUT,
        );
        let receiver_ledger = ledger(chain_id);
        let receiver = HubPeer::join(
            hub,
            receiver_key.public_key(),
            receiver_ledger.clone(),
            &[],
            TIMEOUT,
        );

        let mut stream = receiver.start_sync(receiver_ledger.clone()).await.unwrap();

        let action = Action::new(sender_key.address(), ActionPayload::new("noop", Vec::new()));
        let tx = Transaction::create(&sender_key, 0, vec![action], Utc::now()).unwrap();
        sender.broadcast_transactions(vec![tx.clone()]).await.unwrap();

        let block = sender_ledger
            .mine_block(sender_key.address(), &AbortSignal::new())
            .unwrap();
        sender.broadcast_blocks(vec![block.clone()]).await.unwrap();

        let received = tokio::time::timeout(TIMEOUT, stream.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.hash, block.hash);

        tokio::time::timeout(TIMEOUT, async {
            while receiver_ledger.staged_transactions().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(receiver_ledger.staged_transactions(), vec![tx]);
        assert_eq!(sender.blocks_sent(), 1);
        assert_eq!(sender.transactions_sent(), 1);
    }

    #[tokio::test]
    async fn stop_leaves_the_hub() {
        let hub = NetworkHub::new();
        let chain_id = Uuid::new_v4();
        let key = PrivateKey::generate();
        let local = HubPeer::join(hub.clone(), key.public_key(), ledger(chain_id), &[], TIMEOUT);

        local.stop().await;

        assert_eq!(hub.member_count(), 0);
        assert_eq!(local.peer_count(), 0);
        assert!(matches!(
            local.broadcast_blocks(Vec::new()).await,
            Err(PeerError::Stopped)
        ));
    }
}
