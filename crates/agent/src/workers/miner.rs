//! Continuous mining loop.
//!
//! ```text
//! Idle -> Staging -> Mining -> Broadcasting -> Idle
//!                       \
//!                        -> Rollback -> Idle
//! ```
//!
//! Each iteration stages a reward transaction signed by the agent, mines a
//! block on top of the current tip, and broadcasts it. If mining fails or is
//! cancelled the reward transaction is unstaged before the next iteration.

use std::sync::Arc;

use ledger_core::{AbortSignal, Block, LedgerError, Transaction};
use strum::Display;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::actions::reward_gold_action;
use crate::context::AgentContext;
use crate::error::{AgentError, Result};
use crate::events::ChainEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub(crate) enum MinerState {
    Idle,
    Staging,
    Mining,
    Broadcasting,
    Rollback,
}

pub(crate) struct MinerLoop {
    ctx: Arc<AgentContext>,
    cancel: CancellationToken,
    state: MinerState,
}

impl MinerLoop {
    pub fn new(ctx: Arc<AgentContext>, cancel: CancellationToken) -> Self {
        Self {
            ctx,
            cancel,
            state: MinerState::Idle,
        }
    }

    pub async fn run(mut self) {
        info!(target: "agent::miner", "MinerLoop started (miner: {})", self.ctx.address);

        // Mining on a stale tip would fork us off the peers we preload from.
        tokio::select! {
            _ = self.cancel.cancelled() => {
                info!(target: "agent::miner", "MinerLoop stopped before preload ended");
                return;
            }
            _ = self.ctx.wait_preloaded() => {}
        }

        while !self.cancel.is_cancelled() {
            self.iterate().await;

            if let Some(throttle) = self.ctx.config.mining_throttle {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = time::sleep(throttle) => {}
                }
            } else {
                // Mining is the only delay; let the other loops in.
                tokio::task::yield_now().await;
            }
        }

        info!(target: "agent::miner", "MinerLoop stopped");
    }

    fn transition(&mut self, next: MinerState) {
        trace!(target: "agent::miner", "{} -> {}", self.state, next);
        self.state = next;
    }

    pub(crate) async fn iterate(&mut self) {
        self.transition(MinerState::Staging);
        let reward = match self.stage_reward().await {
            Ok(tx) => tx,
            Err(e) => {
                warn!(target: "agent::miner", error = %e, "Failed to stage reward transaction");
                self.transition(MinerState::Idle);
                return;
            }
        };

        self.transition(MinerState::Mining);
        match self.mine().await {
            Ok(block) => {
                self.transition(MinerState::Broadcasting);
                self.announce(block).await;
            }
            Err(e) => {
                self.transition(MinerState::Rollback);
                match &e {
                    AgentError::Ledger(LedgerError::MiningAborted | LedgerError::TipChanged(_)) => {
                        debug!(target: "agent::miner", "Mining abandoned: {}", e);
                    }
                    _ => warn!(target: "agent::miner", error = %e, "Mining failed"),
                }
                self.rollback(&reward).await;
            }
        }

        self.transition(MinerState::Idle);
    }

    async fn stage_reward(&self) -> Result<Transaction> {
        let reward = reward_gold_action(self.ctx.address, self.ctx.config.reward_amount)?;
        self.ctx
            .nonces
            .sign_and_stage(&self.ctx.ledger, &self.ctx.key, vec![reward])
            .await
    }

    /// Mine off the async runtime; cancellation aborts the search.
    async fn mine(&self) -> Result<Arc<Block>> {
        let abort = AbortSignal::new();
        let mut task = {
            let ledger = Arc::clone(&self.ctx.ledger);
            let miner = self.ctx.address;
            let abort = abort.clone();
            tokio::task::spawn_blocking(move || ledger.mine_block(miner, &abort))
        };

        let joined = tokio::select! {
            joined = &mut task => joined,
            _ = self.cancel.cancelled() => {
                abort.abort();
                task.await
            }
        };
        Ok(joined.map_err(AgentError::WorkerJoin)??)
    }

    async fn announce(&self, block: Arc<Block>) {
        info!(
            target: "agent::miner",
            "created block index: {}, difficulty: {}",
            block.index,
            block.difficulty
        );
        self.ctx.metrics.record_block_mined();
        self.ctx.refresh_tip();
        self.ctx.events.publish(ChainEvent::BlockMined {
            index: block.index,
            difficulty: block.difficulty,
            hash: block.hash,
        });

        if let Err(e) = self.ctx.network.broadcast_blocks(vec![block]).await {
            warn!(target: "agent::miner", error = %e, "Failed to broadcast block");
        }
    }

    async fn rollback(&self, reward: &Transaction) {
        self.ctx.metrics.record_mining_rollback();
        match self
            .ctx
            .nonces
            .rollback(&self.ctx.ledger, &self.ctx.key, reward)
            .await
        {
            Ok(restaged) if !restaged.is_empty() => {
                debug!(target: "agent::miner", count = restaged.len(), "Re-sequenced pending transactions");
                if let Err(e) = self.ctx.network.broadcast_transactions(restaged).await {
                    warn!(target: "agent::miner", error = %e, "Failed to broadcast re-sequenced transactions");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(target: "agent::miner", error = %e, "Rollback failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::gold_balance;
    use crate::events::{Event, Topic};
    use crate::testing::TestNode;

    #[tokio::test]
    async fn successful_iteration_mines_and_broadcasts() {
        let node = TestNode::new();
        let mut events = node.ctx.events.subscribe(Topic::Chain);
        let mut miner = MinerLoop::new(node.ctx.clone(), CancellationToken::new());

        miner.iterate().await;

        let tip = node.ctx.ledger.tip().unwrap();
        assert_eq!(tip.index, 1);
        assert_eq!(tip.miner, Some(node.ctx.address));
        assert_eq!(node.peer.blocks_sent(), 1);
        assert!(node.ctx.ledger.staged_transactions().is_empty());
        assert_eq!(miner.state, MinerState::Idle);
        assert!(matches!(events.try_recv().unwrap(), Event::Chain(ChainEvent::TipChanged(_))));
        assert!(matches!(
            events.try_recv().unwrap(),
            Event::Chain(ChainEvent::BlockMined { index: 1, .. })
        ));

        let states = node.ctx.ledger.get_states(&[node.ctx.address]).unwrap();
        assert_eq!(gold_balance(states.get(&node.ctx.address)), 1);
    }

    #[tokio::test]
    async fn failed_mining_unstages_reward() {
        let node = TestNode::new();
        node.ledger.fail_mining(true);
        let mut miner = MinerLoop::new(node.ctx.clone(), CancellationToken::new());

        miner.iterate().await;

        assert!(node.ctx.ledger.staged_transactions().is_empty());
        assert_eq!(node.ctx.ledger.tip().unwrap().index, 0);
        assert_eq!(node.ctx.ledger.next_nonce(&node.ctx.address), 0);
        assert_eq!(node.ctx.metrics.snapshot().mining_rollbacks, 1);
        assert_eq!(node.peer.blocks_sent(), 0);
    }

    #[tokio::test]
    async fn rollback_resequences_user_transactions() {
        let node = TestNode::new();
        node.ledger.fail_mining(true);
        let mut miner = MinerLoop::new(node.ctx.clone(), CancellationToken::new());

        // Reward takes nonce 0, then a user transaction slips in at nonce 1.
        let reward = miner.stage_reward().await.unwrap();
        node.ctx
            .nonces
            .sign_and_stage(&node.ctx.ledger, &node.ctx.key, vec![node.action()])
            .await
            .unwrap();
        miner.rollback(&reward).await;

        let staged = node.ctx.ledger.staged_transactions();
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].nonce, 0);
        assert_eq!(node.peer.transactions_sent(), 1);

        node.ledger.fail_mining(false);
        miner.iterate().await;
        let tip = node.ctx.ledger.tip().unwrap();
        let nonces: Vec<u64> = tip.transactions.iter().map(|tx| tx.nonce).collect();
        assert_eq!(nonces, vec![0, 1]);
    }

    #[tokio::test]
    async fn waits_for_preload_before_mining() {
        let node = TestNode::new();
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(MinerLoop::new(node.ctx.clone(), cancel.clone()).run());

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(node.ctx.ledger.tip().unwrap().index, 0);
        assert!(node.ctx.ledger.staged_transactions().is_empty());

        node.ctx.mark_preloaded();
        let mut tip = node.ctx.watch_tip();
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            tip.wait_for(|t| t.is_some_and(|t| t.index >= 1)),
        )
        .await
        .unwrap()
        .unwrap();

        cancel.cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_loop_leaves_nothing_staged() {
        let node = TestNode::new();
        let cancel = CancellationToken::new();
        node.ctx.mark_preloaded();
        let miner = MinerLoop::new(node.ctx.clone(), cancel.clone());
        let worker = tokio::spawn(miner.run());

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
        worker.await.unwrap();

        assert!(node.ctx.ledger.staged_transactions().is_empty());
        let tip = node.ctx.ledger.tip().unwrap();
        assert_eq!(node.ctx.ledger.next_nonce(&node.ctx.address), tip.index);
    }
}
