//! Preload, then follow the blocks peers broadcast.
//!
//! Fork choice is longest chain: a peer block that does not extend our tip
//! sends us back to the network for the peer's branch, which replaces ours
//! only when it is longer. Blocks at or below our height are ignored.

use std::sync::Arc;

use ledger_core::{
    Action, Block, BlockDownloadState, InvalidBlock, LedgerError, PeerError, Reorganization,
    Transaction,
};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::AgentContext;
use crate::error::{AgentError, Result};
use crate::events::{ChainEvent, PreloadEvent};

pub(crate) struct SyncCoordinator {
    ctx: Arc<AgentContext>,
    cancel: CancellationToken,
}

impl SyncCoordinator {
    pub fn new(ctx: Arc<AgentContext>, cancel: CancellationToken) -> Self {
        Self { ctx, cancel }
    }

    pub async fn run(self) {
        info!(target: "agent::sync", "SyncCoordinator started");

        if self.preload().await {
            self.follow().await;
        }

        info!(target: "agent::sync", "SyncCoordinator stopped");
    }

    /// Bulk download from peers, forwarding progress as preload events.
    ///
    /// Returns `false` if cancelled before preload finished.
    pub(crate) async fn preload(&self) -> bool {
        self.ctx.events.publish(PreloadEvent::Started);

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<BlockDownloadState>();
        let preload = self
            .ctx
            .network
            .preload(Arc::clone(&self.ctx.ledger), progress_tx);
        tokio::pin!(preload);

        let result = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                result = &mut preload => break result,
                Some(state) = progress_rx.recv() => {
                    self.ctx.events.publish(PreloadEvent::Processed(state));
                }
            }
        };
        while let Ok(state) = progress_rx.try_recv() {
            self.ctx.events.publish(PreloadEvent::Processed(state));
        }

        let result = self.settle(result).await;
        let error = match result {
            Ok(()) => {
                info!(target: "agent::sync", "Preload finished at tip {:?}", self.ctx.tip().map(|t| t.index));
                None
            }
            Err(e) => {
                warn!(target: "agent::sync", error = %e, "Preload ended early");
                Some(e.to_string())
            }
        };
        self.ctx.events.publish(PreloadEvent::Ended { error });
        self.ctx.mark_preloaded();
        true
    }

    /// Steady state: apply broadcast blocks, re-entering after the stream ends.
    async fn follow(&self) {
        loop {
            let started = tokio::select! {
                _ = self.cancel.cancelled() => return,
                started = self.ctx.network.start_sync(Arc::clone(&self.ctx.ledger)) => started,
            };

            match started {
                Ok(mut blocks) => loop {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        received = blocks.recv() => match received {
                            Some(block) => self.apply(block).await,
                            None => {
                                debug!(target: "agent::sync", "Block stream ended");
                                break;
                            }
                        },
                    }
                },
                Err(e) => warn!(target: "agent::sync", error = %e, "Failed to start sync"),
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = time::sleep(self.ctx.config.dial_timeout) => {}
            }
        }
    }

    pub(crate) async fn apply(&self, block: Block) {
        let index = block.index;
        match self.append(block).await {
            Ok(accepted) => {
                debug!(target: "agent::sync", index = accepted.index, "Appended block from peer");
                self.ctx.metrics.record_block_synced();
                self.ctx.refresh_tip();
            }
            Err(AgentError::Ledger(LedgerError::InvalidBlock(InvalidBlock::IndexMismatch {
                expected,
                actual,
            }))) if actual > expected => {
                debug!(target: "agent::sync", index, expected, "Block ahead of tip; catching up");
                self.catch_up().await;
            }
            Err(AgentError::Ledger(LedgerError::InvalidBlock(InvalidBlock::IndexMismatch {
                expected,
                ..
            }))) => {
                debug!(target: "agent::sync", index, expected, "Ignoring block at or below tip");
            }
            Err(AgentError::Ledger(LedgerError::InvalidBlock(
                InvalidBlock::PreviousHashMismatch { .. },
            ))) => {
                debug!(target: "agent::sync", index, "Block from a longer branch; catching up");
                self.catch_up().await;
            }
            Err(AgentError::Ledger(LedgerError::InvalidBlock(reason))) => {
                warn!(target: "agent::sync", index, %reason, "Rejected block");
                self.ctx.metrics.record_block_rejected();
                self.ctx.events.publish(ChainEvent::BlockRejected {
                    index,
                    reason: reason.to_string(),
                });
            }
            Err(e) => warn!(target: "agent::sync", index, error = %e, "Failed to append block"),
        }
    }

    async fn append(&self, block: Block) -> Result<Arc<Block>> {
        let ledger = Arc::clone(&self.ctx.ledger);
        let appended = tokio::task::spawn_blocking(move || ledger.append_block(block))
            .await
            .map_err(AgentError::WorkerJoin)??;
        Ok(appended)
    }

    /// Pull the blocks we missed; progress is not reported.
    async fn catch_up(&self) {
        let (progress_tx, _progress_rx) = mpsc::unbounded_channel();
        let result = tokio::select! {
            _ = self.cancel.cancelled() => return,
            result = self.ctx.network.preload(Arc::clone(&self.ctx.ledger), progress_tx) => result,
        };
        if let Err(e) = self.settle(result).await {
            warn!(target: "agent::sync", error = %e, "Catch-up failed");
        }
    }

    /// Publish the new tip and carry pending work over any reorganization.
    async fn settle(
        &self,
        result: std::result::Result<Option<Reorganization>, PeerError>,
    ) -> std::result::Result<(), PeerError> {
        // Blocks appended before a failure still count.
        self.ctx.refresh_tip();
        if let Some(reorganization) = result? {
            self.adopt(reorganization).await;
        }
        Ok(())
    }

    /// Our branch lost to a longer one.
    ///
    /// Foreign transactions from the discarded blocks are staged again as
    /// they were. Ours are re-signed after any still staged, and the actions
    /// they carry are tracked again until the new branch confirms them.
    async fn adopt(&self, reorganization: Reorganization) {
        let Reorganization {
            common_ancestor,
            discarded,
            orphaned,
        } = reorganization;
        info!(
            target: "agent::sync",
            common_ancestor,
            discarded = discarded.len(),
            "Switched to a longer peer branch"
        );
        self.ctx.metrics.record_reorganization();
        self.ctx.events.publish(ChainEvent::Reorganized {
            common_ancestor,
            discarded: discarded.len() as u64,
        });

        let (ours, foreign): (Vec<Transaction>, Vec<Transaction>) = orphaned
            .into_iter()
            .partition(|tx| tx.signer == self.ctx.address);
        for tx in foreign {
            let tx_id = tx.id;
            if let Err(e) = self.ctx.ledger.stage_transaction(tx) {
                debug!(target: "agent::sync", %tx_id, error = %e, "Dropped orphaned transaction");
            }
        }

        let restaged = match self
            .ctx
            .nonces
            .resequence(&self.ctx.ledger, &self.ctx.key, ours)
            .await
        {
            Ok(restaged) => restaged,
            Err(e) => {
                warn!(target: "agent::sync", error = %e, "Failed to re-sign pending transactions");
                return;
            }
        };
        if restaged.is_empty() {
            return;
        }

        let actions: Vec<Action> = restaged
            .iter()
            .flat_map(|tx| tx.actions.iter().cloned())
            .collect();
        self.ctx.pool.restore(&actions, Instant::now());
        debug!(target: "agent::sync", count = restaged.len(), "Re-signed pending transactions");
        if let Err(e) = self.ctx.network.broadcast_transactions(restaged).await {
            warn!(target: "agent::sync", error = %e, "Failed to broadcast re-signed transactions");
        }
    }
}
