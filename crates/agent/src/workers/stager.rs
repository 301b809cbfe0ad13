//! Periodically turns queued actions into one signed, staged transaction.

use std::sync::Arc;

use ledger_core::Action;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::AgentContext;
use crate::events::{ActionEvent, DropReason};

pub(crate) struct TransactionStager {
    ctx: Arc<AgentContext>,
    cancel: CancellationToken,
}

impl TransactionStager {
    pub fn new(ctx: Arc<AgentContext>, cancel: CancellationToken) -> Self {
        Self { ctx, cancel }
    }

    pub async fn run(self) {
        let period = self.ctx.config.tx_process_interval;
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(target: "agent::stager", "TransactionStager started (interval: {:?})", period);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            // Runs to completion so staging is never left half done.
            self.tick().await;
        }

        info!(target: "agent::stager", "TransactionStager stopped");
    }

    pub(crate) async fn tick(&self) {
        let drained = self.ctx.queue.drain_all();
        if drained.is_empty() {
            return;
        }

        let (actions, foreign): (Vec<Action>, Vec<Action>) = drained
            .into_iter()
            .partition(|action| action.signer == self.ctx.address);
        for action in foreign {
            warn!(
                target: "agent::stager",
                action_id = %action.id,
                signer = %action.signer,
                "Dropping action signed for another address"
            );
            self.ctx.metrics.record_dropped(1);
            self.ctx.events.publish(ActionEvent::ActionDropped {
                action_id: action.id,
                reason: DropReason::ForeignSigner,
            });
        }
        if actions.is_empty() {
            return;
        }

        // Pool first: a failed stage leaves the actions for the tracker to retry.
        self.ctx.pool.record_submitted(&actions, Instant::now());
        let action_ids: Vec<_> = actions.iter().map(|action| action.id).collect();
        let count = actions.len();

        let tx = match self
            .ctx
            .nonces
            .sign_and_stage(&self.ctx.ledger, &self.ctx.key, actions)
            .await
        {
            Ok(tx) => tx,
            Err(e) => {
                warn!(target: "agent::stager", error = %e, count, "Failed to stage transaction");
                self.ctx.metrics.record_stage_failure();
                return;
            }
        };

        debug!(target: "agent::stager", tx_id = %tx.id, nonce = tx.nonce, count, "Staged actions");
        self.ctx.metrics.record_staged();
        self.ctx.events.publish(ActionEvent::TransactionStaged {
            tx_id: tx.id,
            nonce: tx.nonce,
            action_ids,
        });

        if let Err(e) = self.ctx.network.broadcast_transactions(vec![tx]).await {
            warn!(target: "agent::stager", error = %e, "Failed to broadcast transaction");
        }
    }
}
