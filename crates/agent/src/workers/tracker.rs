//! Reconciles submitted actions against the chain's processed set.
//!
//! On each tick the tracker compares the tip with the one it last reconciled
//! at. An unchanged tip means nothing could have been confirmed, so the tick
//! is skipped without touching the ledger. Otherwise it reads the processed
//! set once and settles the unconfirmed pool: confirmed actions leave it,
//! stale ones are queued again, and those out of attempts are dropped.
//!
//! The tracker also relays evaluation results for actions in the pool as
//! [`ActionEvent::ActionResult`], which is how precondition failures reach
//! the caller. Mining rewards never enter the pool and are not relayed.

use std::sync::Arc;

use ledger_core::{
    ActionEvaluation, ActionOutcome, HashDigest, PROCESSED_ACTIONS_ADDRESS, ProcessedActionSet,
};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::context::AgentContext;
use crate::events::{ActionEvent, DropReason};

pub(crate) struct ProcessedActionTracker {
    ctx: Arc<AgentContext>,
    cancel: CancellationToken,
    evaluations: broadcast::Receiver<ActionEvaluation>,
    /// Tip hash at the last successful reconciliation, seeded with the tip
    /// at construction
    last_tip: Option<HashDigest>,
}

impl ProcessedActionTracker {
    pub fn new(ctx: Arc<AgentContext>, cancel: CancellationToken) -> Self {
        let evaluations = ctx.ledger.subscribe_evaluations();
        let last_tip = ctx.ledger.tip().map(|tip| tip.hash);
        Self {
            ctx,
            cancel,
            evaluations,
            last_tip,
        }
    }

    pub async fn run(mut self) {
        let period = self.ctx.config.action_retry_interval;
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(target: "agent::tracker", "ProcessedActionTracker started (interval: {:?})", period);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.reconcile().await,
                received = self.evaluations.recv() => match received {
                    Ok(evaluation) => self.handle_evaluation(evaluation),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(target: "agent::tracker", skipped, "Missed evaluation results");
                    }
                    Err(RecvError::Closed) => {
                        warn!(target: "agent::tracker", "Evaluation feed closed");
                        self.evaluations = self.ctx.ledger.subscribe_evaluations();
                    }
                },
            }
        }

        info!(target: "agent::tracker", "ProcessedActionTracker stopped");
    }

    fn handle_evaluation(&self, evaluation: ActionEvaluation) {
        if evaluation.signer != self.ctx.address || !self.ctx.pool.contains(&evaluation.action_id)
        {
            return;
        }
        if let ActionOutcome::Failed(failure) = &evaluation.outcome {
            debug!(
                target: "agent::tracker",
                action_id = %evaluation.action_id,
                code = %failure.code,
                "Action failed: {}",
                failure.message
            );
            self.ctx.metrics.record_action_failed();
        }
        self.ctx.events.publish(ActionEvent::ActionResult(evaluation));
    }

    fn drain_evaluations(&mut self) {
        loop {
            match self.evaluations.try_recv() {
                Ok(evaluation) => self.handle_evaluation(evaluation),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(target: "agent::tracker", skipped, "Missed evaluation results");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
    }

    pub(crate) async fn reconcile(&mut self) {
        let Some(tip) = self.ctx.ledger.tip() else {
            trace!(target: "agent::tracker", "No tip yet");
            return;
        };
        if self.last_tip == Some(tip.hash) {
            trace!(target: "agent::tracker", "Tip unchanged at block {}, skipping", tip.index);
            self.ctx.metrics.record_reconciliation_skip();
            return;
        }

        self.ctx.metrics.record_reconciliation_query();
        let ledger = Arc::clone(&self.ctx.ledger);
        let query =
            tokio::task::spawn_blocking(move || ledger.get_states(&[PROCESSED_ACTIONS_ADDRESS]));
        let states = match query.await {
            Ok(Ok(states)) => states,
            Ok(Err(e)) => {
                warn!(target: "agent::tracker", error = %e, "Processed-set query failed");
                return;
            }
            Err(e) => {
                warn!(target: "agent::tracker", error = %e, "Processed-set query was cancelled");
                return;
            }
        };
        self.last_tip = Some(tip.hash);

        // Results for actions about to leave the pool go out first.
        self.drain_evaluations();
        let processed = ProcessedActionSet::from_state(states.get(&PROCESSED_ACTIONS_ADDRESS));
        let outcome = self.ctx.pool.reconcile(
            &processed,
            Instant::now(),
            self.ctx.config.action_retry_interval,
            self.ctx.config.max_retry_attempts,
        );

        self.ctx.metrics.record_confirmed(outcome.confirmed.len());
        self.ctx.metrics.record_requeued(outcome.requeue.len());
        self.ctx.metrics.record_dropped(outcome.exhausted.len());

        if !outcome.requeue.is_empty() {
            debug!(
                target: "agent::tracker",
                count = outcome.requeue.len(),
                tip = tip.index,
                "Requeueing unconfirmed actions"
            );
        }
        for action in outcome.requeue {
            self.ctx.queue.enqueue(action);
        }
        for (action, attempts) in outcome.exhausted {
            warn!(
                target: "agent::tracker",
                action_id = %action.id,
                attempts,
                "Dropping action after exhausting retries"
            );
            self.ctx.events.publish(ActionEvent::ActionDropped {
                action_id: action.id,
                reason: DropReason::RetriesExhausted { attempts },
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::events::{Event, Topic};
    use crate::testing::TestNode;
    use ledger_core::{AbortSignal, FailureCode};
    use std::time::Duration;

    fn config() -> AgentConfig {
        AgentConfig {
            action_retry_interval: Duration::from_secs(15),
            ..AgentConfig::default()
        }
    }

    async fn submit(node: &TestNode, action: &ledger_core::Action) {
        node.ctx.pool.record_submitted(std::slice::from_ref(action), Instant::now());
        node.ctx
            .nonces
            .sign_and_stage(&node.ctx.ledger, &node.ctx.key, vec![action.clone()])
            .await
            .unwrap();
    }

    fn mine(node: &TestNode) {
        node.ctx
            .ledger
            .mine_block(node.ctx.address, &AbortSignal::new())
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_tip_issues_no_query() {
        let node = TestNode::with_config(config());
        let mut tracker = ProcessedActionTracker::new(node.ctx.clone(), CancellationToken::new());

        // Nothing can have been confirmed since the tracker saw the tip.
        tracker.reconcile().await;
        assert_eq!(node.ledger.get_states_calls(), 0);

        mine(&node);
        tracker.reconcile().await;
        assert_eq!(node.ledger.get_states_calls(), 1);

        tracker.reconcile().await;
        tracker.reconcile().await;
        assert_eq!(node.ledger.get_states_calls(), 1);
        assert_eq!(node.ctx.metrics.snapshot().reconciliation_skips, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn confirmed_actions_are_never_resubmitted() {
        let node = TestNode::with_config(config());
        let mut tracker = ProcessedActionTracker::new(node.ctx.clone(), CancellationToken::new());
        let action = node.action();
        submit(&node, &action).await;
        mine(&node);

        for _ in 0..5 {
            time::advance(Duration::from_secs(15)).await;
            tracker.reconcile().await;
            mine(&node);
        }

        assert!(node.ctx.queue.is_empty());
        assert!(!node.ctx.pool.contains(&action.id));
        assert_eq!(node.ctx.metrics.snapshot().actions_requeued, 0);
        assert_eq!(node.ctx.metrics.snapshot().actions_confirmed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_actions_are_requeued_after_interval() {
        let node = TestNode::with_config(config());
        let mut tracker = ProcessedActionTracker::new(node.ctx.clone(), CancellationToken::new());
        let action = node.action();
        submit(&node, &action).await;
        // Lost: never reaches a block.
        node.ctx.ledger.unstage_transaction(&node.ctx.ledger.staged_transactions()[0].id);
        mine(&node);

        tracker.reconcile().await;
        assert!(node.ctx.queue.is_empty());

        time::advance(Duration::from_secs(15)).await;
        mine(&node);
        tracker.reconcile().await;

        assert_eq!(node.ctx.queue.drain_all(), vec![action.clone()]);
        assert!(node.ctx.pool.contains(&action.id));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_query_retries_next_tick() {
        let node = TestNode::with_config(config());
        let mut tracker = ProcessedActionTracker::new(node.ctx.clone(), CancellationToken::new());
        let action = node.action();
        submit(&node, &action).await;
        mine(&node);

        node.ledger.fail_queries(true);
        tracker.reconcile().await;
        assert!(node.ctx.pool.contains(&action.id));

        node.ledger.fail_queries(false);
        tracker.reconcile().await;
        assert_eq!(node.ledger.get_states_calls(), 2);
        assert!(!node.ctx.pool.contains(&action.id));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_actions_emit_dropped() {
        let node = TestNode::with_config(AgentConfig {
            max_retry_attempts: 1,
            ..config()
        });
        let mut tracker = ProcessedActionTracker::new(node.ctx.clone(), CancellationToken::new());
        let mut events = node.ctx.events.subscribe(Topic::Action);
        let action = node.action();
        node.ctx.pool.record_submitted(std::slice::from_ref(&action), Instant::now());

        time::advance(Duration::from_secs(15)).await;
        mine(&node);
        tracker.reconcile().await;

        assert_eq!(
            events.try_recv().unwrap(),
            Event::Action(ActionEvent::ActionDropped {
                action_id: action.id,
                reason: DropReason::RetriesExhausted { attempts: 1 },
            })
        );
        assert!(node.ctx.pool.is_empty());
    }

    #[tokio::test]
    async fn failed_evaluation_fires_result_and_is_not_requeued() {
        let node = TestNode::with_config(config());
        let tracker = ProcessedActionTracker::new(node.ctx.clone(), CancellationToken::new());
        let mut settle = ProcessedActionTracker::new(node.ctx.clone(), CancellationToken::new());
        let mut events = node.ctx.events.subscribe(Topic::Action);
        let cancel = tracker.cancel.clone();
        let worker = tokio::spawn(tracker.run());

        let broke = node.ctx.address;
        let payload = crate::actions::transfer_gold_payload(broke, 10).unwrap();
        let action = ledger_core::Action::new(broke, payload);
        submit(&node, &action).await;
        mine(&node);

        let event = time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            Event::Action(ActionEvent::ActionResult(evaluation)) => {
                assert_eq!(evaluation.action_id, action.id);
                assert!(matches!(
                    evaluation.outcome,
                    ActionOutcome::Failed(ref f) if f.code == FailureCode::PreconditionFailed
                ));
            }
            other => panic!("unexpected event {:?}", other),
        }

        cancel.cancel();
        worker.await.unwrap();

        settle.reconcile().await;
        assert!(node.ctx.queue.is_empty());
        assert!(!node.ctx.pool.contains(&action.id));
    }

    #[tokio::test]
    async fn only_pooled_actions_are_relayed() {
        let node = TestNode::with_config(config());
        let tracker = ProcessedActionTracker::new(node.ctx.clone(), CancellationToken::new());
        let mut events = node.ctx.events.subscribe(Topic::Action);
        let cancel = tracker.cancel.clone();
        let worker = tokio::spawn(tracker.run());

        let reward = crate::actions::reward_gold_action(node.ctx.address, 10).unwrap();
        node.ctx
            .nonces
            .sign_and_stage(&node.ctx.ledger, &node.ctx.key, vec![reward])
            .await
            .unwrap();
        mine(&node);
        let action = node.action();
        submit(&node, &action).await;
        mine(&node);

        let event = time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            Event::Action(ActionEvent::ActionResult(ref evaluation))
                if evaluation.action_id == action.id
        ));

        cancel.cancel();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn pending_results_are_relayed_before_settling() {
        let node = TestNode::with_config(config());
        let mut tracker = ProcessedActionTracker::new(node.ctx.clone(), CancellationToken::new());
        let mut events = node.ctx.events.subscribe(Topic::Action);
        let action = node.action();
        submit(&node, &action).await;
        mine(&node);

        tracker.reconcile().await;

        assert!(!node.ctx.pool.contains(&action.id));
        assert!(matches!(
            events.try_recv().unwrap(),
            Event::Action(ActionEvent::ActionResult(ref evaluation))
                if evaluation.action_id == action.id
        ));
    }
}
