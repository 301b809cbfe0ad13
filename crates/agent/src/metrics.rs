//! Agent loop counters.
//!
//! Uses atomics for lock-free access from every loop and from handles.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct AgentMetrics {
    transactions_staged: AtomicU64,
    stage_failures: AtomicU64,
    blocks_mined: AtomicU64,
    mining_rollbacks: AtomicU64,
    blocks_synced: AtomicU64,
    blocks_rejected: AtomicU64,
    reorganizations: AtomicU64,
    /// Processed-set queries issued by the tracker
    reconciliation_queries: AtomicU64,
    /// Tracker ticks skipped because the tip did not move
    reconciliation_skips: AtomicU64,
    actions_confirmed: AtomicU64,
    actions_requeued: AtomicU64,
    actions_dropped: AtomicU64,
    actions_failed: AtomicU64,
}

impl AgentMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_staged(&self) {
        self.transactions_staged.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stage_failure(&self) {
        self.stage_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_block_mined(&self) {
        self.blocks_mined.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_mining_rollback(&self) {
        self.mining_rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_block_synced(&self) {
        self.blocks_synced.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_block_rejected(&self) {
        self.blocks_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reorganization(&self) {
        self.reorganizations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconciliation_query(&self) {
        self.reconciliation_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconciliation_skip(&self) {
        self.reconciliation_skips.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_confirmed(&self, count: usize) {
        self.actions_confirmed.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_requeued(&self, count: usize) {
        self.actions_requeued.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self, count: usize) {
        self.actions_dropped.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_action_failed(&self) {
        self.actions_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Creates a snapshot of all counters.
    ///
    /// Note: fields are read one at a time, so the snapshot as a whole may be
    /// inconsistent while loops are running.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            transactions_staged: self.transactions_staged.load(Ordering::Relaxed),
            stage_failures: self.stage_failures.load(Ordering::Relaxed),
            blocks_mined: self.blocks_mined.load(Ordering::Relaxed),
            mining_rollbacks: self.mining_rollbacks.load(Ordering::Relaxed),
            blocks_synced: self.blocks_synced.load(Ordering::Relaxed),
            blocks_rejected: self.blocks_rejected.load(Ordering::Relaxed),
            reorganizations: self.reorganizations.load(Ordering::Relaxed),
            reconciliation_queries: self.reconciliation_queries.load(Ordering::Relaxed),
            reconciliation_skips: self.reconciliation_skips.load(Ordering::Relaxed),
            actions_confirmed: self.actions_confirmed.load(Ordering::Relaxed),
            actions_requeued: self.actions_requeued.load(Ordering::Relaxed),
            actions_dropped: self.actions_dropped.load(Ordering::Relaxed),
            actions_failed: self.actions_failed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub transactions_staged: u64,
    pub stage_failures: u64,
    pub blocks_mined: u64,
    pub mining_rollbacks: u64,
    pub blocks_synced: u64,
    pub blocks_rejected: u64,
    pub reorganizations: u64,
    pub reconciliation_queries: u64,
    pub reconciliation_skips: u64,
    pub actions_confirmed: u64,
    pub actions_requeued: u64,
    pub actions_dropped: u64,
    pub actions_failed: u64,
}
