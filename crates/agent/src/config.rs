//! Agent timing and policy knobs.

use std::time::Duration;

/// Configuration shared by the agent and its background loops.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// How often the stager drains the action queue
    pub tx_process_interval: Duration,
    /// How often processed actions are reconciled, and the minimum age of a
    /// submission before it is retried
    pub action_retry_interval: Duration,
    /// Gold credited by each mined block's reward transaction
    pub reward_amount: u64,
    /// Target block interval for the difficulty policy
    pub block_interval: Duration,
    /// Upper bound on each peer request during preload
    pub dial_timeout: Duration,
    pub event_buffer_size: usize,
    /// Submissions per action before it is dropped
    pub max_retry_attempts: u32,
    /// Pause between mining iterations
    pub mining_throttle: Option<Duration>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            tx_process_interval: Duration::from_secs(3),
            action_retry_interval: Duration::from_secs(15),
            reward_amount: 1,
            block_interval: Duration::from_secs(10),
            dial_timeout: Duration::from_millis(5000),
            event_buffer_size: 256,
            max_retry_attempts: 8,
            mining_throttle: None,
        }
    }
}

impl AgentConfig {
    /// Defaults for development chains: mining is throttled so blocks at
    /// difficulty 1 do not flood the ledger.
    pub fn debug() -> Self {
        Self {
            mining_throttle: Some(Duration::from_secs(3)),
            ..Self::default()
        }
    }
}
