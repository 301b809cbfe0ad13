//! Agent orchestrator.
//!
//! The agent owns the four background loops and the shared context. Loops are
//! started together and stopped together; there is no state in which only
//! some of them run.

use std::sync::Arc;

use ledger_core::{Ledger, PeerNetwork, PrivateKey};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::context::AgentContext;
use crate::error::{AgentError, Result};
use crate::handle::AgentHandle;
use crate::workers::{MinerLoop, ProcessedActionTracker, SyncCoordinator, TransactionStager};

enum Lifecycle {
    Ready,
    Running {
        cancel: CancellationToken,
        workers: Vec<(&'static str, JoinHandle<()>)>,
    },
    Stopped,
}

/// Blockchain agent: stages, mines, reconciles and syncs in the background
///
/// [`AgentHandle`] provides a cloneable façade for game logic and UI.
pub struct Agent {
    ctx: Arc<AgentContext>,
    lifecycle: Lifecycle,
}

impl Agent {
    /// Create a new agent builder
    pub fn builder() -> AgentBuilder {
        AgentBuilder::new()
    }

    /// Get a cloneable handle to this agent
    ///
    /// The handle stays usable before start and after stop; enqueued actions
    /// simply wait for the stager.
    pub fn handle(&self) -> AgentHandle {
        AgentHandle::new(Arc::clone(&self.ctx))
    }

    pub fn config(&self) -> &AgentConfig {
        &self.ctx.config
    }

    pub fn is_running(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Running { .. })
    }

    /// Spawn the stager, tracker, miner and sync loops on the current runtime.
    ///
    /// An agent runs at most once; starting a stopped agent is an error.
    pub fn start(&mut self) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Running { .. } => return Err(AgentError::AlreadyRunning),
            Lifecycle::Stopped => return Err(AgentError::Stopped),
            Lifecycle::Ready => {}
        }
        let runtime = Handle::try_current().map_err(|_| AgentError::NoRuntime)?;

        let cancel = CancellationToken::new();
        let stager = TransactionStager::new(Arc::clone(&self.ctx), cancel.child_token());
        let tracker = ProcessedActionTracker::new(Arc::clone(&self.ctx), cancel.child_token());
        let miner = MinerLoop::new(Arc::clone(&self.ctx), cancel.child_token());
        let sync = SyncCoordinator::new(Arc::clone(&self.ctx), cancel.child_token());

        let workers = vec![
            ("stager", runtime.spawn(stager.run())),
            ("tracker", runtime.spawn(tracker.run())),
            ("miner", runtime.spawn(miner.run())),
            ("sync", runtime.spawn(sync.run())),
        ];

        info!(
            address = %self.ctx.address,
            chain_id = %self.ctx.ledger.chain_id(),
            "Agent started"
        );
        self.lifecycle = Lifecycle::Running { cancel, workers };
        Ok(())
    }

    /// Cancel every loop, wait for them to exit, then stop the peer network.
    ///
    /// In-flight mining is aborted and its reward transaction unstaged before
    /// the miner exits. All loops are joined even if one of them panicked; the
    /// first join failure is returned.
    pub async fn stop(&mut self) -> Result<()> {
        let (cancel, workers) = match std::mem::replace(&mut self.lifecycle, Lifecycle::Stopped) {
            Lifecycle::Running { cancel, workers } => (cancel, workers),
            other => {
                self.lifecycle = other;
                return Err(AgentError::NotRunning);
            }
        };

        cancel.cancel();

        let mut first_error = None;
        for (name, worker) in workers {
            if let Err(e) = worker.await {
                warn!(worker = name, error = %e, "Agent worker did not exit cleanly");
                first_error.get_or_insert(AgentError::WorkerJoin(e));
            }
        }

        self.ctx.network.stop().await;
        info!("Agent stopped");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        if let Lifecycle::Running { cancel, .. } = &self.lifecycle {
            cancel.cancel();
        }
    }
}

/// Builder for [`Agent`].
pub struct AgentBuilder {
    config: AgentConfig,
    ledger: Option<Arc<dyn Ledger>>,
    network: Option<Arc<dyn PeerNetwork>>,
    key: Option<PrivateKey>,
}

impl AgentBuilder {
    fn new() -> Self {
        Self {
            config: AgentConfig::default(),
            ledger: None,
            network: None,
            key: None,
        }
    }

    /// Override agent configuration
    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the local ledger (required)
    pub fn ledger(mut self, ledger: Arc<dyn Ledger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Set the peer network (required)
    pub fn network(mut self, network: Arc<dyn PeerNetwork>) -> Self {
        self.network = Some(network);
        self
    }

    /// Set the signing key; the agent address derives from it (required)
    pub fn private_key(mut self, key: PrivateKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn build(self) -> Result<Agent> {
        let ledger = self.ledger.ok_or(AgentError::MissingLedger)?;
        let network = self.network.ok_or(AgentError::MissingNetwork)?;
        let key = self.key.ok_or(AgentError::MissingKey)?;

        let ctx = AgentContext::new(ledger, network, key, self.config);
        Ok(Agent {
            ctx: Arc::new(ctx),
            lifecycle: Lifecycle::Ready,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestNode;

    fn agent(node: &TestNode) -> Agent {
        Agent::builder()
            .config(node.ctx.config.clone())
            .ledger(Arc::clone(&node.ctx.ledger))
            .network(Arc::clone(&node.ctx.network))
            .private_key(node.ctx.key.clone())
            .build()
            .unwrap()
    }

    #[test]
    fn build_requires_collaborators() {
        let node = TestNode::new();
        let missing_ledger = Agent::builder()
            .network(Arc::clone(&node.ctx.network))
            .private_key(node.ctx.key.clone())
            .build();
        assert!(matches!(missing_ledger, Err(AgentError::MissingLedger)));

        let missing_key = Agent::builder()
            .ledger(Arc::clone(&node.ctx.ledger))
            .network(Arc::clone(&node.ctx.network))
            .build();
        assert!(matches!(missing_key, Err(AgentError::MissingKey)));
    }

    #[test]
    fn start_outside_runtime_fails() {
        let node = TestNode::new();
        let mut agent = agent(&node);

        assert!(matches!(agent.start(), Err(AgentError::NoRuntime)));
        assert!(!agent.is_running());
    }

    #[tokio::test]
    async fn lifecycle_transitions() {
        let node = TestNode::new();
        let mut agent = agent(&node);

        assert!(matches!(agent.stop().await, Err(AgentError::NotRunning)));
        assert!(!agent.is_running());

        agent.start().unwrap();
        assert!(agent.is_running());
        assert!(matches!(agent.start(), Err(AgentError::AlreadyRunning)));

        agent.stop().await.unwrap();
        assert!(!agent.is_running());
        assert!(matches!(agent.stop().await, Err(AgentError::NotRunning)));
        assert!(matches!(agent.start(), Err(AgentError::Stopped)));
        assert_eq!(node.ctx.network.peer_count(), 0);
    }
}
