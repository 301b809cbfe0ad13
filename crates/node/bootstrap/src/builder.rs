//! Builds the ledger, peer network and agent for a node.
use std::sync::Arc;

use agent::{Agent, default_registry};
use anyhow::{Context, Result};
use ledger_core::{BlockPolicy, DebugPolicy, DifficultyPolicy, PrivateKey};
use ledger_local::{FileBlockStore, HubPeer, LocalLedger, NetworkHub};
use tracing::{debug, info};

use crate::config::NodeConfig;

/// Builder that assembles the collaborators and the agent for a node.
pub struct NodeBuilder {
    config: NodeConfig,
    hub: Option<Arc<NetworkHub>>,
}

impl NodeBuilder {
    pub fn new(config: NodeConfig) -> Self {
        Self { config, hub: None }
    }

    /// Join an existing hub instead of creating a private one.
    pub fn hub(mut self, hub: Arc<NetworkHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    /// Open the ledger and wire the agent.
    ///
    /// Fails if the block store cannot be opened or replayed.
    pub fn build(self) -> Result<NodeSetup> {
        let config = self.config;

        let key = match &config.private_key {
            Some(key) => key.clone(),
            None => {
                info!("No CHRONICLE_PRIVATE_KEY set; using a generated key");
                PrivateKey::generate()
            }
        };

        let policy: Arc<dyn BlockPolicy> = if config.debug_policy {
            debug!("Using debug block policy");
            Arc::new(DebugPolicy)
        } else {
            Arc::new(DifficultyPolicy::new(config.agent.block_interval))
        };

        let store = match &config.store_dir {
            Some(dir) => {
                let dir = dir.join(config.chain_id.to_string());
                let store = FileBlockStore::new(&dir)
                    .with_context(|| format!("Failed to open block store at {}", dir.display()))?;
                info!("Block store: {}", dir.display());
                Some(store)
            }
            None => {
                info!("No block store configured; chain is kept in memory");
                None
            }
        };

        let ledger = Arc::new(
            LocalLedger::open(config.chain_id, policy, Arc::new(default_registry()), store)
                .context("Failed to open ledger")?,
        );

        let hub = self.hub.unwrap_or_else(NetworkHub::new);
        let network = Arc::new(HubPeer::join(
            Arc::clone(&hub),
            key.public_key(),
            ledger.clone(),
            &config.peers,
            config.agent.dial_timeout,
        ));

        let agent = Agent::builder()
            .config(config.agent.clone())
            .ledger(ledger.clone())
            .network(network.clone())
            .private_key(key)
            .build()
            .context("Failed to build agent")?;

        Ok(NodeSetup {
            config,
            agent,
            ledger,
            network,
            hub,
        })
    }
}

pub struct NodeSetup {
    pub config: NodeConfig,
    pub agent: Agent,
    pub ledger: Arc<LocalLedger>,
    pub network: Arc<HubPeer>,
    pub hub: Arc<NetworkHub>,
}
