//! Shared fixtures for the agent integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use agent::{Agent, AgentConfig, AgentHandle, Event, default_registry};
use ledger_core::{DebugPolicy, PrivateKey};
use ledger_local::{HubPeer, LocalLedger, NetworkHub};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

pub const WAIT: Duration = Duration::from_secs(15);

/// An agent and the collaborators it was built from.
pub struct Node {
    pub agent: Agent,
    pub handle: AgentHandle,
    pub ledger: Arc<LocalLedger>,
    pub peer: Arc<HubPeer>,
}

pub fn ledger(chain_id: Uuid) -> Arc<LocalLedger> {
    Arc::new(
        LocalLedger::in_memory(chain_id, Arc::new(DebugPolicy), Arc::new(default_registry()))
            .expect("in-memory ledger should open"),
    )
}

pub fn node(hub: &Arc<NetworkHub>, chain_id: Uuid, config: AgentConfig) -> Node {
    let key = PrivateKey::generate();
    let ledger = ledger(chain_id);
    let peer = Arc::new(HubPeer::join(
        Arc::clone(hub),
        key.public_key(),
        ledger.clone(),
        &[],
        config.dial_timeout,
    ));
    let agent = Agent::builder()
        .config(config)
        .ledger(ledger.clone())
        .network(peer.clone())
        .private_key(key)
        .build()
        .expect("agent should build");
    let handle = agent.handle();

    Node {
        agent,
        handle,
        ledger,
        peer,
    }
}

/// Config with intervals short enough for tests.
pub fn fast_config() -> AgentConfig {
    AgentConfig {
        tx_process_interval: Duration::from_millis(100),
        action_retry_interval: Duration::from_secs(2),
        mining_throttle: Some(Duration::from_millis(50)),
        ..AgentConfig::default()
    }
}

/// Wait for the first event `pick` maps to `Some`.
pub async fn next_event<T>(
    events: &mut broadcast::Receiver<Event>,
    mut pick: impl FnMut(Event) -> Option<T>,
) -> T {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(found) = pick(event) {
                        return found;
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event bus closed"),
            }
        }
    };
    tokio::time::timeout(WAIT, wait)
        .await
        .expect("timed out waiting for event")
}

/// Poll `condition` until it holds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let wait = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(WAIT, wait)
        .await
        .expect("condition never held");
}
