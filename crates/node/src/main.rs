//! Chronicle node binary.
//!
//! Composition root: loads configuration, sets up logging, builds the agent
//! through `node-bootstrap`, and runs it until Ctrl-C.
//!
//! # Examples
//!
//! ```bash
//! # Development chain kept in memory
//! CHRONICLE_DEBUG_POLICY=true CHRONICLE_STORE_DIR= cargo run -p chronicle-node
//! ```

mod logging;

use agent::{AgentHandle, ChainEvent, Event, PreloadEvent, Topic};
use anyhow::Result;
use node_bootstrap::{NodeBuilder, NodeConfig};
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let config = NodeConfig::from_env()?;
    let _guard = logging::setup_logging(config.log_dir.as_deref())?;

    tracing::info!("Starting chronicle node");
    tracing::info!("Chain ID: {}", config.chain_id);
    tracing::info!("Endpoint: {}:{}", config.host, config.port);
    tracing::info!("Known peers: {}", config.peers.len());
    tracing::info!("Debug policy: {}", config.debug_policy);

    let mut setup = NodeBuilder::new(config).build()?;
    let handle = setup.agent.handle();
    tracing::info!("Agent address: {}", handle.address());

    let observer = tokio::spawn(log_events(handle.clone()));

    setup.agent.start()?;
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    setup.agent.stop().await?;
    observer.abort();

    let metrics = handle.metrics();
    tracing::info!(
        blocks_mined = metrics.blocks_mined,
        blocks_synced = metrics.blocks_synced,
        transactions_staged = metrics.transactions_staged,
        actions_confirmed = metrics.actions_confirmed,
        "Node stopped"
    );
    Ok(())
}

/// Mirror preload progress and chain changes into the log.
async fn log_events(handle: AgentHandle) {
    let mut preload = handle.subscribe(Topic::Preload);
    let mut chain = handle.subscribe(Topic::Chain);

    loop {
        let received = tokio::select! {
            event = preload.recv() => event,
            event = chain.recv() => event,
        };
        match received {
            Ok(Event::Preload(PreloadEvent::Started)) => tracing::info!("Preload started"),
            Ok(Event::Preload(PreloadEvent::Processed(state))) => tracing::debug!(
                "Preload {}/{}",
                state.received_block_count,
                state.total_block_count
            ),
            Ok(Event::Preload(PreloadEvent::Ended { error: None })) => {
                tracing::info!("Preload ended")
            }
            Ok(Event::Preload(PreloadEvent::Ended { error: Some(e) })) => {
                tracing::warn!("Preload ended early: {}", e)
            }
            Ok(Event::Chain(ChainEvent::TipChanged(tip))) => {
                tracing::debug!("Tip #{} {}", tip.index, tip.hash)
            }
            Ok(Event::Chain(ChainEvent::BlockRejected { index, reason })) => {
                tracing::warn!("Peer block #{} rejected: {}", index, reason)
            }
            Ok(Event::Chain(ChainEvent::Reorganized {
                common_ancestor,
                discarded,
            })) => tracing::info!(
                "Switched branch at #{}, {} blocks discarded",
                common_ancestor,
                discarded
            ),
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => tracing::debug!("Event log skipped {} events", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}
