//! Shared bootstrap utilities for chronicle nodes.
//!
//! Loads node configuration from the environment and wires the ledger, peer
//! network and agent together so the binary only has to start and stop it.
pub mod builder;
pub mod config;

pub use builder::{NodeBuilder, NodeSetup};
pub use config::{ConfigError, NodeConfig, PeerParseError, parse_peers};
