//! Node configuration structures and loaders.
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use agent::AgentConfig;
use ledger_core::{CryptoError, Peer, PrivateKey, PublicKey};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PeerParseError {
    #[error("peer `{0}` is not of the form pubkey@host:port")]
    Malformed(String),

    #[error("peer `{entry}` has an invalid port")]
    InvalidPort { entry: String },

    #[error("peer `{entry}` has an invalid public key: {source}")]
    InvalidPublicKey {
        entry: String,
        #[source]
        source: CryptoError,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("CHRONICLE_PRIVATE_KEY is not a valid key: {0}")]
    PrivateKey(#[source] CryptoError),

    #[error(transparent)]
    Peer(#[from] PeerParseError),
}

/// Configuration required to bootstrap a node.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Signing key; a fresh one is generated when absent
    pub private_key: Option<PrivateKey>,
    /// Block store root; `None` keeps the chain in memory
    pub store_dir: Option<PathBuf>,
    pub chain_id: Uuid,
    pub peers: Vec<Peer>,
    pub host: String,
    pub port: u16,
    /// Accept any well-linked block at difficulty 1 and throttle mining
    pub debug_policy: bool,
    pub log_dir: Option<PathBuf>,
    pub agent: AgentConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            private_key: None,
            store_dir: default_store_dir(),
            chain_id: Uuid::nil(),
            peers: Vec::new(),
            host: "127.0.0.1".to_string(),
            port: 31234,
            debug_policy: false,
            log_dir: None,
            agent: AgentConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Construct configuration from process environment variables.
    ///
    /// Environment variables:
    /// - `CHRONICLE_PRIVATE_KEY` - Hex signing key (default: generated per run)
    /// - `CHRONICLE_STORE_DIR` - Block store root; empty keeps blocks in memory
    ///   (default: platform data directory)
    /// - `CHRONICLE_CHAIN_ID` - Chain UUID (default: nil UUID)
    /// - `CHRONICLE_PEERS` - Comma-separated `pubkey@host:port` entries
    /// - `CHRONICLE_HOST` / `CHRONICLE_PORT` - Advertised endpoint
    /// - `CHRONICLE_TX_INTERVAL_MS` - Staging interval (default: 3000)
    /// - `CHRONICLE_RETRY_INTERVAL_MS` - Reconciliation interval (default: 15000)
    /// - `CHRONICLE_REWARD_AMOUNT` - Gold per mined block (default: 1)
    /// - `CHRONICLE_BLOCK_INTERVAL_MS` - Difficulty target interval (default: 10000)
    /// - `CHRONICLE_DIAL_TIMEOUT_MS` - Per-peer request timeout (default: 5000)
    /// - `CHRONICLE_DEBUG_POLICY` - Use the development block policy (default: false)
    /// - `CHRONICLE_LOG_DIR` - Also write daily log files here (default: none)
    ///
    /// Unparseable numbers and flags fall back to their defaults. A bad key
    /// or peer entry is an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Like [`NodeConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(key) = lookup("CHRONICLE_PRIVATE_KEY").filter(|k| !k.trim().is_empty()) {
            config.private_key = Some(PrivateKey::from_hex(&key).map_err(ConfigError::PrivateKey)?);
        }

        // Set but empty means memory only
        if let Some(dir) = lookup("CHRONICLE_STORE_DIR") {
            let dir = dir.trim();
            config.store_dir = (!dir.is_empty()).then(|| PathBuf::from(dir));
        }

        if let Some(chain_id) = read_env::<Uuid>(&lookup, "CHRONICLE_CHAIN_ID") {
            config.chain_id = chain_id;
        }

        if let Some(peers) = lookup("CHRONICLE_PEERS") {
            config.peers = parse_peers(&peers)?;
        }

        if let Some(host) = lookup("CHRONICLE_HOST").filter(|h| !h.trim().is_empty()) {
            config.host = host.trim().to_string();
        }
        if let Some(port) = read_env::<u16>(&lookup, "CHRONICLE_PORT") {
            config.port = port;
        }

        if let Some(debug) = read_env::<bool>(&lookup, "CHRONICLE_DEBUG_POLICY") {
            config.debug_policy = debug;
        }
        if config.debug_policy {
            config.agent = AgentConfig::debug();
        }

        if let Some(interval) = read_millis(&lookup, "CHRONICLE_TX_INTERVAL_MS") {
            config.agent.tx_process_interval = interval;
        }
        if let Some(interval) = read_millis(&lookup, "CHRONICLE_RETRY_INTERVAL_MS") {
            config.agent.action_retry_interval = interval;
        }
        if let Some(amount) = read_env::<u64>(&lookup, "CHRONICLE_REWARD_AMOUNT") {
            config.agent.reward_amount = amount;
        }
        if let Some(interval) = read_millis(&lookup, "CHRONICLE_BLOCK_INTERVAL_MS") {
            config.agent.block_interval = interval;
        }
        if let Some(timeout) = read_millis(&lookup, "CHRONICLE_DIAL_TIMEOUT_MS") {
            config.agent.dial_timeout = timeout;
        }

        config.log_dir = lookup("CHRONICLE_LOG_DIR")
            .filter(|d| !d.trim().is_empty())
            .map(PathBuf::from);

        Ok(config)
    }
}

/// Parse a comma-separated list of `pubkeyhex@host:port` peers.
///
/// Blank entries are ignored.
pub fn parse_peers(s: &str) -> Result<Vec<Peer>, PeerParseError> {
    s.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(parse_peer)
        .collect()
}

fn parse_peer(entry: &str) -> Result<Peer, PeerParseError> {
    let (key, endpoint) = entry
        .split_once('@')
        .ok_or_else(|| PeerParseError::Malformed(entry.to_string()))?;
    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| PeerParseError::Malformed(entry.to_string()))?;
    if host.is_empty() {
        return Err(PeerParseError::Malformed(entry.to_string()));
    }
    let port = port.parse().map_err(|_| PeerParseError::InvalidPort {
        entry: entry.to_string(),
    })?;
    let public_key = PublicKey::from_hex(key).map_err(|source| PeerParseError::InvalidPublicKey {
        entry: entry.to_string(),
        source,
    })?;

    Ok(Peer {
        public_key,
        host: host.to_string(),
        port,
    })
}

fn default_store_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "chronicle").map(|dirs| dirs.data_dir().join("blocks"))
}

fn read_env<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr,
{
    lookup(key)?.trim().parse().ok()
}

fn read_millis(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    read_env::<u64>(lookup, key).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<NodeConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        NodeConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_variables() {
        let config = load(&[]).unwrap();

        assert!(config.private_key.is_none());
        assert_eq!(config.chain_id, Uuid::nil());
        assert!(config.peers.is_empty());
        assert!(!config.debug_policy);
        assert_eq!(config.agent.tx_process_interval, Duration::from_secs(3));
        assert_eq!(config.agent.action_retry_interval, Duration::from_secs(15));
        assert_eq!(config.agent.reward_amount, 1);
        assert_eq!(config.agent.dial_timeout, Duration::from_millis(5000));
        assert!(config.agent.mining_throttle.is_none());
    }

    #[test]
    fn overrides_are_applied() {
        let key = PrivateKey::generate();
        let chain_id = Uuid::new_v4();
        let config = load(&[
            ("CHRONICLE_PRIVATE_KEY", key.to_hex().as_str()),
            ("CHRONICLE_CHAIN_ID", chain_id.to_string().as_str()),
            ("CHRONICLE_STORE_DIR", "/var/lib/chronicle"),
            ("CHRONICLE_TX_INTERVAL_MS", "500"),
            ("CHRONICLE_REWARD_AMOUNT", "10"),
            ("CHRONICLE_DEBUG_POLICY", "true"),
            ("CHRONICLE_LOG_DIR", "/tmp/logs"),
        ])
        .unwrap();

        assert_eq!(config.private_key.unwrap().address(), key.address());
        assert_eq!(config.chain_id, chain_id);
        assert_eq!(config.store_dir, Some(PathBuf::from("/var/lib/chronicle")));
        assert_eq!(config.agent.tx_process_interval, Duration::from_millis(500));
        assert_eq!(config.agent.reward_amount, 10);
        assert!(config.debug_policy);
        assert_eq!(config.agent.mining_throttle, Some(Duration::from_secs(3)));
        assert_eq!(config.log_dir, Some(PathBuf::from("/tmp/logs")));
    }

    #[test]
    fn empty_store_dir_means_memory_only() {
        let config = load(&[("CHRONICLE_STORE_DIR", "")]).unwrap();
        assert!(config.store_dir.is_none());
    }

    #[test]
    fn invalid_numbers_fall_back() {
        let config = load(&[
            ("CHRONICLE_RETRY_INTERVAL_MS", "soon"),
            ("CHRONICLE_PORT", "99999"),
            ("CHRONICLE_DEBUG_POLICY", "maybe"),
        ])
        .unwrap();

        assert_eq!(config.agent.action_retry_interval, Duration::from_secs(15));
        assert_eq!(config.port, 31234);
        assert!(!config.debug_policy);
    }

    #[test]
    fn invalid_private_key_is_an_error() {
        assert!(matches!(
            load(&[("CHRONICLE_PRIVATE_KEY", "not-hex")]),
            Err(ConfigError::PrivateKey(_))
        ));
    }

    #[test]
    fn parses_peer_list() {
        let a = PrivateKey::generate().public_key();
        let b = PrivateKey::generate().public_key();
        let list = format!("{}@10.0.0.1:31234, ,{}@node.example:4000", a, b);

        let peers = parse_peers(&list).unwrap();

        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].public_key, a);
        assert_eq!(peers[0].host, "10.0.0.1");
        assert_eq!(peers[1].port, 4000);
        assert_eq!(peers[1].to_string(), format!("{}@node.example:4000", b));
    }

    #[test]
    fn rejects_bad_peer_entries() {
        let key = PrivateKey::generate().public_key();

        assert!(matches!(
            parse_peers("10.0.0.1:31234"),
            Err(PeerParseError::Malformed(_))
        ));
        assert!(matches!(
            parse_peers(&format!("{}@10.0.0.1:http", key)),
            Err(PeerParseError::InvalidPort { .. })
        ));
        assert!(matches!(
            parse_peers("zz@10.0.0.1:31234"),
            Err(PeerParseError::InvalidPublicKey { .. })
        ));
        assert!(matches!(
            load(&[("CHRONICLE_PEERS", "garbage")]),
            Err(ConfigError::Peer(_))
        ));
    }
}
