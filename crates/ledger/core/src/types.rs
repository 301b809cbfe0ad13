//! Core value types shared by the ledger, the peer network, and the agent.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::crypto::PublicKey;

/// Failure to produce the canonical encoding of a value.
#[derive(Debug, thiserror::Error)]
#[error("encoding error: {0}")]
pub struct EncodeError(pub String);

/// Canonical byte encoding used for hashing and signing.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, EncodeError> {
    bincode::serialize(value).map_err(|e| EncodeError(e.to_string()))
}

/// SHA-256 over arbitrary bytes.
pub fn sha256(bytes: &[u8]) -> HashDigest {
    HashDigest(Sha256::digest(bytes).into())
}

/// 32-byte SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HashDigest(pub [u8; 32]);

impl HashDigest {
    pub const ZERO: HashDigest = HashDigest([0u8; 32]);

    /// First eight bytes in hex, for compact logging.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for HashDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for HashDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashDigest({})", self.short())
    }
}

/// 20-byte account address derived from a public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub const fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Last 20 bytes of the SHA-256 of the compressed public key.
    pub fn from_public_key(key: &PublicKey) -> Self {
        let digest = sha256(&key.to_bytes());
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest.0[12..]);
        Self(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(s.trim_start_matches("0x"), &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

/// Well-known address holding the set of action ids the chain has evaluated.
pub const PROCESSED_ACTIONS_ADDRESS: Address = Address::new([
    0x1c, 0x2a, 0xe9, 0x73, 0x80, 0xcf, 0xb4, 0xf7, 0x32, 0x04, 0x9e, 0x45, 0x4f, 0x6d, 0x9a,
    0x25, 0xd4, 0x96, 0x7c, 0x6f,
]);

/// Arbitrary state value stored at an address.
pub type StateValue = serde_json::Value;

/// Point-in-time view of a set of addresses.
pub type StateMap = HashMap<Address, StateValue>;

/// Unique identifier of a user-submitted action.
pub type ActionId = Uuid;

/// Serialized action body tagged with the handler that understands it.
///
/// The body is kept as JSON bytes so that blocks stay bincode-encodable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionPayload {
    pub type_id: String,
    pub body: Vec<u8>,
}

impl ActionPayload {
    pub fn new(type_id: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            type_id: type_id.into(),
            body,
        }
    }

    /// Encode `body` as JSON under `type_id`.
    pub fn json<T: Serialize>(type_id: impl Into<String>, body: &T) -> Result<Self, EncodeError> {
        let body = serde_json::to_vec(body).map_err(|e| EncodeError(e.to_string()))?;
        Ok(Self::new(type_id, body))
    }

    /// Decode the JSON body.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// A unit of user intent to be recorded on-chain. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub id: ActionId,
    pub signer: Address,
    pub payload: ActionPayload,
}

impl Action {
    /// Create an action with a fresh random identifier.
    pub fn new(signer: Address, payload: ActionPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            signer,
            payload,
        }
    }

    pub fn type_id(&self) -> &str {
        &self.payload.type_id
    }
}

/// Snapshot of the action ids confirmed by the chain at some tip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessedActionSet {
    ids: HashSet<ActionId>,
}

impl ProcessedActionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the set from the state stored at [`PROCESSED_ACTIONS_ADDRESS`].
    ///
    /// A missing or malformed value is treated as the empty set.
    pub fn from_state(value: Option<&StateValue>) -> Self {
        let ids = value
            .and_then(|v| serde_json::from_value::<Vec<ActionId>>(v.clone()).ok())
            .unwrap_or_default();
        Self {
            ids: ids.into_iter().collect(),
        }
    }

    /// Encode back into a state value, sorted for deterministic output.
    pub fn to_state(&self) -> StateValue {
        let mut ids: Vec<&ActionId> = self.ids.iter().collect();
        ids.sort();
        serde_json::json!(ids)
    }

    pub fn insert(&mut self, id: ActionId) -> bool {
        self.ids.insert(id)
    }

    pub fn contains(&self, id: &ActionId) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl FromIterator<ActionId> for ProcessedActionSet {
    fn from_iter<I: IntoIterator<Item = ActionId>>(iter: I) -> Self {
        Self {
            ids: iter.into_iter().collect(),
        }
    }
}

/// Progress of a bulk block download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDownloadState {
    pub total_block_count: u64,
    pub received_block_count: u64,
}

/// A known remote node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub public_key: PublicKey,
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.public_key, self.host, self.port)
    }
}
