//! secp256k1 key material and ECDSA signatures.
//!
//! Signatures are computed over the SHA-256 digest of the canonical encoding
//! of whatever is being signed.

use std::fmt;

use secp256k1::{Message, SECP256K1, SecretKey, ecdsa};
use serde::{Deserialize, Serialize};

use crate::types::{Address, sha256};

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("invalid signature encoding: {0}")]
    InvalidSignature(String),
}

/// Secret signing key owned exclusively by one agent.
#[derive(Clone)]
pub struct PrivateKey {
    inner: SecretKey,
}

impl PrivateKey {
    /// Generate a fresh key from the thread-local RNG.
    pub fn generate() -> Self {
        Self {
            inner: SecretKey::new(&mut secp256k1::rand::thread_rng()),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        SecretKey::from_slice(bytes)
            .map(|inner| Self { inner })
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s.trim().trim_start_matches("0x"))?;
        Self::from_bytes(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.inner.secret_bytes())
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            inner: secp256k1::PublicKey::from_secret_key(SECP256K1, &self.inner),
        }
    }

    pub fn address(&self) -> Address {
        self.public_key().address()
    }

    /// Sign the SHA-256 digest of `bytes`.
    pub fn sign(&self, bytes: &[u8]) -> Signature {
        let message = Message::from_digest(sha256(bytes).0);
        Signature {
            inner: SECP256K1.sign_ecdsa(&message, &self.inner),
        }
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

/// Compressed secp256k1 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct PublicKey {
    inner: secp256k1::PublicKey,
}

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        secp256k1::PublicKey::from_slice(bytes)
            .map(|inner| Self { inner })
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s.trim().trim_start_matches("0x"))?;
        Self::from_bytes(&bytes)
    }

    pub fn to_bytes(&self) -> [u8; 33] {
        self.inner.serialize()
    }

    pub fn address(&self) -> Address {
        Address::from_public_key(self)
    }

    /// Check `signature` against the SHA-256 digest of `bytes`.
    pub fn verify(&self, bytes: &[u8], signature: &Signature) -> bool {
        let message = Message::from_digest(sha256(bytes).0);
        SECP256K1
            .verify_ecdsa(&message, &signature.inner, &self.inner)
            .is_ok()
    }
}

impl TryFrom<Vec<u8>> for PublicKey {
    type Error = CryptoError;

    fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
        Self::from_bytes(&bytes)
    }
}

impl From<PublicKey> for Vec<u8> {
    fn from(key: PublicKey) -> Self {
        key.to_bytes().to_vec()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.to_bytes()))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self)
    }
}

/// Compact 64-byte ECDSA signature.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct Signature {
    inner: ecdsa::Signature,
}

impl TryFrom<Vec<u8>> for Signature {
    type Error = CryptoError;

    fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
        ecdsa::Signature::from_compact(&bytes)
            .map(|inner| Self { inner })
            .map_err(|e| CryptoError::InvalidSignature(e.to_string()))
    }
}

impl From<Signature> for Vec<u8> {
    fn from(signature: Signature) -> Self {
        signature.inner.serialize_compact().to_vec()
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Signature({})",
            hex::encode(&self.inner.serialize_compact()[..8])
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let key = PrivateKey::generate();
        let signature = key.sign(b"stage me");

        assert!(key.public_key().verify(b"stage me", &signature));
        assert!(!key.public_key().verify(b"stage you", &signature));

        let other = PrivateKey::generate();
        assert!(!other.public_key().verify(b"stage me", &signature));
    }

    #[test]
    fn hex_round_trip_keeps_identity() {
        let key = PrivateKey::generate();
        let restored = PrivateKey::from_hex(&key.to_hex()).unwrap();
        assert_eq!(restored.address(), key.address());

        let public = PublicKey::from_hex(&key.public_key().to_string()).unwrap();
        assert_eq!(public, key.public_key());
    }

    #[test]
    fn rejects_bad_key_material() {
        assert!(PrivateKey::from_hex("zz").is_err());
        assert!(PrivateKey::from_bytes(&[0u8; 32]).is_err());
        assert!(PublicKey::from_bytes(&[1u8; 10]).is_err());
    }
}
