//! Signed transactions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::{PrivateKey, PublicKey, Signature};
use crate::types::{Action, Address, EncodeError, HashDigest, encode, sha256};

/// Transaction identifier: SHA-256 of the signed encoding.
pub type TxId = HashDigest;

/// Ordered batch of actions signed by one identity.
///
/// Immutable after signing. Lifecycle: created, staged, then either included
/// in a block or unstaged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TxId,
    pub signer: Address,
    pub public_key: PublicKey,
    pub nonce: u64,
    pub timestamp: DateTime<Utc>,
    pub actions: Vec<Action>,
    pub signature: Signature,
}

#[derive(Serialize)]
struct UnsignedTransaction<'a> {
    signer: &'a Address,
    public_key: &'a PublicKey,
    nonce: u64,
    timestamp: &'a DateTime<Utc>,
    actions: &'a [Action],
}

#[derive(Serialize)]
struct SignedTransaction<'a> {
    unsigned: UnsignedTransaction<'a>,
    signature: &'a Signature,
}

impl Transaction {
    /// Build and sign a transaction with the given nonce.
    pub fn create(
        key: &PrivateKey,
        nonce: u64,
        actions: Vec<Action>,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, EncodeError> {
        let public_key = key.public_key();
        let signer = public_key.address();

        let unsigned = UnsignedTransaction {
            signer: &signer,
            public_key: &public_key,
            nonce,
            timestamp: &timestamp,
            actions: &actions,
        };
        let signature = key.sign(&encode(&unsigned)?);
        let id = sha256(&encode(&SignedTransaction {
            unsigned,
            signature: &signature,
        })?);

        Ok(Self {
            id,
            signer,
            public_key,
            nonce,
            timestamp,
            actions,
            signature,
        })
    }

    fn unsigned(&self) -> UnsignedTransaction<'_> {
        UnsignedTransaction {
            signer: &self.signer,
            public_key: &self.public_key,
            nonce: self.nonce,
            timestamp: &self.timestamp,
            actions: &self.actions,
        }
    }

    /// Check the signature, the signer/key binding, and the id.
    pub fn verify(&self) -> bool {
        if self.public_key.address() != self.signer {
            return false;
        }
        if self.actions.iter().any(|a| a.signer != self.signer) {
            return false;
        }

        let Ok(unsigned_bytes) = encode(&self.unsigned()) else {
            return false;
        };
        if !self.public_key.verify(&unsigned_bytes, &self.signature) {
            return false;
        }

        encode(&SignedTransaction {
            unsigned: self.unsigned(),
            signature: &self.signature,
        })
        .map(|bytes| sha256(&bytes) == self.id)
        .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ActionPayload;

    fn action_for(key: &PrivateKey) -> Action {
        Action::new(key.address(), ActionPayload::new("noop", Vec::new()))
    }

    #[test]
    fn created_transaction_verifies() {
        let key = PrivateKey::generate();
        let tx = Transaction::create(&key, 4, vec![action_for(&key)], Utc::now()).unwrap();

        assert!(tx.verify());
        assert_eq!(tx.signer, key.address());
        assert_eq!(tx.nonce, 4);
    }

    #[test]
    fn tampering_breaks_verification() {
        let key = PrivateKey::generate();
        let mut tx = Transaction::create(&key, 0, vec![action_for(&key)], Utc::now()).unwrap();
        tx.nonce = 1;
        assert!(!tx.verify());
    }

    #[test]
    fn foreign_action_signer_is_rejected() {
        let key = PrivateKey::generate();
        let other = PrivateKey::generate();
        let tx = Transaction::create(&key, 0, vec![action_for(&other)], Utc::now()).unwrap();
        assert!(!tx.verify());
    }

    #[test]
    fn same_content_different_nonce_has_different_id() {
        let key = PrivateKey::generate();
        let action = action_for(&key);
        let now = Utc::now();
        let a = Transaction::create(&key, 0, vec![action.clone()], now).unwrap();
        let b = Transaction::create(&key, 1, vec![action], now).unwrap();
        assert_ne!(a.id, b.id);
    }
}
