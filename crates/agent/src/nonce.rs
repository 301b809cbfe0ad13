//! Single issuer of transaction nonces for the agent identity.
//!
//! The stager and the miner both sign transactions with the same key. Each
//! signs and stages while holding the authority's lock, so the order nonces
//! are handed out in is the order transactions reach the stage pool.

use std::sync::Arc;

use chrono::Utc;
use ledger_core::{Action, Ledger, PrivateKey, Transaction};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::actions::REWARD_GOLD;
use crate::error::Result;

#[derive(Debug, Default)]
pub struct NonceAuthority {
    lock: Mutex<()>,
}

impl NonceAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sign `actions` with the next free nonce and stage the transaction.
    ///
    /// Either the transaction ends up staged or nothing changed.
    pub async fn sign_and_stage(
        &self,
        ledger: &Arc<dyn Ledger>,
        key: &PrivateKey,
        actions: Vec<Action>,
    ) -> Result<Transaction> {
        let _guard = self.lock.lock().await;

        let nonce = ledger.next_nonce(&key.address());
        let tx = Transaction::create(key, nonce, actions, Utc::now())?;
        ledger.stage_transaction(tx.clone())?;

        debug!(tx_id = %tx.id, nonce, "Staged transaction");
        Ok(tx)
    }

    /// Unstage `tx` and close the nonce gap it leaves behind.
    ///
    /// Our transactions staged after `tx` are re-signed with consecutive
    /// nonces starting at the freed one. Returns the re-signed transactions
    /// so they can be broadcast again. If `tx` was no longer staged (it made
    /// it into a block after all) nothing else changes.
    pub async fn rollback(
        &self,
        ledger: &Arc<dyn Ledger>,
        key: &PrivateKey,
        tx: &Transaction,
    ) -> Result<Vec<Transaction>> {
        let _guard = self.lock.lock().await;

        if ledger.unstage_transaction(&tx.id).is_none() {
            debug!(tx_id = %tx.id, "Rollback target no longer staged");
            return Ok(Vec::new());
        }

        let signer = key.address();
        let later: Vec<Transaction> = ledger
            .staged_transactions()
            .into_iter()
            .filter(|staged| staged.signer == signer && staged.nonce > tx.nonce)
            .collect();
        for staged in &later {
            ledger.unstage_transaction(&staged.id);
        }

        let mut restaged = Vec::with_capacity(later.len());
        for staged in later {
            let nonce = ledger.next_nonce(&signer);
            let resigned = Transaction::create(key, nonce, staged.actions, Utc::now())?;
            if let Err(e) = ledger.stage_transaction(resigned.clone()) {
                // Its actions are still pending and will be retried.
                warn!(tx_id = %resigned.id, nonce, error = %e, "Failed to restage transaction");
                continue;
            }
            debug!(old = %staged.id, new = %resigned.id, nonce, "Re-sequenced transaction");
            restaged.push(resigned);
        }

        Ok(restaged)
    }

    /// Re-sign our pending transactions after the chain under them changed.
    ///
    /// `orphaned` holds ours from discarded blocks, in chain order. They and
    /// every one of ours still staged are re-signed in that order with
    /// consecutive nonces from the new confirmed nonce. Reward actions are
    /// left out, since a reward belongs to the block it was mined with.
    pub async fn resequence(
        &self,
        ledger: &Arc<dyn Ledger>,
        key: &PrivateKey,
        orphaned: Vec<Transaction>,
    ) -> Result<Vec<Transaction>> {
        let _guard = self.lock.lock().await;

        let signer = key.address();
        let mut pending = orphaned;
        for staged in ledger.staged_transactions() {
            if staged.signer == signer {
                ledger.unstage_transaction(&staged.id);
                pending.push(staged);
            }
        }

        let mut restaged = Vec::with_capacity(pending.len());
        for tx in pending {
            let actions: Vec<Action> = tx
                .actions
                .into_iter()
                .filter(|action| action.type_id() != REWARD_GOLD)
                .collect();
            if actions.is_empty() {
                continue;
            }
            let nonce = ledger.next_nonce(&signer);
            let resigned = Transaction::create(key, nonce, actions, Utc::now())?;
            if let Err(e) = ledger.stage_transaction(resigned.clone()) {
                warn!(tx_id = %resigned.id, nonce, error = %e, "Failed to restage transaction");
                continue;
            }
            debug!(old = %tx.id, new = %resigned.id, nonce, "Re-signed transaction");
            restaged.push(resigned);
        }

        Ok(restaged)
    }
}
