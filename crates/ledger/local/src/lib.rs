//! In-process implementations of the ledger collaborators.
//!
//! - [`LocalLedger`]: hash-linked chain with stage pool, proof-of-work miner,
//!   and action evaluation, optionally persisted through [`FileBlockStore`]
//! - [`NetworkHub`] / [`HubPeer`]: peer network connecting ledgers that live
//!   in the same process

pub mod ledger;
pub mod network;
pub mod store;

pub use ledger::LocalLedger;
pub use network::{HubPeer, NetworkHub};
pub use store::{FileBlockStore, StoreError};
