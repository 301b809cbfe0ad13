//! Errors surfaced by the agent API.
//!
//! Construction failures (missing collaborators, no runtime) are fatal to the
//! caller. Lifecycle misuse is reported instead of panicking. Ledger and peer
//! failures inside the background loops never reach this type; the loops log
//! them and retry on their next tick.

use ledger_core::{EncodeError, LedgerError, PeerError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent requires a ledger before building")]
    MissingLedger,

    #[error("agent requires a peer network before building")]
    MissingNetwork,

    #[error("agent requires a private key before building")]
    MissingKey,

    #[error("agent is already running")]
    AlreadyRunning,

    #[error("agent is not running")]
    NotRunning,

    #[error("agent was stopped and cannot be restarted")]
    Stopped,

    #[error("agent must be started from within a tokio runtime")]
    NoRuntime,

    #[error("agent worker join failed")]
    WorkerJoin(#[source] tokio::task::JoinError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error(transparent)]
    Encode(#[from] EncodeError),
}
