//! Background loops driven by the agent.
//!
//! Each worker owns an `Arc` of the shared context and a cancellation token,
//! and isolates its own failures: a bad tick is logged and the loop carries
//! on.

mod miner;
mod stager;
mod sync;
mod tracker;

pub(crate) use miner::MinerLoop;
pub(crate) use stager::TransactionStager;
pub(crate) use sync::SyncCoordinator;
pub(crate) use tracker::ProcessedActionTracker;
