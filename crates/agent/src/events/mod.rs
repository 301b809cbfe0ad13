//! Topic-based event bus for agent events.
//!
//! Observers subscribe to the topics they care about; background loops
//! publish without knowing who listens.

mod bus;
mod types;

pub use bus::{Event, EventBus, Topic};
pub use types::{ActionEvent, ChainEvent, DropReason, PreloadEvent, TipSnapshot};
