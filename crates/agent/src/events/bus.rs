//! Topic-based event bus implementation.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};
use tokio::sync::broadcast;

use super::types::{ActionEvent, ChainEvent, PreloadEvent};

/// Topics for event routing
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize, Display, EnumIter)]
pub enum Topic {
    /// Initial block download progress
    Preload,
    /// Tip movement, mined and rejected blocks
    Chain,
    /// Staging, evaluation results, and dropped actions
    Action,
}

/// Event wrapper that carries the topic and typed event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    Preload(PreloadEvent),
    Chain(ChainEvent),
    Action(ActionEvent),
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::Preload(_) => Topic::Preload,
            Event::Chain(_) => Topic::Chain,
            Event::Action(_) => Topic::Action,
        }
    }
}

impl From<PreloadEvent> for Event {
    fn from(event: PreloadEvent) -> Self {
        Event::Preload(event)
    }
}

impl From<ChainEvent> for Event {
    fn from(event: ChainEvent) -> Self {
        Event::Chain(event)
    }
}

impl From<ActionEvent> for Event {
    fn from(event: ActionEvent) -> Self {
        Event::Action(event)
    }
}

/// Topic-based event bus
///
/// Each topic owns a broadcast channel created up front, so publishing and
/// subscribing never contend on a lock. Dropping a receiver unsubscribes it.
#[derive(Clone)]
pub struct EventBus {
    preload: broadcast::Sender<Event>,
    chain: broadcast::Sender<Event>,
    action: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            preload: broadcast::channel(capacity).0,
            chain: broadcast::channel(capacity).0,
            action: broadcast::channel(capacity).0,
        }
    }

    fn sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::Preload => &self.preload,
            Topic::Chain => &self.chain,
            Topic::Action => &self.action,
        }
    }

    /// Publish an event to its corresponding topic
    pub fn publish(&self, event: impl Into<Event>) {
        let event = event.into();
        let topic = event.topic();
        if self.sender(topic).send(event).is_err() {
            // No subscribers for this topic - this is normal, not an error
            tracing::trace!("No subscribers for topic {}", topic);
        }
    }

    /// Subscribe to a specific topic
    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<Event> {
        self.sender(topic).subscribe()
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.sender(topic).receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
