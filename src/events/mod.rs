//! Event system for real-time state notifications
//!
//! Channel and session lifecycle changes are broadcast here and forwarded
//! to `/api/ws` subscribers.

pub mod types;

pub use types::{IngestKind, SystemEvent};

use tokio::sync::broadcast;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Broadcasts [`SystemEvent`]s to every active subscriber.
pub struct EventBus {
    tx: broadcast::Sender<SystemEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Dropped silently when nobody listens.
    pub fn publish(&self, event: SystemEvent) {
        tracing::trace!(event = event.event_name(), "Publishing event");
        let _ = self.tx.send(event);
    }

    /// Subscribe to future events. Slow receivers see `Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
