//! Event Bus - pub/sub for swarm events
//!
//! Components emit events; the event log and the CLI subscribe.

use tokio::sync::broadcast;
use tracing::debug;

use super::types::SwarmEvent;

/// Default channel capacity (events)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4_096;

/// Central event bus built on a tokio broadcast channel
pub struct EventBus {
    tx: broadcast::Sender<SwarmEvent>,
}

impl EventBus {
    /// Create a new event bus with the given capacity
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "EventBus::new: creating event bus");
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Create a new event bus with default capacity
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Emit an event to all subscribers
    ///
    /// Fire-and-forget: without subscribers the event is dropped, and a slow
    /// subscriber loses the oldest events.
    pub fn emit(&self, event: SwarmEvent) {
        debug!(event_type = event.event_type(), task_id = ?event.task_id(), "EventBus::emit");
        let _ = self.tx.send(event);
    }

    /// Report a component error that was handled by giving up
    pub fn emit_error(&self, component: &str, message: impl Into<String>) {
        self.emit(SwarmEvent::Error {
            component: component.to_string(),
            message: message.into(),
        });
    }

    /// Subscribe to events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SwarmEvent> {
        debug!("EventBus::subscribe: new subscriber");
        self.tx.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}
