//! Entity change events.
//!
//! Events are never persisted; they live only for the duration of a broadcast.

use beacon_protocol::{now_rfc3339, EventType, ServerMessage};
use serde_json::Value;
use std::sync::Arc;

/// A change to one entity on a topic.
#[derive(Debug, Clone)]
pub struct Event {
    /// Topic the entity belongs to.
    pub topic: String,
    /// Kind of change.
    pub event_type: EventType,
    /// Wire payload, shared by every recipient.
    pub payload: Arc<Value>,
    /// When the event was published.
    pub timestamp: String,
}

impl Event {
    /// Create an event stamped with the current time.
    #[must_use]
    pub fn new(topic: impl Into<String>, event_type: EventType, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            event_type,
            payload: Arc::new(payload),
            timestamp: now_rfc3339(),
        }
    }

    /// Build the `event` message delivered for one subscription.
    #[must_use]
    pub fn to_message(&self, subscription_id: &str) -> ServerMessage {
        ServerMessage::event(
            self.topic.clone(),
            self.event_type,
            subscription_id,
            Arc::clone(&self.payload),
            self.timestamp.clone(),
        )
    }
}
