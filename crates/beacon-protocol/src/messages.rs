//! Message types for the Beacon protocol.
//!
//! Clients send [`ClientMessage`]s and receive [`ServerMessage`]s. Both are
//! JSON objects discriminated by a `type` field.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Kind of change that happened to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Created,
    Updated,
    Deleted,
}

impl EventType {
    /// All event types, in wire order.
    pub const ALL: [EventType; 3] = [EventType::Created, EventType::Updated, EventType::Deleted];

    /// Wire name of the event type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Created => "created",
            EventType::Updated => "updated",
            EventType::Deleted => "deleted",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error codes carried by `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Subscribing requires an authenticated connection.
    AuthRequired,
    /// The connection already holds the maximum number of subscriptions.
    MaxSubscriptions,
    /// The requested topic is not registered.
    InvalidTopic,
    /// The frame's `type` is missing or unknown.
    InvalidType,
    /// The frame could not be parsed or failed validation.
    InvalidFormat,
    /// No plugin serves the requested topic.
    PluginNotFound,
    /// No subscription matched an unsubscribe request.
    SubscriptionNotFound,
    /// The server failed while serving the request.
    InternalError,
}

impl ErrorCode {
    /// Wire name of the error code.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AuthRequired => "AUTH_REQUIRED",
            ErrorCode::MaxSubscriptions => "MAX_SUBSCRIPTIONS",
            ErrorCode::InvalidTopic => "INVALID_TOPIC",
            ErrorCode::InvalidType => "INVALID_TYPE",
            ErrorCode::InvalidFormat => "INVALID_FORMAT",
            ErrorCode::PluginNotFound => "PLUGIN_NOT_FOUND",
            ErrorCode::SubscriptionNotFound => "SUBSCRIPTION_NOT_FOUND",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters attached to a `subscribe` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionParams {
    /// Event types to deliver. Empty or absent means all of them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub event_types: Vec<EventType>,
    /// Equality filters applied to the initial snapshot.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub filters: Map<String, Value>,
}

impl SubscriptionParams {
    /// Params selecting the given event types.
    #[must_use]
    pub fn for_events(event_types: impl IntoIterator<Item = EventType>) -> Self {
        Self {
            event_types: event_types.into_iter().collect(),
            filters: Map::new(),
        }
    }
}

/// A message sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Subscribe to changes on a topic.
    Subscribe {
        topic: String,
        #[serde(default)]
        params: SubscriptionParams,
    },

    /// Drop a subscription, addressed by id or by topic.
    Unsubscribe {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subscription_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        topic: Option<String>,
    },

    /// Keepalive.
    Ping {},
}

impl ClientMessage {
    /// Wire name of the message type.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Subscribe { .. } => "subscribe",
            ClientMessage::Unsubscribe { .. } => "unsubscribe",
            ClientMessage::Ping {} => "ping",
        }
    }

    /// Create a `subscribe` message for all event types.
    #[must_use]
    pub fn subscribe(topic: impl Into<String>) -> Self {
        ClientMessage::Subscribe {
            topic: topic.into(),
            params: SubscriptionParams::default(),
        }
    }

    /// Create an `unsubscribe` message addressed by subscription id.
    #[must_use]
    pub fn unsubscribe_id(subscription_id: impl Into<String>) -> Self {
        ClientMessage::Unsubscribe {
            subscription_id: Some(subscription_id.into()),
            topic: None,
        }
    }

    /// Create an `unsubscribe` message addressed by topic.
    #[must_use]
    pub fn unsubscribe_topic(topic: impl Into<String>) -> Self {
        ClientMessage::Unsubscribe {
            subscription_id: None,
            topic: Some(topic.into()),
        }
    }
}

/// Initial state served to a new subscriber.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Current records, newest first.
    pub items: Vec<Value>,
    /// Number of records matching the subscription, which may exceed `items.len()`.
    pub total: u64,
}

/// A message sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// A subscription was created.
    Subscribed {
        topic: String,
        subscription_id: String,
        timestamp: String,
        data: Snapshot,
    },

    /// A subscription was removed.
    Unsubscribed {
        topic: String,
        subscription_id: String,
        timestamp: String,
    },

    /// An entity on a subscribed topic changed.
    Event {
        topic: String,
        event_type: EventType,
        subscription_id: String,
        /// Shared between every recipient of the same event.
        data: Arc<Value>,
        timestamp: String,
    },

    /// Reply to `ping`.
    Pong { timestamp: String },

    /// A request failed.
    Error {
        timestamp: String,
        message: String,
        code: ErrorCode,
    },
}

impl ServerMessage {
    /// Wire name of the message type.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Subscribed { .. } => "subscribed",
            ServerMessage::Unsubscribed { .. } => "unsubscribed",
            ServerMessage::Event { .. } => "event",
            ServerMessage::Pong { .. } => "pong",
            ServerMessage::Error { .. } => "error",
        }
    }

    /// Create a `subscribed` message.
    #[must_use]
    pub fn subscribed(
        topic: impl Into<String>,
        subscription_id: impl Into<String>,
        data: Snapshot,
    ) -> Self {
        ServerMessage::Subscribed {
            topic: topic.into(),
            subscription_id: subscription_id.into(),
            timestamp: now_rfc3339(),
            data,
        }
    }

    /// Create an `unsubscribed` message.
    #[must_use]
    pub fn unsubscribed(topic: impl Into<String>, subscription_id: impl Into<String>) -> Self {
        ServerMessage::Unsubscribed {
            topic: topic.into(),
            subscription_id: subscription_id.into(),
            timestamp: now_rfc3339(),
        }
    }

    /// Create an `event` message.
    #[must_use]
    pub fn event(
        topic: impl Into<String>,
        event_type: EventType,
        subscription_id: impl Into<String>,
        data: Arc<Value>,
        timestamp: impl Into<String>,
    ) -> Self {
        ServerMessage::Event {
            topic: topic.into(),
            event_type,
            subscription_id: subscription_id.into(),
            data,
            timestamp: timestamp.into(),
        }
    }

    /// Create a `pong` message stamped with the current time.
    #[must_use]
    pub fn pong() -> Self {
        ServerMessage::Pong {
            timestamp: now_rfc3339(),
        }
    }

    /// Create an `error` message.
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            timestamp: now_rfc3339(),
            message: message.into(),
            code,
        }
    }

    /// Error code, if this is an `error` message.
    #[must_use]
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            ServerMessage::Error { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Current UTC time as an RFC 3339 string with millisecond precision.
#[must_use]
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
