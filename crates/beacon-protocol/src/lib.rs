//! # beacon-protocol
//!
//! Wire protocol definitions for the Beacon subscription broker.
//!
//! Clients subscribe to topics (entity types) and receive an initial snapshot
//! followed by `event` messages whenever a matching entity is created, updated
//! or deleted. All messages are JSON objects with a `type` field.
//!
//! ## Client messages
//!
//! - `subscribe` - Start receiving changes on a topic
//! - `unsubscribe` - Stop receiving changes, by subscription id or topic
//! - `ping` - Keepalive, answered with `pong`
//!
//! ## Example
//!
//! ```rust
//! use beacon_protocol::{codec, ClientMessage};
//!
//! let msg = codec::decode(r#"{"type":"subscribe","topic":"payment"}"#).unwrap();
//! assert_eq!(msg, ClientMessage::subscribe("payment"));
//! ```

pub mod codec;
pub mod messages;

pub use codec::{decode, encode, ProtocolError};
pub use messages::{
    now_rfc3339, ClientMessage, ErrorCode, EventType, ServerMessage, Snapshot, SubscriptionParams,
};
