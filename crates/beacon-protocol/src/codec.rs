//! JSON codec for Beacon messages.
//!
//! Inbound frames are classified before being decoded so that the server can
//! tell a frame with an unknown `type` apart from a frame that is simply broken.

use serde_json::Value;
use thiserror::Error;

use crate::messages::{ClientMessage, ErrorCode, ServerMessage};

/// Default maximum inbound frame size (64 KiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Message types a client may send.
pub const CLIENT_MESSAGE_TYPES: [&str; 3] = ["subscribe", "unsubscribe", "ping"];

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds the configured maximum size.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Frame is not valid JSON.
    #[error("Invalid message format: {0}")]
    Malformed(#[source] serde_json::Error),

    /// Frame is valid JSON but not an object.
    #[error("Invalid message format: expected a JSON object")]
    NotAnObject,

    /// Frame has no string `type` field.
    #[error("Invalid message type: missing 'type' field")]
    MissingType,

    /// Frame `type` is not one the server understands.
    #[error("Invalid message type: {0}")]
    UnknownType(String),

    /// Frame has a known `type` but its fields are invalid.
    #[error("Invalid {kind} message: {source}")]
    InvalidFields {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    /// Message could not be serialized.
    #[error("Encoding error: {0}")]
    Encode(#[source] serde_json::Error),
}

impl ProtocolError {
    /// Error code reported to the client for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::MissingType | ProtocolError::UnknownType(_) => ErrorCode::InvalidType,
            ProtocolError::Encode(_) => ErrorCode::InternalError,
            _ => ErrorCode::InvalidFormat,
        }
    }
}

/// Decode a client frame with the default size limit.
///
/// # Errors
///
/// Returns an error if the frame is too large, malformed, or of an unknown type.
pub fn decode(text: &str) -> Result<ClientMessage, ProtocolError> {
    decode_with_limit(text, DEFAULT_MAX_FRAME_SIZE)
}

/// Decode a client frame, rejecting frames larger than `max_size` bytes.
///
/// # Errors
///
/// Returns an error if the frame is too large, malformed, or of an unknown type.
pub fn decode_with_limit(text: &str, max_size: usize) -> Result<ClientMessage, ProtocolError> {
    if text.len() > max_size {
        return Err(ProtocolError::FrameTooLarge {
            size: text.len(),
            max: max_size,
        });
    }

    let value: Value = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;

    let kind = match &value {
        Value::Object(map) => match map.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            _ => return Err(ProtocolError::MissingType),
        },
        _ => return Err(ProtocolError::NotAnObject),
    };

    if !CLIENT_MESSAGE_TYPES.contains(&kind.as_str()) {
        return Err(ProtocolError::UnknownType(kind));
    }

    serde_json::from_value(value).map_err(|source| ProtocolError::InvalidFields { kind, source })
}

/// Encode a server message to JSON text.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(message: &ServerMessage) -> Result<String, ProtocolError> {
    serde_json::to_string(message).map_err(ProtocolError::Encode)
}
