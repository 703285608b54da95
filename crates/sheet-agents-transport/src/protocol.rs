//! Wire protocol for client-server communication.
//!
//! Every frame is a JSON object tagged by `type`. Clients send `ping` or a
//! command envelope; the server answers with control frames or wraps session
//! events as `{"type":"event","event":"<name>",...}`.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sheet_agents_core::{Envelope, Event, traits::SessionId};
use thiserror::Error;

/// Frame decode error.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Frame is not valid UTF-8")]
    NotUtf8,
    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid command: {reason}")]
    InvalidCommand {
        request_id: Option<String>,
        reason: String,
    },
}

impl ProtocolError {
    /// Correlation id of the rejected frame, when it carried one.
    #[must_use]
    pub fn request_id(&self) -> Option<String> {
        match self {
            Self::InvalidCommand { request_id, .. } => request_id.clone(),
            _ => None,
        }
    }
}

/// Message from client to server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Keepalive.
    Ping,
    /// A command for this connection's session.
    Command(Envelope),
}

impl ClientMessage {
    /// Decode a text frame.
    ///
    /// # Errors
    /// Returns [`ProtocolError`] if the frame is not JSON or not a known command.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: JsonValue = serde_json::from_str(text)?;
        if value.get("type").and_then(JsonValue::as_str) == Some("ping") {
            return Ok(Self::Ping);
        }

        let request_id = value
            .get("request_id")
            .and_then(JsonValue::as_str)
            .map(str::to_string);
        serde_json::from_value(value)
            .map(Self::Command)
            .map_err(|e| ProtocolError::InvalidCommand {
                request_id,
                reason: e.to_string(),
            })
    }

    /// Decode a binary frame holding UTF-8 JSON.
    ///
    /// # Errors
    /// Returns [`ProtocolError::NotUtf8`] for non-UTF-8 payloads, otherwise as
    /// [`decode`](Self::decode).
    pub fn decode_binary(data: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(data).map_err(|_| ProtocolError::NotUtf8)?;
        Self::decode(text)
    }
}

/// Message from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Session bound to this connection.
    SessionStarted { session_id: SessionId },
    /// Pong response.
    Pong,
    /// A frame could not be decoded.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        message: String,
    },
    /// Session event.
    Event(Event),
}

impl ServerMessage {
    #[must_use]
    pub fn error(err: &ProtocolError) -> Self {
        Self::Error {
            request_id: err.request_id(),
            message: err.to_string(),
        }
    }

    /// Encode as a text frame.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<Event> for ServerMessage {
    fn from(event: Event) -> Self {
        Self::Event(event)
    }
}
