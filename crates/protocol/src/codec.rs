//! JSON text codec for observer connections.
//!
//! Each WebSocket text frame carries exactly one JSON object. Decoding
//! separates frames that are broken from frames that are well formed but name
//! a `kind` this version does not know; the latter are ignored by the daemon
//! so newer clients can talk to older daemons.

use serde_json::Value;

use crate::error::{ProtocolError, Result};
use crate::messages::{ClientMessage, ServerEvent};

/// Message kinds accepted from observer connections.
pub const CLIENT_MESSAGE_KINDS: &[&str] = &["subscribe", "unsubscribe", "input", "resize"];

/// Result of decoding one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A recognised message.
    Message(ClientMessage),
    /// A well formed object with an unrecognised `kind`.
    Unknown(String),
}

/// Decodes one inbound text frame.
pub fn decode_client_message(text: &str) -> Result<Inbound> {
    let value: Value = serde_json::from_str(text)?;

    let kind = value
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::MalformedMessage("missing `kind` field".to_string()))?
        .to_string();

    if !CLIENT_MESSAGE_KINDS.contains(&kind.as_str()) {
        return Ok(Inbound::Unknown(kind));
    }

    serde_json::from_value(value)
        .map(Inbound::Message)
        .map_err(|e| ProtocolError::MalformedMessage(format!("{kind}: {e}")))
}

/// Encodes one outbound event as a text frame.
pub fn encode_server_event(event: &ServerEvent) -> Result<String> {
    serde_json::to_string(event).map_err(|e| ProtocolError::Serialization(e.to_string()))
}
