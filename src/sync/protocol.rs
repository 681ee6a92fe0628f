//! JSON event protocol for live assessment collaboration.
//!
//! Every frame on the channel is a JSON object of the shape
//! `{ "type": string, "data": object, "timestamp": string }`. Inbound frames are
//! decoded in full before anything is applied, so a malformed frame never
//! leaves partial state behind. Unrecognized `type` values decode to `None`;
//! other consumers of the same channel use them.

use chrono::{DateTime, Utc};
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{FieldId, SessionId, UserId};

/// Inbound `type` discriminators understood by a session
pub const USER_JOINED: &str = "user_joined";
pub const USER_LEFT: &str = "user_left";
pub const CURSOR_UPDATE: &str = "cursor_update";
pub const FORM_UPDATE: &str = "form_update";
pub const CHAT_MESSAGE: &str = "chat_message";
pub const USER_TYPING: &str = "user_typing";

/// Protocol errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Envelope has no string `type` field")]
    MissingType,

    #[error("Invalid `{kind}` payload: {reason}")]
    InvalidPayload { kind: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Pointer location reported by a collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
    #[serde(rename = "fieldId")]
    pub field_id: FieldId,
}

impl CursorPosition {
    pub fn new(x: f64, y: f64, field_id: impl Into<String>) -> Self {
        Self {
            x,
            y,
            field_id: field_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserJoined {
    #[serde(deserialize_with = "id_string")]
    pub user_id: UserId,
    pub user_full_name: String,
    #[serde(default)]
    pub user_email: Option<String>,
    #[serde(deserialize_with = "id_string")]
    pub session_id: SessionId,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserLeft {
    #[serde(deserialize_with = "id_string")]
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CursorMoved {
    #[serde(deserialize_with = "id_string")]
    pub user_id: UserId,
    pub cursor_position: CursorPosition,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FormChanged {
    pub field_id: FieldId,
    pub field_value: Value,
    pub field_type: String,
    #[serde(deserialize_with = "id_string")]
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChatPosted {
    #[serde(default, deserialize_with = "opt_id_string")]
    pub message_id: Option<String>,
    #[serde(deserialize_with = "id_string")]
    pub user_id: UserId,
    pub user_full_name: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TypingChanged {
    #[serde(deserialize_with = "id_string")]
    pub user_id: UserId,
    pub is_typing: bool,
}

/// A decoded inbound event
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    UserJoined(UserJoined),
    UserLeft(UserLeft),
    CursorUpdate(CursorMoved),
    FormUpdate(FormChanged),
    ChatMessage(ChatPosted),
    UserTyping(TypingChanged),
}

impl InboundEvent {
    /// Wire discriminator for this event
    pub fn kind(&self) -> &'static str {
        match self {
            InboundEvent::UserJoined(_) => USER_JOINED,
            InboundEvent::UserLeft(_) => USER_LEFT,
            InboundEvent::CursorUpdate(_) => CURSOR_UPDATE,
            InboundEvent::FormUpdate(_) => FORM_UPDATE,
            InboundEvent::ChatMessage(_) => CHAT_MESSAGE,
            InboundEvent::UserTyping(_) => USER_TYPING,
        }
    }
}

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub event: InboundEvent,
    /// Server-assigned time, if present and parseable
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: Option<Value>,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    timestamp: Option<Value>,
}

/// Messages a session writes to the channel
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    CursorUpdate {
        cursor_position: CursorPosition,
        field_id: FieldId,
    },
    FormUpdate {
        field_id: FieldId,
        field_value: Value,
        field_type: String,
    },
    ChatMessage {
        message: String,
        user_full_name: String,
    },
    UserTyping {
        is_typing: bool,
    },
}

/// Protocol codec for decoding inbound frames and encoding outbound ones
pub struct CollabProtocol;

impl CollabProtocol {
    /// Decode one inbound text frame.
    ///
    /// Returns `Ok(None)` for a well-formed envelope whose `type` this session
    /// does not handle.
    pub fn decode(text: &str) -> Result<Option<Envelope>, ProtocolError> {
        let raw: RawEnvelope =
            serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;

        let kind = match raw.kind {
            Some(Value::String(kind)) => kind,
            _ => return Err(ProtocolError::MissingType),
        };

        let event = match kind.as_str() {
            USER_JOINED => InboundEvent::UserJoined(payload(&kind, raw.data)?),
            USER_LEFT => InboundEvent::UserLeft(payload(&kind, raw.data)?),
            CURSOR_UPDATE => InboundEvent::CursorUpdate(payload(&kind, raw.data)?),
            FORM_UPDATE => InboundEvent::FormUpdate(payload(&kind, raw.data)?),
            CHAT_MESSAGE => InboundEvent::ChatMessage(payload(&kind, raw.data)?),
            USER_TYPING => InboundEvent::UserTyping(payload(&kind, raw.data)?),
            _ => return Ok(None),
        };

        let timestamp = raw
            .timestamp
            .as_ref()
            .and_then(Value::as_str)
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc));

        Ok(Some(Envelope { event, timestamp }))
    }

    /// Encode an outbound message as a JSON text frame
    pub fn encode(msg: &OutboundMessage) -> Result<String, ProtocolError> {
        serde_json::to_string(msg).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

fn payload<T: DeserializeOwned>(kind: &str, data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|e| ProtocolError::InvalidPayload {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}

/// Ids arrive as strings from most backends, as integers from some.
fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!("expected id, got {}", other))),
    }
}

fn opt_id_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(de::Error::custom(format!("expected id, got {}", other))),
    }
}
