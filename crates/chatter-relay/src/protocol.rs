//! Relay wire protocol — JSON frames between clients and the relay
//!
//! Every frame in either direction is a text frame shaped as
//! `{"event": <name>, "data": <payload>}`.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::RelayError;

/// A serialized outbound frame, shared between every recipient of a broadcast
pub type Frame = Arc<str>;

/// Conversation identifier used as a room key.
///
/// Opaque to the relay. Clients may send it as a JSON string or number; both
/// normalize to the same textual key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl<'de> Deserialize<'de> for RoomId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(serde_json::Number),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(text) => Self(text),
            Raw::Number(number) => Self(number.to_string()),
        })
    }
}

/// Client → relay event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum InboundEvent {
    /// Subscribe this connection to a conversation's room
    JoinChat { room_id: RoomId },
    /// Unsubscribe this connection from one room
    LeaveChat { room_id: RoomId },
    /// Relay an already-stored message to everyone in the room, sender included
    SendMessage { room_id: RoomId, message: Value },
    /// Tell everyone in the room that a stored message was removed
    DeleteMessage { room_id: RoomId, message_id: String },
    /// Client announces which user it belongs to (diagnostics only)
    #[serde(alias = "newUser")]
    NewUser { user_id: String },
    /// Client is going away
    Disconnect,
}

impl InboundEvent {
    /// Parse a raw text frame. Unknown event names and payloads of the wrong
    /// shape are both reported as [`RelayError::InvalidEvent`].
    pub fn parse(raw: &str) -> Result<Self, RelayError> {
        serde_json::from_str(raw).map_err(|e| RelayError::invalid_event(e.to_string()))
    }

    /// Wire name of this event, for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinChat { .. } => events::JOIN_CHAT,
            Self::LeaveChat { .. } => events::LEAVE_CHAT,
            Self::SendMessage { .. } => events::SEND_MESSAGE,
            Self::DeleteMessage { .. } => events::DELETE_MESSAGE,
            Self::NewUser { .. } => events::NEW_USER,
            Self::Disconnect => events::DISCONNECT,
        }
    }
}

/// Relay → client event (fanned out to a room)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEvent {
    pub event: String,
    pub data: Value,
}

impl RelayEvent {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// The stored message record, passed through untouched
    pub fn receive_message(message: Value) -> Self {
        Self::new(events::RECEIVE_MESSAGE, message)
    }

    pub fn message_deleted(message_id: &str) -> Self {
        Self::new(
            events::MESSAGE_DELETED,
            serde_json::json!({ "messageId": message_id }),
        )
    }

    /// Serialize once so a broadcast can share the same bytes across recipients
    pub fn to_frame(&self) -> serde_json::Result<Frame> {
        serde_json::to_string(self).map(Frame::from)
    }
}

// ── Well-known event names ──

pub mod events {
    pub const JOIN_CHAT: &str = "join_chat";
    pub const LEAVE_CHAT: &str = "leave_chat";
    pub const SEND_MESSAGE: &str = "send_message";
    pub const DELETE_MESSAGE: &str = "delete_message";
    pub const NEW_USER: &str = "new_user";
    pub const DISCONNECT: &str = "disconnect";

    pub const RECEIVE_MESSAGE: &str = "receive_message";
    pub const MESSAGE_DELETED: &str = "message_deleted";
}
