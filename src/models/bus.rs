//! Events relayed between broker instances over the message bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::presence::SessionStatus;
use super::session::Role;
use crate::error::AppResult;

/// Logical event kinds, one bus channel each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusEventKind {
    ChatMessage,
    Typing,
    PresenceChanged,
}

/// Kind to channel name mapping; a configured prefix is prepended at runtime.
const CHANNEL_TABLE: [(BusEventKind, &str); 3] = [
    (BusEventKind::ChatMessage, "chat-messages"),
    (BusEventKind::Typing, "typing-indicators"),
    (BusEventKind::PresenceChanged, "connection-status"),
];

impl BusEventKind {
    pub const ALL: [BusEventKind; 3] = [
        BusEventKind::ChatMessage,
        BusEventKind::Typing,
        BusEventKind::PresenceChanged,
    ];

    pub fn channel_name(self) -> &'static str {
        CHANNEL_TABLE
            .iter()
            .find(|(kind, _)| *kind == self)
            .map(|(_, name)| *name)
            .unwrap_or("chat-messages")
    }

    pub fn from_channel_name(name: &str) -> Option<Self> {
        CHANNEL_TABLE
            .iter()
            .find(|(_, channel)| *channel == name)
            .map(|(kind, _)| *kind)
    }
}

/// Why a status update was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusReason {
    UserConnected,
    UserDisconnected,
}

/// Chat message as produced by the chat backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub session_id: Uuid,
    #[serde(default)]
    pub sender_id: Option<String>,
    pub sender_type: String,
    pub message: String,
    #[serde(default = "default_message_type")]
    pub message_type: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

pub(crate) fn default_message_type() -> String {
    "text".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingEvent {
    pub session_id: Uuid,
    pub user_id: String,
    #[serde(rename = "user_type")]
    pub role: Role,
    pub is_typing: bool,
    pub timestamp: DateTime<Utc>,
    /// Broker instance that published the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatusEvent {
    pub session_id: Uuid,
    pub connection_status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<StatusReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_user_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Uuid>,
}

/// Envelope for everything that travels on the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    ChatMessage(ChatMessage),
    Typing(TypingEvent),
    PresenceChanged(ConnectionStatusEvent),
}

impl BusEvent {
    pub fn kind(&self) -> BusEventKind {
        match self {
            BusEvent::ChatMessage(_) => BusEventKind::ChatMessage,
            BusEvent::Typing(_) => BusEventKind::Typing,
            BusEvent::PresenceChanged(_) => BusEventKind::PresenceChanged,
        }
    }

    pub fn session_id(&self) -> Uuid {
        match self {
            BusEvent::ChatMessage(m) => m.session_id,
            BusEvent::Typing(t) => t.session_id,
            BusEvent::PresenceChanged(s) => s.session_id,
        }
    }

    pub fn origin(&self) -> Option<Uuid> {
        match self {
            BusEvent::ChatMessage(_) => None,
            BusEvent::Typing(t) => t.origin,
            BusEvent::PresenceChanged(s) => s.origin,
        }
    }

    /// Serialize the payload carried as the bus message value.
    pub fn encode(&self) -> AppResult<String> {
        let payload = match self {
            BusEvent::ChatMessage(m) => serde_json::to_string(m)?,
            BusEvent::Typing(t) => serde_json::to_string(t)?,
            BusEvent::PresenceChanged(s) => serde_json::to_string(s)?,
        };
        Ok(payload)
    }

    /// Decode a message value received on the channel of `kind`.
    pub fn decode(kind: BusEventKind, payload: &str) -> AppResult<Self> {
        let event = match kind {
            BusEventKind::ChatMessage => BusEvent::ChatMessage(serde_json::from_str(payload)?),
            BusEventKind::Typing => BusEvent::Typing(serde_json::from_str(payload)?),
            BusEventKind::PresenceChanged => {
                BusEvent::PresenceChanged(serde_json::from_str(payload)?)
            }
        };
        Ok(event)
    }
}
