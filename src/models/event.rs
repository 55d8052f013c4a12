//! WebSocket frames exchanged with clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::bus::{
    default_message_type, ChatMessage, ConnectionStatusEvent, StatusReason, TypingEvent,
};
use super::presence::SessionStatus;
use crate::error::{AppError, AppResult};

/// Raw inbound frame: `{type, session_id, user_id, user_type, data, timestamp}`.
///
/// Identity fields are informational; the connection's path identity is authoritative.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub user_type: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub timestamp: Option<Value>,
}

/// Payload of `send_message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub message: String,
    #[serde(default = "default_message_type")]
    pub message_type: String,
    #[serde(default)]
    pub attachments: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TypingData {
    #[serde(default)]
    is_typing: Option<bool>,
}

/// Classified client message, decoded once at the socket boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    JoinSession,
    Typing { is_typing: bool },
    SendMessage(SendMessageRequest),
    Ping,
}

impl ClientMessage {
    pub fn parse(text: &str) -> AppResult<Self> {
        let frame: InboundFrame = serde_json::from_str(text)?;
        Self::from_frame(frame)
    }

    pub fn from_frame(frame: InboundFrame) -> AppResult<Self> {
        match frame.kind.as_str() {
            "join_session" => Ok(ClientMessage::JoinSession),
            "typing_start" | "agent_typing" => {
                // A non-object payload keeps the default of "typing".
                let data: TypingData = frame
                    .data
                    .and_then(|d| serde_json::from_value(d).ok())
                    .unwrap_or_default();
                Ok(ClientMessage::Typing {
                    is_typing: data.is_typing.unwrap_or(true),
                })
            }
            "typing_stop" => Ok(ClientMessage::Typing { is_typing: false }),
            "send_message" => {
                let data = frame
                    .data
                    .ok_or_else(|| AppError::Validation("send_message requires data".to_string()))?;
                let request: SendMessageRequest = serde_json::from_value(data)?;
                Ok(ClientMessage::SendMessage(request))
            }
            "ping" => Ok(ClientMessage::Ping),
            other => Err(AppError::UnknownMessageType(other.to_string())),
        }
    }
}

/// Outbound frame type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundKind {
    ConnectionEstablished,
    SessionJoined,
    Pong,
    MessageSent,
    Error,
    TypingIndicator,
    ConnectionStatusUpdate,
    NewMessage,
}

/// Outbound envelope: `{type, success, data, error?}`.
#[derive(Debug, Clone, Serialize)]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub kind: OutboundKind,
    pub success: bool,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServerMessage {
    fn ok<T: Serialize>(kind: OutboundKind, payload: &T) -> Self {
        Self {
            kind,
            success: true,
            data: serde_json::to_value(payload).unwrap_or(Value::Null),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: OutboundKind::Error,
            success: false,
            data: Value::Null,
            error: Some(message.into()),
        }
    }

    pub fn connection_established(session_id: Uuid, user_id: &str, user_type: &str) -> Self {
        Self::ok(
            OutboundKind::ConnectionEstablished,
            &ConnectionEstablished {
                session_id,
                user_id: user_id.to_string(),
                user_type: user_type.to_string(),
                timestamp: Utc::now(),
                message: "Successfully connected to chat session".to_string(),
            },
        )
    }

    pub fn session_joined(session_id: Uuid, user_id: &str, user_type: &str) -> Self {
        Self::ok(
            OutboundKind::SessionJoined,
            &SessionJoined {
                session_id,
                user_id: user_id.to_string(),
                user_type: user_type.to_string(),
                timestamp: Utc::now(),
            },
        )
    }

    pub fn pong() -> Self {
        Self::ok(OutboundKind::Pong, &Pong { timestamp: Utc::now() })
    }

    pub fn message_sent(message_id: Uuid) -> Self {
        Self::ok(
            OutboundKind::MessageSent,
            &MessageSent {
                message_id,
                timestamp: Utc::now(),
            },
        )
    }

    pub fn typing_indicator(event: &TypingEvent) -> Self {
        Self::ok(
            OutboundKind::TypingIndicator,
            &TypingIndicator {
                session_id: event.session_id,
                user_id: event.user_id.clone(),
                sender_type: event.role.to_string(),
                is_typing: event.is_typing,
                timestamp: event.timestamp,
            },
        )
    }

    pub fn connection_status_update(event: &ConnectionStatusEvent) -> Self {
        Self::ok(
            OutboundKind::ConnectionStatusUpdate,
            &ConnectionStatusUpdate {
                session_id: event.session_id,
                connection_status: &event.connection_status,
                event_type: event.event_type,
                event_user_id: event.event_user_id.as_deref(),
                timestamp: event.timestamp,
            },
        )
    }

    pub fn new_message(message: &ChatMessage) -> Self {
        Self::ok(
            OutboundKind::NewMessage,
            &NewMessage {
                message_id: message.id,
                session_id: message.session_id,
                sender_id: message.sender_id.as_deref(),
                sender_type: &message.sender_type,
                message: &message.message,
                message_type: &message.message_type,
                attachments: &message.attachments,
                timestamp: message.created_at,
            },
        )
    }
}

#[derive(Serialize)]
struct ConnectionEstablished {
    session_id: Uuid,
    user_id: String,
    user_type: String,
    timestamp: DateTime<Utc>,
    message: String,
}

#[derive(Serialize)]
struct SessionJoined {
    session_id: Uuid,
    user_id: String,
    user_type: String,
    timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
struct Pong {
    timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
struct MessageSent {
    message_id: Uuid,
    timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
struct TypingIndicator {
    session_id: Uuid,
    user_id: String,
    sender_type: String,
    is_typing: bool,
    timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
struct ConnectionStatusUpdate<'a> {
    session_id: Uuid,
    connection_status: &'a SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    event_type: Option<StatusReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    event_user_id: Option<&'a str>,
    timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
struct NewMessage<'a> {
    message_id: Uuid,
    session_id: Uuid,
    sender_id: Option<&'a str>,
    sender_type: &'a str,
    message: &'a str,
    message_type: &'a str,
    attachments: &'a [String],
    timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use serde_json::json;

    #[test]
    fn parses_known_types() {
        let msg = ClientMessage::parse(r#"{"type":"join_session"}"#).unwrap();
        assert_eq!(msg, ClientMessage::JoinSession);
        let msg =
            ClientMessage::parse(r#"{"type":"ping","session_id":"x","timestamp":"now"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping);
        let msg =
            ClientMessage::parse(r#"{"type":"typing_stop","data":{"is_typing":true}}"#).unwrap();
        assert_eq!(msg, ClientMessage::Typing { is_typing: false });
    }

    #[test]
    fn typing_start_honors_explicit_flag() {
        let msg = ClientMessage::parse(r#"{"type":"typing_start"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Typing { is_typing: true });
        let msg =
            ClientMessage::parse(r#"{"type":"agent_typing","data":{"is_typing":false}}"#).unwrap();
        assert_eq!(msg, ClientMessage::Typing { is_typing: false });
        let msg = ClientMessage::parse(r#"{"type":"typing_start","data":"yes"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Typing { is_typing: true });
    }

    #[test]
    fn send_message_requires_payload() {
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"send_message"}"#),
            Err(AppError::Validation(_))
        ));
        let msg =
            ClientMessage::parse(r#"{"type":"send_message","data":{"message":"hi"}}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::SendMessage(SendMessageRequest {
                message: "hi".to_string(),
                message_type: "text".to_string(),
                attachments: vec![],
            })
        );
    }

    #[test]
    fn unknown_and_malformed_frames_are_errors() {
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"dance"}"#),
            Err(AppError::UnknownMessageType(t)) if t == "dance"
        ));
        assert!(matches!(
            ClientMessage::parse("not json"),
            Err(AppError::Serialization(_))
        ));
    }

    #[test]
    fn error_frame_shape() {
        let json = serde_json::to_value(ServerMessage::error("boom")).unwrap();
        assert_eq!(
            json,
            json!({ "type": "error", "success": false, "data": null, "error": "boom" })
        );
    }

    #[test]
    fn typing_indicator_uses_sender_type() {
        let event = TypingEvent {
            session_id: Uuid::new_v4(),
            user_id: "agent1".to_string(),
            role: Role::Agent,
            is_typing: true,
            timestamp: Utc::now(),
            origin: Some(Uuid::new_v4()),
        };
        let json = serde_json::to_value(ServerMessage::typing_indicator(&event)).unwrap();
        assert_eq!(json["type"], "typing_indicator");
        assert_eq!(json["data"]["sender_type"], "agent");
        assert_eq!(json["data"]["is_typing"], true);
        assert!(json.get("error").is_none());
    }
}
