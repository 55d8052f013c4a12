//! Hand-off of client chat messages to the chat pipeline.

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use super::bus::BusBridge;
use super::connection::Connection;
use crate::error::{AppError, AppResult};
use crate::models::{BusEvent, ChatMessage, SendMessageRequest};

/// Accepts a `send_message` from a connection and returns the new message id.
#[async_trait]
pub trait ChatDelivery: Send + Sync {
    async fn deliver(&self, sender: &Connection, request: SendMessageRequest) -> AppResult<Uuid>;
}

/// Publishes the message on the chat channel; every instance, this one included,
/// relays it to its local connections as `new_message`.
#[derive(Clone)]
pub struct BusChatDelivery {
    bridge: BusBridge,
}

impl BusChatDelivery {
    pub fn new(bridge: BusBridge) -> Self {
        Self { bridge }
    }
}

#[async_trait]
impl ChatDelivery for BusChatDelivery {
    async fn deliver(&self, sender: &Connection, request: SendMessageRequest) -> AppResult<Uuid> {
        if request.message.trim().is_empty() && request.attachments.is_empty() {
            return Err(AppError::Validation("Message must not be empty".to_string()));
        }
        let now = Utc::now();
        let message = ChatMessage {
            id: Uuid::new_v4(),
            session_id: sender.session_id(),
            sender_id: Some(sender.user_id().to_string()),
            sender_type: sender.role().to_string(),
            message: request.message,
            message_type: request.message_type,
            attachments: request.attachments,
            read_at: None,
            created_at: now,
            updated_at: Some(now),
        };
        let id = message.id;
        self.bridge.publish(&BusEvent::ChatMessage(message)).await?;
        info!(
            session_id = %sender.session_id(),
            user_id = %sender.user_id(),
            message_id = %id,
            "chat message handed off"
        );
        Ok(id)
    }
}
