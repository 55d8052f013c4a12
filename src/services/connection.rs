//! One live client socket and its serialized write side.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::SinkExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{Role, ServerMessage};

/// Write half of a client transport.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: String) -> AppResult<()>;

    async fn shutdown(&mut self);
}

#[async_trait]
impl FrameSink for SplitSink<WebSocket, Message> {
    async fn send_text(&mut self, text: String) -> AppResult<()> {
        self.send(Message::Text(text))
            .await
            .map_err(|e| AppError::Delivery(e.to_string()))
    }

    async fn shutdown(&mut self) {
        let _ = SinkExt::close(self).await;
    }
}

/// A registered client. Writes go through an exclusive lock so frames never interleave.
pub struct Connection {
    id: Uuid,
    session_id: Uuid,
    user_id: String,
    role: Role,
    writer: Mutex<Box<dyn FrameSink>>,
}

impl Connection {
    pub fn new(
        session_id: Uuid,
        user_id: impl Into<String>,
        role: Role,
        sink: Box<dyn FrameSink>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            user_id: user_id.into(),
            role,
            writer: Mutex::new(sink),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub async fn send(&self, message: &ServerMessage) -> AppResult<()> {
        let text = serde_json::to_string(message)?;
        self.send_text(text).await
    }

    pub async fn send_text(&self, text: String) -> AppResult<()> {
        let mut writer = self.writer.lock().await;
        writer.send_text(text).await
    }

    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("user_id", &self.user_id)
            .field("role", &self.role)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Connection doubles shared by service tests.

    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::Duration;

    /// Records every frame and flags overlapping writes.
    #[derive(Clone, Default)]
    pub struct RecordingSink {
        pub frames: Arc<StdMutex<Vec<String>>>,
        pub broken: Arc<AtomicBool>,
        pub in_flight: Arc<AtomicUsize>,
        pub overlapped: Arc<AtomicBool>,
        pub write_delay: Option<Duration>,
        pub panic_on_write: bool,
    }

    impl RecordingSink {
        pub fn broken() -> Self {
            let sink = Self::default();
            sink.broken.store(true, Ordering::SeqCst);
            sink
        }

        pub fn slow(delay: Duration) -> Self {
            Self {
                write_delay: Some(delay),
                ..Self::default()
            }
        }

        pub fn frames(&self) -> Vec<serde_json::Value> {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .map(|f| serde_json::from_str(f).unwrap())
                .collect()
        }

        pub fn frames_of(&self, kind: &str) -> Vec<serde_json::Value> {
            self.frames()
                .into_iter()
                .filter(|f| f["type"] == kind)
                .collect()
        }
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn send_text(&mut self, text: String) -> AppResult<()> {
            if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            if self.panic_on_write {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                panic!("socket double panicked");
            }
            if let Some(delay) = self.write_delay {
                tokio::time::sleep(delay).await;
            }
            let result = if self.broken.load(Ordering::SeqCst) {
                Err(AppError::Delivery("broken pipe".to_string()))
            } else {
                self.frames.lock().unwrap().push(text);
                Ok(())
            };
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }

        async fn shutdown(&mut self) {
            self.broken.store(true, Ordering::SeqCst);
        }
    }

    pub fn connection(
        session_id: Uuid,
        user_id: &str,
        role: Role,
    ) -> (Arc<Connection>, RecordingSink) {
        connection_with(session_id, user_id, role, RecordingSink::default())
    }

    pub fn connection_with(
        session_id: Uuid,
        user_id: &str,
        role: Role,
        sink: RecordingSink,
    ) -> (Arc<Connection>, RecordingSink) {
        let conn = Connection::new(session_id, user_id, role, Box::new(sink.clone()));
        (Arc::new(conn), sink)
    }
}
