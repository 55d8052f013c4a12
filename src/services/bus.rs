//! Bridge between local sessions and the cross-instance message bus.

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::supervisor::{run_isolated, spawn_isolated};
use crate::error::AppResult;
use crate::models::{BusEvent, BusEventKind};
use crate::repositories::MessageBus;

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(2);

/// Receives decoded bus events from other instances.
#[async_trait]
pub trait BusHandler: Send + Sync {
    async fn handle(&self, event: BusEvent);
}

#[derive(Clone)]
pub struct BusBridge {
    bus: Arc<dyn MessageBus>,
    prefix: String,
    instance_id: Uuid,
}

impl BusBridge {
    pub fn new(bus: Arc<dyn MessageBus>, prefix: impl Into<String>, instance_id: Uuid) -> Self {
        Self {
            bus,
            prefix: prefix.into(),
            instance_id,
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn channel_for(&self, kind: BusEventKind) -> String {
        format!("{}{}", self.prefix, kind.channel_name())
    }

    fn kind_for(&self, channel: &str) -> Option<BusEventKind> {
        channel
            .strip_prefix(self.prefix.as_str())
            .and_then(BusEventKind::from_channel_name)
    }

    /// Serialize and publish on the channel of the event's kind. Best effort:
    /// callers log the error and keep their local side effects.
    pub async fn publish(&self, event: &BusEvent) -> AppResult<()> {
        let channel = self.channel_for(event.kind());
        let payload = event.encode()?;
        self.bus.publish(&channel, &payload).await?;
        debug!(channel = %channel, session_id = %event.session_id(), "bus event published");
        Ok(())
    }

    /// One independent receive loop per kind, each running until `cancel` fires.
    pub fn subscribe(
        &self,
        kinds: &[BusEventKind],
        handler: Arc<dyn BusHandler>,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<Option<()>>> {
        kinds
            .iter()
            .map(|kind| {
                let channel = self.channel_for(*kind);
                let bridge = self.clone();
                let handler = handler.clone();
                let cancel = cancel.clone();
                spawn_isolated(format!("bus:{}", channel), async move {
                    bridge.receive_loop(channel, handler, cancel).await
                })
            })
            .collect()
    }

    async fn receive_loop(
        &self,
        channel: String,
        handler: Arc<dyn BusHandler>,
        cancel: CancellationToken,
    ) {
        info!(channel = %channel, "bus receive loop started");
        while !cancel.is_cancelled() {
            let subscription = tokio::select! {
                _ = cancel.cancelled() => break,
                sub = self.bus.subscribe(&channel) => sub,
            };
            match subscription {
                Ok(mut stream) => loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        next = stream.next() => match next {
                            Some(payload) => {
                                let scope = format!("bus-handler:{}", channel);
                                let dispatch = self.dispatch(&channel, &payload, handler.as_ref());
                                run_isolated(&scope, dispatch).await;
                            }
                            None => {
                                warn!(channel = %channel, "bus subscription ended; resubscribing");
                                break;
                            }
                        }
                    }
                },
                Err(e) => warn!(channel = %channel, error = %e, "bus subscribe failed; retrying"),
            }
            // A subscription that keeps failing or ending is retried at a fixed pace.
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
            }
        }
        info!(channel = %channel, "bus receive loop stopped");
    }

    /// Decode one payload and hand it over. Bad payloads are logged and skipped.
    async fn dispatch(&self, channel: &str, payload: &str, handler: &dyn BusHandler) {
        let Some(kind) = self.kind_for(channel) else {
            warn!(channel = %channel, "message on unknown bus channel");
            return;
        };
        let event = match BusEvent::decode(kind, payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(channel = %channel, error = %e, raw = %payload, "undecodable bus event");
                return;
            }
        };
        if event.origin() == Some(self.instance_id) {
            // Already broadcast locally before publishing.
            return;
        }
        debug!(channel = %channel, session_id = %event.session_id(), "bus event received");
        handler.handle(event).await;
    }
}
