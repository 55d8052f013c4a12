//! Concurrent fan-out of one frame to every local connection of a session.

use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::registry::ConnectionRegistry;
use super::supervisor::spawn_isolated;
use crate::models::ServerMessage;

/// Outcome of one broadcast call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub targeted: usize,
    pub delivered: usize,
    pub pruned: usize,
}

#[derive(Clone)]
pub struct BroadcastEngine {
    registry: ConnectionRegistry,
}

impl BroadcastEngine {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }

    /// Deliver `message` to every connection of the session, one task per connection.
    ///
    /// A failed write prunes that connection; other deliveries are unaffected.
    /// Returns once every delivery has finished.
    pub async fn broadcast(&self, session_id: Uuid, message: &ServerMessage) -> BroadcastReport {
        let targets = self.registry.snapshot(session_id).await;
        if targets.is_empty() {
            debug!(session_id = %session_id, kind = ?message.kind, "no local connections");
            return BroadcastReport::default();
        }

        let payload: Arc<str> = match serde_json::to_string(message) {
            Ok(json) => json.into(),
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "failed to serialize broadcast");
                return BroadcastReport::default();
            }
        };

        let deliveries = targets.iter().map(|conn| {
            let conn = conn.clone();
            let payload = payload.clone();
            let registry = self.registry.clone();
            spawn_isolated(format!("delivery:{}", conn.id()), async move {
                match conn.send_text(payload.to_string()).await {
                    Ok(()) => Delivery::Sent,
                    Err(e) => {
                        warn!(
                            session_id = %session_id,
                            user_id = %conn.user_id(),
                            error = %e,
                            "send failed; pruning connection"
                        );
                        registry.remove_connection(session_id, conn.id()).await;
                        Delivery::Pruned
                    }
                }
            })
        });

        let mut report = BroadcastReport {
            targeted: targets.len(),
            ..BroadcastReport::default()
        };
        for outcome in join_all(deliveries).await {
            match outcome {
                Ok(Some(Delivery::Sent)) => report.delivered += 1,
                Ok(Some(Delivery::Pruned)) => report.pruned += 1,
                // Panics are logged by the supervisor.
                Ok(None) => {}
                Err(e) => warn!(session_id = %session_id, error = %e, "delivery task aborted"),
            }
        }

        debug!(
            session_id = %session_id,
            kind = ?message.kind,
            delivered = report.delivered,
            targeted = report.targeted,
            "broadcast"
        );
        report
    }
}

enum Delivery {
    Sent,
    Pruned,
}
