//! Session lifecycle orchestration: registry, presence, local fan-out and bus relay.
//!
//! Connect: registry add, presence join, status broadcast, confirmation frame.
//! Close: registry remove, presence leave, then status broadcast. The status
//! is always read after the presence write, so it never lists a departed user.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::broadcast::BroadcastEngine;
use super::bus::{BusBridge, BusHandler};
use super::connection::Connection;
use super::delivery::ChatDelivery;
use super::presence::PresenceService;
use super::registry::ConnectionRegistry;
use crate::error::{AppError, AppResult};
use crate::models::{
    BusEvent, ClientMessage, ConnectionStatusEvent, ServerMessage, SessionStatus, StatusReason,
    TypingEvent,
};

/// Shared per-process hub; cheap to clone.
#[derive(Clone)]
pub struct SessionHub {
    registry: ConnectionRegistry,
    broadcaster: BroadcastEngine,
    presence: PresenceService,
    bridge: BusBridge,
    delivery: Arc<dyn ChatDelivery>,
}

impl SessionHub {
    pub fn new(
        presence: PresenceService,
        bridge: BusBridge,
        delivery: Arc<dyn ChatDelivery>,
    ) -> Self {
        let registry = ConnectionRegistry::new();
        Self {
            broadcaster: BroadcastEngine::new(registry.clone()),
            registry,
            presence,
            bridge,
            delivery,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn presence(&self) -> &PresenceService {
        &self.presence
    }

    pub fn bridge(&self) -> &BusBridge {
        &self.bridge
    }

    /// Status query for external read-only surfaces.
    pub async fn connection_status(&self, session_id: Uuid) -> AppResult<SessionStatus> {
        self.presence.snapshot(session_id).await
    }

    pub async fn active_connections(&self) -> HashMap<Uuid, usize> {
        self.registry.count_all().await
    }

    /// Enter `Active`: register, join presence, announce, confirm.
    pub async fn connect(&self, connection: Arc<Connection>) -> ActiveConnection {
        let session_id = connection.session_id();
        let user_id = connection.user_id().to_string();

        self.registry.add(session_id, connection.clone()).await;
        if let Err(e) = self.presence.join(session_id, &user_id, connection.role()).await {
            warn!(session_id = %session_id, user_id = %user_id, error = %e, "presence join failed");
        }
        self.announce_status(session_id, StatusReason::UserConnected, &user_id)
            .await;

        let welcome = ServerMessage::connection_established(
            session_id,
            &user_id,
            connection.role().as_str(),
        );
        if let Err(e) = connection.send(&welcome).await {
            warn!(session_id = %session_id, user_id = %user_id, error = %e, "welcome not sent");
        }
        info!(
            session_id = %session_id,
            user_id = %user_id,
            user_type = %connection.role(),
            "client connected"
        );

        ActiveConnection {
            hub: self.clone(),
            connection,
            state: ConnectionState::Active,
        }
    }

    /// Snapshot presence and send a `connection_status_update` locally and over the bus.
    pub async fn announce_status(&self, session_id: Uuid, reason: StatusReason, user_id: &str) {
        let status = match self.presence.snapshot(session_id).await {
            Ok(status) => status,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "failed to read session presence");
                return;
            }
        };
        let event = ConnectionStatusEvent {
            session_id,
            connection_status: status,
            event_type: Some(reason),
            event_user_id: Some(user_id.to_string()),
            timestamp: Utc::now(),
            origin: Some(self.bridge.instance_id()),
        };
        self.broadcaster
            .broadcast(session_id, &ServerMessage::connection_status_update(&event))
            .await;
        if let Err(e) = self.bridge.publish(&BusEvent::PresenceChanged(event)).await {
            warn!(session_id = %session_id, error = %e, "failed to publish connection status");
        }
    }

    async fn dispatch(
        &self,
        connection: &Arc<Connection>,
        message: ClientMessage,
    ) -> AppResult<()> {
        let session_id = connection.session_id();
        match message {
            ClientMessage::JoinSession => {
                let reply = ServerMessage::session_joined(
                    session_id,
                    connection.user_id(),
                    connection.role().as_str(),
                );
                connection.send(&reply).await
            }
            ClientMessage::Typing { is_typing } => {
                self.relay_typing(connection, is_typing).await;
                Ok(())
            }
            ClientMessage::SendMessage(request) => {
                let message_id = self.delivery.deliver(connection, request).await?;
                connection.send(&ServerMessage::message_sent(message_id)).await
            }
            ClientMessage::Ping => {
                if let Err(e) = self.presence.touch(session_id).await {
                    debug!(session_id = %session_id, error = %e, "presence heartbeat failed");
                }
                connection.send(&ServerMessage::pong()).await
            }
        }
    }

    async fn relay_typing(&self, connection: &Connection, is_typing: bool) {
        let session_id = connection.session_id();
        if let Err(e) = self
            .presence
            .set_typing(session_id, connection.user_id(), is_typing)
            .await
        {
            warn!(
                session_id = %session_id,
                user_id = %connection.user_id(),
                error = %e,
                "failed to store typing flag"
            );
        }
        let event = TypingEvent {
            session_id,
            user_id: connection.user_id().to_string(),
            role: connection.role().clone(),
            is_typing,
            timestamp: Utc::now(),
            origin: Some(self.bridge.instance_id()),
        };
        self.broadcaster
            .broadcast(session_id, &ServerMessage::typing_indicator(&event))
            .await;
        if let Err(e) = self.bridge.publish(&BusEvent::Typing(event)).await {
            warn!(session_id = %session_id, error = %e, "failed to publish typing indicator");
        }
    }

    /// `Closing` steps, in order: registry, presence, then status broadcast.
    /// Presence and the broadcast are skipped while the user keeps another local connection.
    async fn close_connection(&self, connection: &Connection) {
        let session_id = connection.session_id();
        let user_id = connection.user_id();
        info!(
            session_id = %session_id,
            user_id = %user_id,
            user_type = %connection.role(),
            "client disconnecting"
        );

        self.registry
            .remove_connection(session_id, connection.id())
            .await;
        let still_here = self
            .registry
            .snapshot(session_id)
            .await
            .iter()
            .any(|c| c.user_id() == user_id);
        if still_here {
            // Another local tab of the same user keeps the membership.
            debug!(session_id = %session_id, user_id = %user_id, "user still connected");
            return;
        }
        if let Err(e) = self.presence.leave(session_id, user_id, connection.role()).await {
            warn!(session_id = %session_id, user_id = %user_id, error = %e, "leave failed");
        }
        self.announce_status(session_id, StatusReason::UserDisconnected, user_id)
            .await;
    }
}

#[async_trait]
impl BusHandler for SessionHub {
    async fn handle(&self, event: BusEvent) {
        let session_id = event.session_id();
        if !self.registry.has_session(session_id).await {
            return;
        }
        let message = match &event {
            BusEvent::ChatMessage(m) => ServerMessage::new_message(m),
            BusEvent::Typing(t) => ServerMessage::typing_indicator(t),
            BusEvent::PresenceChanged(s) => ServerMessage::connection_status_update(s),
        };
        let report = self.broadcaster.broadcast(session_id, &message).await;
        debug!(
            session_id = %session_id,
            kind = ?event.kind(),
            delivered = report.delivered,
            "relayed bus event"
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Active,
    Closing,
    Closed,
}

/// A connection in the `Active` state. `close` runs the closing steps once;
/// dropping it while still active schedules them on the runtime.
pub struct ActiveConnection {
    hub: SessionHub,
    connection: Arc<Connection>,
    state: ConnectionState,
}

impl ActiveConnection {
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Classify and handle one inbound text frame. Protocol errors go back to
    /// this connection only as an `error` frame.
    pub async fn handle_frame(&mut self, text: &str) {
        let result = match ClientMessage::parse(text) {
            Ok(message) => self.hub.dispatch(&self.connection, message).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.report_error(&e).await;
        }
    }

    async fn report_error(&self, error: &AppError) {
        warn!(
            session_id = %self.connection.session_id(),
            user_id = %self.connection.user_id(),
            error = %error,
            "client message rejected"
        );
        if let Err(e) = self
            .connection
            .send(&ServerMessage::error(error.client_message()))
            .await
        {
            debug!(user_id = %self.connection.user_id(), error = %e, "failed to send error frame");
        }
    }

    pub async fn close(mut self) {
        self.state = ConnectionState::Closing;
        self.hub.close_connection(&self.connection).await;
        self.state = ConnectionState::Closed;
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        if self.state != ConnectionState::Active {
            return;
        }
        self.state = ConnectionState::Closed;
        let hub = self.hub.clone();
        let connection = self.connection.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { hub.close_connection(&connection).await });
            }
            Err(_) => warn!(
                session_id = %connection.session_id(),
                user_id = %connection.user_id(),
                "connection dropped outside runtime; presence left in place"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use crate::repositories::InMemoryBackend;
    use crate::services::bus::testing::UnavailableBus;
    use crate::services::connection::testing::{connection, RecordingSink};
    use crate::services::delivery::BusChatDelivery;
    use crate::services::presence::testing::UnavailableStore;
    use std::time::Duration;

    fn hub_on(backend: &InMemoryBackend) -> SessionHub {
        let presence = PresenceService::new(
            Arc::new(backend.clone()),
            Duration::from_secs(30),
            Some(Duration::from_secs(3600)),
        );
        let bridge = BusBridge::new(Arc::new(backend.clone()), "", Uuid::new_v4());
        let delivery = Arc::new(BusChatDelivery::new(bridge.clone()));
        SessionHub::new(presence, bridge, delivery)
    }

    fn last_status(sink: &RecordingSink) -> serde_json::Value {
        sink.frames_of("connection_status_update")
            .pop()
            .expect("a status update")["data"]
            .clone()
    }

    #[tokio::test]
    async fn connect_announces_and_confirms() {
        let backend = InMemoryBackend::new();
        let hub = hub_on(&backend);
        let session = Uuid::new_v4();
        let (conn, sink) = connection(session, "cust1", Role::Customer);

        let active = hub.connect(conn).await;
        assert_eq!(active.state(), ConnectionState::Active);

        let frames = sink.frames();
        assert_eq!(frames[0]["type"], "connection_status_update");
        assert_eq!(frames[1]["type"], "connection_established");
        let status = last_status(&sink);
        assert_eq!(status["event_type"], "user_connected");
        assert_eq!(status["event_user_id"], "cust1");
        assert_eq!(status["connection_status"]["total_customer"], 1);
        assert_eq!(status["connection_status"]["total_agent"], 0);
        active.close().await;
    }

    #[tokio::test]
    async fn departing_user_is_absent_from_the_disconnect_update() {
        let backend = InMemoryBackend::new();
        let hub = hub_on(&backend);
        let session = Uuid::new_v4();
        let (cust, _) = connection(session, "cust1", Role::Customer);
        let (agent, agent_sink) = connection(session, "agent1", Role::Agent);

        let cust = hub.connect(cust).await;
        let agent = hub.connect(agent).await;
        let status = last_status(&agent_sink);
        assert_eq!(status["connection_status"]["total_customer"], 1);
        assert_eq!(status["connection_status"]["total_agent"], 1);

        cust.close().await;
        let status = last_status(&agent_sink);
        assert_eq!(status["event_type"], "user_disconnected");
        assert_eq!(status["event_user_id"], "cust1");
        assert_eq!(status["connection_status"]["total_customer"], 0);
        assert_eq!(status["connection_status"]["customer_connected"], false);
        assert_eq!(status["connection_status"]["agent_connected"], true);
        assert!(status["connection_status"]["users"].get("cust1").is_none());
        assert_eq!(hub.registry().count_by_session(session).await, 1);
        agent.close().await;
        assert!(!hub.registry().has_session(session).await);
    }

    #[tokio::test]
    async fn closing_one_of_two_tabs_keeps_the_user_present() {
        let backend = InMemoryBackend::new();
        let hub = hub_on(&backend);
        let session = Uuid::new_v4();
        let (tab1, _) = connection(session, "cust1", Role::Customer);
        let (tab2, _) = connection(session, "cust1", Role::Customer);
        let (agent, agent_sink) = connection(session, "agent1", Role::Agent);
        let tab1 = hub.connect(tab1).await;
        let tab2 = hub.connect(tab2).await;
        let agent = hub.connect(agent).await;

        tab1.close().await;
        assert!(hub.connection_status(session).await.unwrap().contains("cust1"));
        let disconnects = agent_sink
            .frames_of("connection_status_update")
            .into_iter()
            .filter(|f| f["data"]["event_type"] == "user_disconnected")
            .count();
        assert_eq!(disconnects, 0);
        assert_eq!(hub.registry().count_by_session(session).await, 2);

        tab2.close().await;
        assert!(!hub.connection_status(session).await.unwrap().contains("cust1"));
        let status = last_status(&agent_sink);
        assert_eq!(status["event_type"], "user_disconnected");
        assert_eq!(status["event_user_id"], "cust1");
        agent.close().await;
    }

    #[tokio::test]
    async fn unknown_type_yields_one_error_and_no_broadcast() {
        let backend = InMemoryBackend::new();
        let hub = hub_on(&backend);
        let session = Uuid::new_v4();
        let (a, sink_a) = connection(session, "cust1", Role::Customer);
        let (b, sink_b) = connection(session, "agent1", Role::Agent);
        let mut a = hub.connect(a).await;
        let b = hub.connect(b).await;
        let before_a = sink_a.frames().len();
        let before_b = sink_b.frames().len();

        a.handle_frame(r#"{"type":"dance"}"#).await;

        let frames_a = sink_a.frames();
        let new_a = &frames_a[before_a..];
        assert_eq!(new_a.len(), 1);
        assert_eq!(new_a[0]["type"], "error");
        assert_eq!(new_a[0]["error"], "Unknown message type: dance");
        assert_eq!(sink_b.frames().len(), before_b);
        assert_eq!(a.state(), ConnectionState::Active);
        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn typing_round_trip() {
        let backend = InMemoryBackend::new();
        let hub = hub_on(&backend);
        let session = Uuid::new_v4();
        let (cust, _) = connection(session, "cust1", Role::Customer);
        let (agent, agent_sink) = connection(session, "agent1", Role::Agent);
        let mut cust = hub.connect(cust).await;
        let agent = hub.connect(agent).await;

        cust.handle_frame(r#"{"type":"typing_start"}"#).await;
        assert_eq!(hub.presence().typing_users(session).await.unwrap(), vec!["cust1".to_string()]);
        cust.handle_frame(r#"{"type":"typing_stop"}"#).await;
        assert!(hub.presence().typing_users(session).await.unwrap().is_empty());

        let typing = agent_sink.frames_of("typing_indicator");
        assert_eq!(typing.len(), 2);
        assert_eq!(typing[0]["data"]["user_id"], "cust1");
        assert_eq!(typing[0]["data"]["is_typing"], true);
        assert_eq!(typing[1]["data"]["is_typing"], false);
        cust.close().await;
        agent.close().await;
    }

    #[tokio::test]
    async fn join_and_ping_reply_to_sender_only() {
        let backend = InMemoryBackend::new();
        let hub = hub_on(&backend);
        let session = Uuid::new_v4();
        let (a, sink_a) = connection(session, "cust1", Role::Customer);
        let (b, sink_b) = connection(session, "agent1", Role::Agent);
        let mut a = hub.connect(a).await;
        let b = hub.connect(b).await;
        let before_b = sink_b.frames().len();

        a.handle_frame(r#"{"type":"join_session"}"#).await;
        a.handle_frame(r#"{"type":"ping"}"#).await;

        assert_eq!(sink_a.frames_of("session_joined").len(), 1);
        assert_eq!(sink_a.frames_of("pong").len(), 1);
        assert_eq!(sink_b.frames().len(), before_b);
        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn malformed_frame_is_reported_not_fatal() {
        let backend = InMemoryBackend::new();
        let hub = hub_on(&backend);
        let (conn, sink) = connection(Uuid::new_v4(), "cust1", Role::Customer);
        let mut active = hub.connect(conn).await;

        active.handle_frame("{{{").await;
        let errors = sink.frames_of("error");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["error"], "Invalid message format");
        assert_eq!(active.state(), ConnectionState::Active);
        active.close().await;
    }

    #[tokio::test]
    async fn collaborator_outage_keeps_local_side_effects() {
        let presence =
            PresenceService::new(Arc::new(UnavailableStore), Duration::from_secs(30), None);
        let bridge = BusBridge::new(Arc::new(UnavailableBus), "", Uuid::new_v4());
        let delivery = Arc::new(BusChatDelivery::new(bridge.clone()));
        let hub = SessionHub::new(presence, bridge, delivery);
        let session = Uuid::new_v4();
        let (a, _) = connection(session, "cust1", Role::Customer);
        let (b, sink_b) = connection(session, "agent1", Role::Agent);

        let mut a = hub.connect(a).await;
        let b = hub.connect(b).await;
        assert_eq!(hub.registry().count_by_session(session).await, 2);
        assert_eq!(sink_b.frames_of("connection_established").len(), 1);

        a.handle_frame(r#"{"type":"typing_start"}"#).await;
        assert_eq!(sink_b.frames_of("typing_indicator").len(), 1);

        a.handle_frame(r#"{"type":"send_message","data":{"message":"hi"}}"#).await;
        a.close().await;
        assert_eq!(hub.registry().count_by_session(session).await, 1);
        b.close().await;
    }

    #[tokio::test]
    async fn dropping_an_active_connection_still_runs_close() {
        let backend = InMemoryBackend::new();
        let hub = hub_on(&backend);
        let session = Uuid::new_v4();
        let (conn, _) = connection(session, "cust1", Role::Customer);
        let active = hub.connect(conn).await;
        drop(active);

        // Presence leave is the last store write of the close sequence.
        for _ in 0..100 {
            if hub.connection_status(session).await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!hub.registry().has_session(session).await);
        assert!(hub.connection_status(session).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn bus_events_reach_only_sessions_with_local_connections() {
        let backend = InMemoryBackend::new();
        let hub = hub_on(&backend);
        let session = Uuid::new_v4();
        let (conn, sink) = connection(session, "agent1", Role::Agent);
        let active = hub.connect(conn).await;

        let typing = |session_id: Uuid| TypingEvent {
            session_id,
            user_id: "cust9".to_string(),
            role: Role::Customer,
            is_typing: true,
            timestamp: Utc::now(),
            origin: Some(Uuid::new_v4()),
        };
        hub.handle(BusEvent::Typing(typing(Uuid::new_v4()))).await;
        assert!(sink.frames_of("typing_indicator").is_empty());

        hub.handle(BusEvent::Typing(typing(session))).await;
        let frames = sink.frames_of("typing_indicator");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["data"]["user_id"], "cust9");
        active.close().await;
    }
}
