//! Real-time live chat connection broker built with Rust.
//!
//! Fans chat, typing and presence events out to WebSocket clients grouped by
//! chat session, keeps session membership in Redis so every broker instance
//! sees the same presence, and relays events between instances over Redis pub/sub.

pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod repositories;
pub mod services;

pub use config::Config;
pub use error::AppError;
pub use handlers::http::AppState;
pub use services::{PresenceService, SessionHub};

use axum::routing::get;
use handlers::http;
use std::sync::Arc;
use uuid::Uuid;

use repositories::{MessageBus, PresenceStore};
use services::{BusBridge, BusChatDelivery};

/// Build the API router (ws, status query, connections, health).
/// Used by main and by integration tests.
pub fn create_app(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/ws/:session_id/:user_id/:user_type", get(handlers::ws_handler))
        .route(
            "/api/session/:session_id/connection-status",
            get(http::connection_status),
        )
        .route("/api/connections", get(http::active_connections))
        .route("/health", get(http::health))
        .with_state(state)
}

/// Wire a hub for one broker instance on top of the given presence store and bus.
pub fn build_hub(
    config: &Config,
    store: Arc<dyn PresenceStore>,
    bus: Arc<dyn MessageBus>,
    instance_id: Uuid,
) -> SessionHub {
    let presence = PresenceService::new(store, config.typing_ttl, config.presence_ttl);
    let bridge = BusBridge::new(bus, config.bus_channel_prefix.clone(), instance_id);
    let delivery = Arc::new(BusChatDelivery::new(bridge.clone()));
    SessionHub::new(presence, bridge, delivery)
}
