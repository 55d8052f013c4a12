//! WebSocket handler: path identity, session validation, and the per-connection read loop.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::handlers::http::AppState;
use crate::models::{parse_session_id, Role, ServerMessage};
use crate::services::{Connection, FrameSink};

/// Upgrade `/ws/:session_id/:user_id/:user_type`. The session id is checked after
/// the upgrade so the client gets a typed error frame rather than an HTTP status.
pub async fn ws_handler(
    State(state): State<AppState>,
    Path((session_id, user_id, user_type)): Path<(String, String, String)>,
    ws: WebSocketUpgrade,
) -> Response {
    let sockets = state.sockets.clone();
    ws.on_upgrade(move |socket| {
        sockets.track_future(handle_socket(state, socket, session_id, user_id, user_type))
    })
}

async fn handle_socket(
    state: AppState,
    socket: WebSocket,
    raw_session_id: String,
    user_id: String,
    user_type: String,
) {
    let (mut sender, mut receiver) = socket.split();

    let session_id = match parse_session_id(&raw_session_id) {
        Ok(id) => id,
        Err(e) => {
            warn!(session_id = %raw_session_id, user_id = %user_id, "rejecting connection: {}", e);
            if let Ok(frame) = serde_json::to_string(&ServerMessage::error(e.client_message())) {
                let _ = sender.send_text(frame).await;
            }
            sender.shutdown().await;
            return;
        }
    };

    let connection = Arc::new(Connection::new(
        session_id,
        user_id.clone(),
        Role::from(user_type),
        Box::new(sender),
    ));
    let mut active = state.hub().connect(connection.clone()).await;

    loop {
        let frame = tokio::select! {
            _ = state.shutdown.cancelled() => {
                debug!(session_id = %session_id, user_id = %user_id, "server shutting down");
                break;
            }
            frame = receiver.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => active.handle_frame(&text).await,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(session_id = %session_id, user_id = %user_id, error = %e, "read error");
                break;
            }
        }
    }

    active.close().await;
    connection.close().await;
    info!(session_id = %session_id, user_id = %user_id, "client disconnected");
}
