//! Entry point: load config, wire dependencies, start bus relay, and run the server.

use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderValue, Method};
use livechat_broker::config::{Backend, Config};
use livechat_broker::models::BusEventKind;
use livechat_broker::repositories::{InMemoryBackend, MessageBus, PresenceStore, RedisRepository};
use livechat_broker::services::BusHandler;
use livechat_broker::{build_hub, create_app, AppState};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

const BUS_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const SOCKET_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("config: {}", e))?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
    install_panic_hook();

    let instance_id = Uuid::new_v4();
    tracing::info!(
        instance_id = %instance_id,
        environment = %config.environment,
        backend = ?config.backend,
        "starting livechat broker"
    );

    let (store, bus): (Arc<dyn PresenceStore>, Arc<dyn MessageBus>) = match config.backend {
        Backend::Redis => {
            let repo = Arc::new(RedisRepository::new(&config.redis_url)?);
            match repo.ping().await {
                Ok(()) => tracing::info!("redis connection successful"),
                Err(e) => tracing::warn!(error = %e, "redis not reachable yet; continuing"),
            }
            (repo.clone() as Arc<dyn PresenceStore>, repo as Arc<dyn MessageBus>)
        }
        Backend::Memory => {
            let backend = Arc::new(InMemoryBackend::new());
            (backend.clone() as Arc<dyn PresenceStore>, backend as Arc<dyn MessageBus>)
        }
    };

    let hub = build_hub(&config, store, bus, instance_id);
    let shutdown = CancellationToken::new();

    let handler: Arc<dyn BusHandler> = Arc::new(hub.clone());
    let bus_loops = hub
        .bridge()
        .subscribe(&BusEventKind::ALL, handler, shutdown.clone());

    let state = AppState::new(hub, config.environment.clone(), shutdown.clone());
    let app = create_app(state.clone())
        .layer(cors_layer(&config))
        .layer(TraceLayer::new_for_http());

    tracing::info!(addr = %config.server_addr, "listening");
    let listener = tokio::net::TcpListener::bind(config.server_addr).await?;
    let server_shutdown = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("shutting down");
            server_shutdown.cancel();
        })
        .await;

    // Open sockets see the cancellation and run their close paths; wait for them
    // while the bus can still carry their leave broadcasts.
    shutdown.cancel();
    if !state.drain_sockets(SOCKET_DRAIN_TIMEOUT).await {
        tracing::warn!("websocket tasks did not finish closing in time");
    }

    let drain = futures::future::join_all(bus_loops);
    if tokio::time::timeout(BUS_DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::warn!("bus receive loops did not stop in time");
    }

    served?;
    Ok(())
}

fn cors_layer(config: &Config) -> CorsLayer {
    match config.cors_origins() {
        Some(origins) => {
            let origins: Vec<HeaderValue> = origins
                .iter()
                .filter_map(|o| match o.parse() {
                    Ok(value) => Some(value),
                    Err(_) => {
                        tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                        None
                    }
                })
                .collect();
            tracing::info!(count = origins.len(), "CORS restricted to configured origins");
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods([Method::GET])
                .allow_headers([CONTENT_TYPE, AUTHORIZATION])
                .allow_credentials(config.allow_credentials)
        }
        None => CorsLayer::permissive(),
    }
}

/// Last-resort guard: panics that escape every narrower scope are logged
/// before the default hook runs.
fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let payload = info.payload();
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();
        tracing::error!(panic = %message, location = %location, "panic");
        default_hook(info);
    }));
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
