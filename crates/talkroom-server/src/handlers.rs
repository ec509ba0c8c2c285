//! HTTP and WebSocket handlers for the talkroom server.
//!
//! Each upgraded socket is handed to a [`Dispatcher`], which owns the
//! connection until it closes.

use crate::config::Config;
use crate::metrics;
use anyhow::Result;
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use talkroom_core::{Dispatcher, Hub, SessionOutcome};
use talkroom_protocol::{RoomId, UserId};
use talkroom_transport::websocket;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Shared server state.
pub struct AppState {
    /// The realtime hub.
    pub hub: Arc<Hub>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create app state backed by the seeded in-memory directory.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let directory = Arc::new(config.seed_directory());
        info!(
            users = config.seed.users.len(),
            rooms = config.seed.rooms.len(),
            "Directory seeded"
        );

        Self {
            hub: Arc::new(Hub::with_directory(config.hub_config(), directory)),
            config,
        }
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.websocket_route(), get(ws_handler))
        .route("/health", get(health_handler))
        .route("/rooms/:room_id/online", get(online_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {:#}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("{} listening on {}", config.app_name, addr);
    info!(
        "WebSocket endpoint: ws://{}{}/{{credential}}",
        addr, config.transport.websocket_path
    );

    let hub = Arc::clone(&state.hub);
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal(hub))
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal(hub: Arc<Hub>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Shutdown requested");
    hub.shutdown();
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    app_name: String,
    version: &'static str,
    environment: String,
    connections: usize,
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        app_name: state.config.app_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        environment: state.config.environment.clone(),
        connections: state.hub.stats().connections,
    })
}

#[derive(Debug, Serialize)]
struct OnlineResponse {
    room_id: RoomId,
    online_users: Vec<UserId>,
    count: usize,
}

/// Online members of a room.
async fn online_handler(
    Path(room_id): Path<i64>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let room_id = RoomId(room_id);
    let online_users = state.hub.online_members(room_id);
    Json(OnlineResponse {
        room_id,
        count: online_users.len(),
        online_users,
    })
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(credential): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.max_message_size(state.config.limits.max_frame_size)
        .on_upgrade(move |socket| handle_websocket(socket, credential, state))
}

/// Hand an upgraded socket to a dispatcher.
async fn handle_websocket(socket: WebSocket, credential: String, state: Arc<AppState>) {
    let (source, sink) = websocket::split(socket);
    let dispatcher = Dispatcher::new(Arc::clone(&state.hub));
    let connection_id = dispatcher.connection_id();

    debug!(connection = %connection_id, "WebSocket connected");

    match dispatcher.run(&credential, source, sink).await {
        SessionOutcome::Rejected(e) => {
            debug!(connection = %connection_id, reason = e.reason(), "Handshake rejected");
        }
        SessionOutcome::Refused(user_id) => {
            debug!(connection = %connection_id, user_id = %user_id, "Handshake refused");
        }
        SessionOutcome::Closed { user_id, cause, .. } => {
            debug!(connection = %connection_id, user_id = %user_id, cause = ?cause, "WebSocket closed");
        }
    }
}
