//! collab-sync relay
//!
//! Serves the sync protocol over WebSocket:
//! - `GET /ws` upgrades to a socket carrying JSON event frames
//! - `GET /health` reports relay statistics
//! - `GET /api/rooms` lists the active workspace rooms

use anyhow::Context;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::Method,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

use collab_sync::config::RelayConfig;
use collab_sync::server::{RelayServer, RoomSummary};
use collab_sync::sync::protocol::PROTOCOL_VERSION;
use collab_sync::transport::Frame;

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Shared application state
struct AppState {
    relay: Arc<RelayServer>,
}

// ============================================================================
// RESPONSE TYPES
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    protocol_version: u8,
    uptime_seconds: u64,
    connections: usize,
    rooms: usize,
    documents: usize,
    server_time: i64,
}

#[derive(Debug, Serialize)]
struct RoomListResponse {
    rooms: Vec<RoomSummary>,
    total: usize,
}

// ============================================================================
// HTTP HANDLERS
// ============================================================================

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.relay.stats();

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol_version: PROTOCOL_VERSION,
        uptime_seconds: stats.uptime_seconds,
        connections: stats.connections,
        rooms: stats.rooms,
        documents: stats.documents,
        server_time: chrono::Utc::now().timestamp(),
    })
}

/// List active rooms
async fn list_rooms(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let rooms = state.relay.rooms();
    let total = rooms.len();
    Json(RoomListResponse { rooms, total })
}

// ============================================================================
// WEBSOCKET HANDLER
// ============================================================================

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Bridge one socket to the relay
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (conn, mut rx) = state.relay.connect();

    // Task to forward relay frames to the socket
    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame.encode() {
                Ok(text) => {
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Failed to encode frame: {}", e),
            }
        }
        let _ = ws_sender.close().await;
        debug!("Send task ended for {}", conn);
    });

    // Task to feed socket frames into the relay
    let relay = state.relay.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => match Frame::decode(&text) {
                    Ok(frame) => relay.handle_frame(conn, frame),
                    Err(e) => warn!("Connection {} sent an undecodable frame: {}", conn, e),
                },
                Message::Close(_) => {
                    info!("WebSocket closed by client: {}", conn);
                    break;
                }
                // Pong is handled automatically
                _ => {}
            }
        }
        debug!("Receive task ended for {}", conn);
    });

    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }

    state.relay.disconnect(conn);
}

// ============================================================================
// MAIN
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "collab_sync=info,tower_http=info".into()),
        )
        .init();

    dotenvy::dotenv().ok();

    let config = RelayConfig::from_env();
    let state = Arc::new(AppState {
        relay: Arc::new(RelayServer::new()),
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/api/rooms", get(list_rooms))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = config.addr();
    info!("collab-sync relay v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Protocol version: {}", PROTOCOL_VERSION);
    info!("   WebSocket: ws://{}/ws", addr);
    info!("   Health check: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
