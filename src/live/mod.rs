//! Live Broadcast
//!
//! Pushes device presence and location updates to web browsers.
//!
//! # Endpoints
//! - `GET /ws` - WebSocket stream of [`ServerMessage`]s
//! - `GET /health` - Peer, device and buffer counts

mod handler;
mod hub;
mod messages;

pub use handler::websocket_handler;
pub use hub::{LiveConfig, LiveHub, PeerId};
pub use messages::ServerMessage;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::writer::{BatchedWriter, WriterStats};

/// Live channel errors
#[derive(Debug, Error)]
pub enum LiveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Server error: {0}")]
    Serve(String),

    #[error("Too many web peers")]
    TooManyPeers,

    #[error("Peer closed before setup")]
    PeerClosed,
}

/// Shared state for live routes
pub struct LiveState {
    pub hub: Arc<LiveHub>,
    pub writer: Arc<BatchedWriter>,
}

impl LiveState {
    pub fn new(hub: Arc<LiveHub>, writer: Arc<BatchedWriter>) -> Self {
        Self { hub, writer }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub peers: usize,
    pub devices: usize,
    pub store_connected: bool,
    pub writer: WriterStats,
}

async fn health(State(state): State<Arc<LiveState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        peers: state.hub.peer_count(),
        devices: state.hub.devices().len(),
        store_connected: state.writer.is_connected(),
        writer: state.writer.stats(),
    })
}

pub fn build_router(state: LiveState) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// Serve the live routes until `shutdown` fires
pub async fn serve(
    listener: TcpListener,
    state: LiveState,
    shutdown: CancellationToken,
) -> Result<(), LiveError> {
    let router = build_router(state);
    tracing::info!("Live channel listening on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| LiveError::Serve(e.to_string()))?;

    tracing::info!("Live channel shut down");
    Ok(())
}
