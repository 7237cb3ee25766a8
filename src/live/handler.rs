//! WebSocket Handler
//!
//! Upgrades `/ws` requests and runs one peer until either side goes away.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::messages::ServerMessage;
use super::LiveState;

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<LiveState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<LiveState>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let peer_id = match state.hub.register(tx, || state.writer.backlog()) {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!(error = %e, "Rejected web peer");
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };

    let peer_for_send = peer_id.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match msg.to_json() {
                Ok(text) => {
                    if sender.send(Message::Text(text)).await.is_err() {
                        tracing::debug!(
                            peer_id = %peer_for_send,
                            "WebSocket send failed, closing peer"
                        );
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize live message");
                }
            }
        }
    });

    let peer_for_recv = peer_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Close(_)) => break,
                // Peers are listen-only; axum answers pings itself.
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(
                        peer_id = %peer_for_recv,
                        error = %e,
                        "WebSocket receive error"
                    );
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
        }
        _ = &mut recv_task => {
            send_task.abort();
        }
    }

    state.hub.unregister(&peer_id);
}
