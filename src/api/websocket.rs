//! WebSocket streams: queue subscriptions and service changes

use axum::{
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::{SinkExt, stream::StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::api::{state::ApiState, utils::Origin};

/// WS /api/v1/queues/:key/subscribe
pub async fn queue_subscribe_handler(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
    Path(key): Path<String>,
    Origin(origin): Origin,
) -> Response {
    ws.on_upgrade(move |socket| handle_queue_subscription(socket, state, key, origin))
}

async fn handle_queue_subscription(
    socket: WebSocket,
    state: ApiState,
    key: String,
    origin: String,
) {
    info!(%key, %origin, "queue subscriber connected");

    let (mut sender, mut receiver) = socket.split();
    let mut messages = state.platform.subscribe(&key, &origin);

    loop {
        tokio::select! {
            message = messages.recv() => match message {
                Some(message) => {
                    if sender.send(Message::Binary(message.to_vec())).await.is_err() {
                        debug!("WebSocket send failed, client disconnected");
                        break;
                    }
                }
                None => {
                    // replaced by a newer subscriber from this origin, or shutdown
                    debug!("subscription closed by platform");
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },

            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    info!(%key, %origin, "queue subscriber disconnected");
}

/// WS /api/v1/services/stream
pub async fn service_stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
) -> Response {
    ws.on_upgrade(|socket| handle_service_stream(socket, state))
}

async fn handle_service_stream(socket: WebSocket, state: ApiState) {
    info!("service stream client connected");

    let (mut sender, mut receiver) = socket.split();
    let mut changes = state.platform.service_changes();

    loop {
        tokio::select! {
            change = changes.recv() => match change {
                Ok(description) => {
                    let text = match serde_json::to_string(&description) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("failed to encode service description: {e}");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text)).await.is_err() {
                        debug!("WebSocket send failed, client disconnected");
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("service stream client lagged, skipped {skipped} descriptions");
                }
                Err(RecvError::Closed) => break,
            },

            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    info!("service stream client disconnected");
}
