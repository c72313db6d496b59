//! Live trade stream over WebSocket.
//!
//! Each connection owns one hub subscription. The first frame is the history
//! snapshot; every later frame is one raw inbound batch. Dropping the
//! subscription on exit unregisters it from the hub.

use axum::{
    Json,
    body::Bytes,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::ApiState;
use crate::infrastructure::broadcast::Subscription;

/// `GET /ws`
pub(super) async fn live_handler(ws: WebSocketUpgrade, State(state): State<ApiState>) -> Response {
    let subscription = match state.pipeline.subscribe() {
        Ok(subscription) => subscription,
        Err(e) => {
            tracing::warn!(error = %e, "Refused live subscriber");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "live feed unavailable" })),
            )
                .into_response();
        }
    };

    let shutdown = state.shutdown.clone();
    ws.on_upgrade(move |socket| serve_subscriber(socket, subscription, shutdown))
}

async fn serve_subscriber(
    socket: WebSocket,
    mut subscription: Subscription,
    shutdown: CancellationToken,
) {
    let id = subscription.id();
    tracing::info!(subscriber_id = id, "Live subscriber connected");

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                while let Some(payload) = subscription.try_recv() {
                    if sender.send(Message::Text(payload)).await.is_err() {
                        break;
                    }
                }
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
            outbound = subscription.recv() => {
                let Some(payload) = outbound else {
                    // Hub shut down or dropped us after draining the queue.
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                };
                if let Err(e) = sender.send(Message::Text(payload)).await {
                    tracing::debug!(subscriber_id = id, error = %e, "Live send failed");
                    break;
                }
            }
            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Text(_))) => {
                    if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    drop(subscription);
    tracing::info!(subscriber_id = id, "Live subscriber disconnected");
}
