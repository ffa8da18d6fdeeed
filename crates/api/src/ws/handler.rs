use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};

use crate::state::AppState;
use crate::ws::protocol;

/// GET /api/v1/ws
///
/// Upgrades to a WebSocket whose connection id becomes the channel id of
/// every bulk action created over it.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Drive one connection: a writer task drains the manager's queue into the
/// sink while this task dispatches inbound requests. On disconnect the
/// channel's running action is aborted.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let channel_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(channel_id = %channel_id, "WebSocket connected");

    let mut rx = state.ws_manager.add(channel_id.clone()).await;
    state
        .ws_manager
        .send_json(&channel_id, &protocol::connected_frame(&channel_id))
        .await;

    let (mut sink, mut stream) = socket.split();

    let writer_channel = channel_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                tracing::debug!(channel_id = %writer_channel, "WebSocket sink closed");
                break;
            }
        }
    });

    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                let reply = protocol::dispatch(&state.bulk_actions, &channel_id, text.as_str()).await;
                state.ws_manager.send_json(&channel_id, &reply).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Pong(_)) => {
                tracing::trace!(channel_id = %channel_id, "Pong received");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(channel_id = %channel_id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    state.ws_manager.remove(&channel_id).await;
    send_task.abort();

    if let Some(overview) = state.bulk_actions.on_channel_disconnect(&channel_id).await {
        tracing::debug!(
            channel_id = %channel_id,
            action_id = %overview.id,
            status = overview.status.as_str(),
            "Released bulk action of disconnected channel",
        );
    }
    tracing::info!(channel_id = %channel_id, "WebSocket disconnected");
}
