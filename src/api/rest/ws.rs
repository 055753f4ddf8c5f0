use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::SinkExt;
use futures::StreamExt;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::models::order::Order;
use crate::state::AppState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Streams the active list: the current snapshot first, then one message per
/// change.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.repo.subscribe_changes();
    let initial = state.repo.snapshot();

    info!("websocket client connected");

    let send_task = tokio::spawn(async move {
        if send_snapshot(&mut sender, &initial).await.is_err() {
            return;
        }

        loop {
            let snapshot = match rx.recv().await {
                Ok(snapshot) => snapshot,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "websocket client lagged behind order changes");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            if send_snapshot(&mut sender, &snapshot).await.is_err() {
                break;
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(_msg)) = receiver.next().await {}
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    info!("websocket client disconnected");
}

async fn send_snapshot<S>(sender: &mut S, snapshot: &[Order]) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    let json = match serde_json::to_string(snapshot) {
        Ok(json) => json,
        Err(err) => {
            warn!(error = %err, "failed to serialize orders for ws");
            return Ok(());
        }
    };

    sender.send(Message::Text(json)).await.map_err(|_| ())
}
