//! WebSocket handling.
//!
//! Each socket becomes one multiplexer connection: inbound text frames are
//! handed to [`Multiplexer::handle_text`](crate::multiplexer::Multiplexer::handle_text)
//! and the connection's event queue is drained onto the socket by a writer task.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use termhub_protocol::encode_server_event;

use super::AppState;

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (client_id, mut events) = state.mux.connect().await;
    tracing::info!(client_id = %client_id, "WebSocket connection opened");

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Drains the connection's queue until the multiplexer drops it.
    let writer_id = client_id.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let text = match encode_server_event(&event) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(client_id = %writer_id, error = %e, "Failed to encode event");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                tracing::debug!(client_id = %writer_id, "WebSocket send failed, client disconnected");
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let mut writer_done = false;
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            // The multiplexer dropped this connection, e.g. its queue filled up.
            _ = &mut send_task => {
                writer_done = true;
                break;
            }
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => state.mux.handle_text(&client_id, &text).await,
                Some(Ok(Message::Close(_))) | None => break,
                // Pings are answered by axum; binary frames carry nothing we understand.
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    tracing::debug!(client_id = %client_id, error = %e, "WebSocket error");
                    break;
                }
            },
        }
    }

    // Dropping the handle ends the writer once it has flushed what was queued.
    state.mux.disconnect(&client_id).await;
    if !writer_done {
        if let Err(e) = send_task.await {
            tracing::debug!(client_id = %client_id, error = %e, "WebSocket writer task failed");
        }
    }
    tracing::info!(client_id = %client_id, "WebSocket connection closed");
}
