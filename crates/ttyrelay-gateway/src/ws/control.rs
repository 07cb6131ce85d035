use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use ttyrelay_protocol::ClientMessage;

use crate::{control::cwd_state, ws::WsState};

/// GET /control: JSON control messages.
pub(crate) async fn control_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<WsState>>,
) -> Response {
    if let Err(reason) = state.origins.check(&headers) {
        warn!(port = state.port, ?reason, "control handshake refused: origin");
        return reason.into_response();
    }
    ws.max_message_size(state.max_frame_bytes)
        .on_upgrade(move |socket| run_control(socket, state))
}

async fn run_control(socket: WebSocket, state: Arc<WsState>) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    // Subscribe before reading anything so a `startup` reply is never missed.
    let mut host_rx = state.control.subscribe();
    info!(port = state.port, conn_id = %conn_id, "control client attached");

    let (mut tx, mut rx) = socket.split();

    loop {
        tokio::select! {
            _ = state.cancel.cancelled() => {
                let frame = CloseFrame {
                    code: close_code::AWAY,
                    reason: "session closed".into(),
                };
                let _ = tx.send(Message::Close(Some(frame))).await;
                break;
            }

            event = host_rx.recv() => match event {
                Ok(msg) => {
                    if tx.send(Message::Text(msg.encode().into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(port = state.port, conn_id = %conn_id, missed, "control client lagging");
                    // Skipped messages may include the one-off fallback; resend current cwd state.
                    if let Some(msg) = cwd_state(&state.tracker.snapshot()) {
                        if tx.send(Message::Text(msg.encode().into())).await.is_err() {
                            break;
                        }
                    }
                }
                Err(RecvError::Closed) => break,
            },

            msg = rx.next() => match msg {
                Some(Ok(Message::Text(text))) => match ClientMessage::decode(text.as_str()) {
                    Ok(msg) => {
                        if !state.control.send(msg) {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(port = state.port, conn_id = %conn_id, error = %e, "malformed control message");
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(port = state.port, conn_id = %conn_id, error = %e, "control read failed");
                    break;
                }
            },
        }
    }

    info!(port = state.port, conn_id = %conn_id, "control client detached");
}
