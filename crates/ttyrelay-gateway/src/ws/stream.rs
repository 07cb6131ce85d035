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
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::events::SessionEvent;
use crate::ws::{client::Reservation, origin::RejectReason, WsState};

/// GET /: attach the display client to the PTY byte stream.
pub(crate) async fn stream_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<WsState>>,
) -> Response {
    if let Err(reason) = state.origins.check(&headers) {
        warn!(port = state.port, ?reason, "stream handshake refused: origin");
        return reason.into_response();
    }
    let Some(reservation) = state.client.try_reserve() else {
        warn!(port = state.port, "stream handshake refused: client already attached");
        return RejectReason::Capacity.into_response();
    };
    ws.max_message_size(state.max_frame_bytes)
        .on_upgrade(move |socket| run_stream(socket, state, reservation))
}

/// Per-client relay loop: PTY output out, client input in.
async fn run_stream(socket: WebSocket, state: Arc<WsState>, reservation: Reservation) {
    let conn_id = reservation.conn_id().to_string();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    reservation.attach(out_tx);
    info!(port = state.port, conn_id = %conn_id, "display client attached");
    state.events.emit(SessionEvent::Opened {
        pid: state.pty.pid(),
    });

    let (mut tx, mut rx) = socket.split();
    let mut peer_code: Option<u16> = None;
    let mut close_reason = String::new();

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

            chunk = out_rx.recv() => {
                let Some(chunk) = chunk else { break };
                if tx.send(Message::Binary(chunk.into())).await.is_err() {
                    break;
                }
            }

            msg = rx.next() => {
                let input = match msg {
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Text(text))) => text.as_str().as_bytes().to_vec().into(),
                    Some(Ok(Message::Close(frame))) => {
                        if let Some(frame) = frame {
                            peer_code = Some(frame.code);
                            close_reason = frame.reason.as_str().to_string();
                        }
                        break;
                    }
                    // Pings are answered by the protocol layer.
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(port = state.port, conn_id = %conn_id, error = %e, "stream read failed");
                        break;
                    }
                    None => break,
                };
                if input.len() > state.max_frame_bytes {
                    warn!(port = state.port, conn_id = %conn_id, size = input.len(), "input frame too large");
                    break;
                }
                if let Err(e) = state.pty.write(&input) {
                    warn!(port = state.port, conn_id = %conn_id, error = %e, "PTY write failed");
                }
            }
        }
    }

    // Free the slot before announcing the disconnect so a reconnect never races it.
    drop(reservation);
    info!(port = state.port, conn_id = %conn_id, code = ?peer_code, "display client detached");
    state.events.emit(SessionEvent::Disconnected {
        code: peer_code,
        reason: close_reason,
    });
}
