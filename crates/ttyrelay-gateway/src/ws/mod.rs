//! WebSocket surface of a session port.
//!
//! Every session serves its own small axum router:
//!
//! | route      | payload                    | clients |
//! |------------|----------------------------|---------|
//! | `/`        | raw PTY bytes, both ways   | one     |
//! | `/control` | JSON control messages      | many    |
//!
//! Both routes validate the `Origin` header before upgrading.

pub mod client;
pub mod control;
pub mod origin;
pub mod stream;

use std::sync::Arc;

use axum::{routing::get, Router};
use tokio_util::sync::CancellationToken;
use ttyrelay_protocol::{CONTROL_PATH, STREAM_PATH};
use ttyrelay_terminal::{MetadataTracker, PtyProcess};

use crate::{control::ControlChannel, events::EventSink};

pub use client::{ClientSlot, Reservation};
pub use origin::{OriginPolicy, RejectReason};

/// Shared by both route handlers of one session.
#[derive(Debug)]
pub(crate) struct WsState {
    pub port: u16,
    pub pty: Arc<PtyProcess>,
    pub tracker: MetadataTracker,
    pub client: Arc<ClientSlot>,
    pub control: ControlChannel,
    pub events: EventSink,
    pub origins: Arc<OriginPolicy>,
    pub max_frame_bytes: usize,
    pub cancel: CancellationToken,
}

pub(crate) fn build_router(state: Arc<WsState>) -> Router {
    Router::new()
        .route(STREAM_PATH, get(stream::stream_handler))
        .route(CONTROL_PATH, get(control::control_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
