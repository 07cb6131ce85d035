//! In-process side of a session's control channel.
//!
//! Client → host messages funnel through one `mpsc` queue into the session's
//! control task, which handles them strictly in arrival order. Host → client
//! messages go out on a `broadcast` so any number of subscribers (the
//! `/control` WebSocket route, or the embedding host itself) see the same
//! ordered stream.

use tokio::sync::{broadcast, mpsc};
use tracing::debug;
use ttyrelay_protocol::{ClientMessage, HostMessage};
use ttyrelay_terminal::TrackerSnapshot;

const OUTBOUND_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct ControlChannel {
    port: u16,
    inbound: mpsc::UnboundedSender<ClientMessage>,
    outbound: broadcast::Sender<HostMessage>,
}

impl ControlChannel {
    pub(crate) fn new(port: u16) -> (Self, mpsc::UnboundedReceiver<ClientMessage>) {
        let (inbound, rx) = mpsc::unbounded_channel();
        let (outbound, _) = broadcast::channel(OUTBOUND_CAPACITY);
        (
            Self {
                port,
                inbound,
                outbound,
            },
            rx,
        )
    }

    /// Queue a client message for the session.
    ///
    /// Returns `false` once the session has shut down.
    pub fn send(&self, msg: ClientMessage) -> bool {
        self.inbound.send(msg).is_ok()
    }

    /// Receive every host message published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<HostMessage> {
        self.outbound.subscribe()
    }

    pub(crate) fn publish(&self, msg: HostMessage) {
        // No subscriber is not an error: nothing is listening yet.
        if self.outbound.send(msg).is_err() {
            debug!(port = self.port, "control message dropped: no subscribers");
        }
    }
}

/// The cwd message a client should hold right now: the fallback once
/// tracking is disabled, else the last tracked directory.
pub(crate) fn cwd_state(snapshot: &TrackerSnapshot) -> Option<HostMessage> {
    if snapshot.cwd_disabled() {
        return Some(HostMessage::FallbackCwd {
            path: snapshot.fallback_cwd.to_string_lossy().into_owned(),
        });
    }
    snapshot.cwd.as_ref().map(|cwd| HostMessage::NewCwd {
        path: cwd.to_string_lossy().into_owned(),
    })
}
