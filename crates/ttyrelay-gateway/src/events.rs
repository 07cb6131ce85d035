//! Lifecycle notifications delivered to the embedding host.

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use ttyrelay_terminal::ExitStatus;

/// Something that happened to one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A display client attached to the byte stream.
    Opened { pid: Option<u32> },
    /// The shell exited on its own. Never emitted for an explicit close.
    Closed {
        exit_code: u32,
        signal: Option<String>,
    },
    /// The PTY was resized through the control channel.
    Resized { cols: u16, rows: u16 },
    /// The display client went away; the shell keeps running.
    Disconnected { code: Option<u16>, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostEvent {
    pub port: u16,
    #[serde(flatten)]
    pub event: SessionEvent,
}

/// Receiving end handed out by [`crate::SessionRegistry::new`].
pub type EventStream = mpsc::UnboundedReceiver<HostEvent>;

/// Per-session emitter. Goes quiet as soon as the session is cancelled.
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    port: u16,
    tx: mpsc::UnboundedSender<HostEvent>,
    cancel: CancellationToken,
}

impl EventSink {
    pub(crate) fn new(
        port: u16,
        tx: mpsc::UnboundedSender<HostEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self { port, tx, cancel }
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.send(event);
    }

    /// The one event allowed after teardown: the shell's own exit.
    pub(crate) fn emit_closed(&self, status: ExitStatus) {
        self.send(SessionEvent::Closed {
            exit_code: status.code,
            signal: status.signal,
        });
    }

    fn send(&self, event: SessionEvent) {
        // A host that dropped its receiver just stops hearing about sessions.
        let _ = self.tx.send(HostEvent {
            port: self.port,
            event,
        });
    }
}
