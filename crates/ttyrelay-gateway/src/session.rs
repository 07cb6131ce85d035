//! One terminal session: a shell, its metadata tracker, its control channel
//! and its listening port, started and torn down as a unit.
//!
//! Task layout per session:
//!
//! ```text
//!   PTY reader thread ──chunks──▶ output pump ──▶ ClientSlot ──▶ `/` socket
//!                                     │
//!                                     └─mark_dirty─▶ tracker tick loop
//!                                                        │ updates
//!   `/control` sockets ──ClientMessage──▶ control task ◀─┘
//!                                          │ HostMessage (broadcast)
//!                                          ▼
//!                                   `/control` sockets
//! ```
//!
//! Everything hangs off one [`CancellationToken`]; cancelling it stops every
//! task, closes attached sockets and silences the event sink.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ttyrelay_protocol::{ClientMessage, HostMessage};
use ttyrelay_terminal::{
    Dimensions, ExitStatus, Introspector, MetadataTracker, MetadataUpdate, PtyProcess, PtyStreams,
    ShellConfig, TrackerTiming,
};

use crate::{
    control::{self, ControlChannel},
    error::{GatewayError, Result},
    events::{EventSink, HostEvent, SessionEvent},
    ws::{self, ClientSlot, OriginPolicy, WsState},
};

/// How long teardown waits for a session task before aborting it.
const TEARDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
    Primary,
    Secondary,
}

/// Point-in-time description of a live session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub port: u16,
    pub role: SessionRole,
    pub pid: Option<u32>,
    pub shell: String,
    /// Directory the shell was started in.
    pub cwd: PathBuf,
    /// Last directory reported by the tracker.
    pub last_cwd: Option<PathBuf>,
    pub process: Option<String>,
    pub cols: u16,
    pub rows: u16,
    pub client_attached: bool,
    pub alive: bool,
    pub opened_at: DateTime<Utc>,
}

/// Registry-owned settings every session needs at start.
pub(crate) struct SessionContext {
    pub port: u16,
    pub role: SessionRole,
    pub bind: String,
    pub origins: Arc<OriginPolicy>,
    pub max_frame_bytes: usize,
    pub timing: TrackerTiming,
    pub introspector: Arc<dyn Introspector>,
    pub events: mpsc::UnboundedSender<HostEvent>,
}

pub struct TerminalSession {
    port: u16,
    role: SessionRole,
    shell: ShellConfig,
    opened_at: DateTime<Utc>,
    pty: Arc<PtyProcess>,
    tracker: MetadataTracker,
    control: ControlChannel,
    client: Arc<ClientSlot>,
    events: EventSink,
    cancel: CancellationToken,
    server: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalSession")
            .field("port", &self.port)
            .field("role", &self.role)
            .field("pid", &self.pty.pid())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl TerminalSession {
    /// Bring a session up on `ctx.port`.
    ///
    /// The port is bound before the shell is spawned, so a bind failure never
    /// leaves an orphaned process behind. Returns the session together with
    /// the shell's exit notification, which the caller must watch.
    pub(crate) async fn start(
        ctx: SessionContext,
        shell: ShellConfig,
    ) -> Result<(Arc<Self>, oneshot::Receiver<ExitStatus>)> {
        shell.validate()?;

        let listener = TcpListener::bind((ctx.bind.as_str(), ctx.port))
            .await
            .map_err(|source| GatewayError::Bind {
                port: ctx.port,
                source,
            })?;

        let (pty, PtyStreams { output, exit }) = PtyProcess::spawn(&shell)?;
        let pty = Arc::new(pty);

        let cancel = CancellationToken::new();
        let (tracker, updates) = MetadataTracker::new(
            pty.pid(),
            ctx.introspector,
            shell.cwd.clone(),
            ctx.timing,
            cancel.child_token(),
        );
        let (control, inbound) = ControlChannel::new(ctx.port);
        let client = Arc::new(ClientSlot::default());
        let events = EventSink::new(ctx.port, ctx.events, cancel.clone());

        let session = Arc::new(Self {
            port: ctx.port,
            role: ctx.role,
            shell,
            opened_at: Utc::now(),
            pty: Arc::clone(&pty),
            tracker: tracker.clone(),
            control: control.clone(),
            client: Arc::clone(&client),
            events: events.clone(),
            cancel: cancel.clone(),
            server: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        let router = ws::build_router(Arc::new(WsState {
            port: ctx.port,
            pty,
            tracker: tracker.clone(),
            client,
            control,
            events,
            origins: ctx.origins,
            max_frame_bytes: ctx.max_frame_bytes,
            cancel: cancel.clone(),
        }));
        let port = ctx.port;
        let shutdown = cancel.clone().cancelled_owned();
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!(port, error = %e, "session listener failed");
            }
            debug!(port, "session listener closed");
        });
        *lock(&session.server) = Some(server);

        let tasks = vec![
            tracker.start(),
            tokio::spawn(Arc::clone(&session).pump_output(output)),
            tokio::spawn(Arc::clone(&session).run_control(inbound, updates)),
        ];
        lock(&session.tasks).extend(tasks);

        info!(
            port,
            role = ?session.role,
            pid = ?session.pty.pid(),
            shell = %session.shell.shell,
            "session started"
        );
        Ok((session, exit))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn pid(&self) -> Option<u32> {
        self.pty.pid()
    }

    pub fn shell(&self) -> &ShellConfig {
        &self.shell
    }

    pub fn control(&self) -> &ControlChannel {
        &self.control
    }

    pub fn size(&self) -> Dimensions {
        self.pty.size()
    }

    /// Last tracked working directory, or the start directory when tracking
    /// never reported one.
    pub fn cwd(&self) -> PathBuf {
        self.tracker
            .snapshot()
            .cwd
            .unwrap_or_else(|| self.shell.cwd.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn info(&self) -> SessionInfo {
        let snapshot = self.tracker.snapshot();
        let size = self.pty.size();
        SessionInfo {
            port: self.port,
            role: self.role,
            pid: self.pty.pid(),
            shell: self.shell.shell.clone(),
            cwd: self.shell.cwd.clone(),
            last_cwd: snapshot.cwd,
            process: snapshot.process,
            cols: size.cols,
            rows: size.rows,
            client_attached: self.client.is_attached(),
            alive: self.pty.is_alive(),
            opened_at: self.opened_at,
        }
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn report_exit(&self, status: ExitStatus) {
        self.events.emit_closed(status);
    }

    /// Stop everything the session owns. Idempotent.
    ///
    /// On return the shell has been signalled, the listener is closed and
    /// no task of this session will emit another event.
    pub(crate) async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.pty.kill();

        let server = lock(&self.server).take();
        if let Some(handle) = server {
            join_or_abort(self.port, "listener", handle).await;
        }
        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        for handle in tasks {
            join_or_abort(self.port, "worker", handle).await;
        }
        info!(port = self.port, "session torn down");
    }

    async fn pump_output(self: Arc<Self>, mut output: mpsc::UnboundedReceiver<Vec<u8>>) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                chunk = output.recv() => {
                    let Some(chunk) = chunk else { break };
                    self.tracker.mark_dirty();
                    // Without a client the chunk is dropped; the shell keeps running.
                    self.client.forward(chunk);
                }
            }
        }
        debug!(port = self.port, "output pump stopped");
    }

    async fn run_control(
        self: Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<ClientMessage>,
        mut updates: mpsc::UnboundedReceiver<MetadataUpdate>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(update) = updates.recv() => self.publish_update(update),
                Some(msg) = inbound.recv() => self.handle_client(msg),
                else => break,
            }
        }
        debug!(port = self.port, "control task stopped");
    }

    fn handle_client(&self, msg: ClientMessage) {
        match msg {
            ClientMessage::Startup => {
                if let Some(msg) = control::cwd_state(&self.tracker.snapshot()) {
                    self.control.publish(msg);
                }
            }
            ClientMessage::Resize { cols, rows } => {
                self.pty.resize(cols, rows);
                self.control.publish(HostMessage::Resized { cols, rows });
                self.events.emit(SessionEvent::Resized { cols, rows });
            }
        }
    }

    fn publish_update(&self, update: MetadataUpdate) {
        let msg = match update {
            MetadataUpdate::Cwd(path) => HostMessage::NewCwd {
                path: path_string(&path),
            },
            MetadataUpdate::FallbackCwd(path) => HostMessage::FallbackCwd {
                path: path_string(&path),
            },
            MetadataUpdate::Process(name) => HostMessage::NewProcess { name },
        };
        self.control.publish(msg);
    }
}

async fn join_or_abort(port: u16, task: &'static str, mut handle: JoinHandle<()>) {
    if tokio::time::timeout(TEARDOWN_GRACE, &mut handle).await.is_err() {
        warn!(port, task, "session task did not stop in time, aborting");
        handle.abort();
        let _ = handle.await;
    }
}

fn path_string(path: &std::path::Path) -> String {
    path.to_string_lossy().into_owned()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
