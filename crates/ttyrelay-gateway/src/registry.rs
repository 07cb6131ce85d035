//! Session registry: the port table and the only entry points the host uses.
//!
//! The table maps every port in the configured range to an optional session.
//! All mutations (spawn, close, exit reclaim) run under one async mutex, so
//! no two operations ever race for the same port and a slot is only marked
//! free once its previous occupant is fully torn down.

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{Arc, Weak},
    time::Duration,
};

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};
use ttyrelay_core::config::{BridgeConfig, RelayConfig};
use ttyrelay_terminal::{native_introspector, ExitStatus, Introspector, ShellConfig, TrackerTiming};

use crate::{
    control::ControlChannel,
    error::{GatewayError, Result},
    events::{EventStream, HostEvent},
    session::{SessionContext, SessionInfo, SessionRole, TerminalSession},
    ws::OriginPolicy,
};

/// Fixed set of ports, each either free or owned by one session.
#[derive(Debug)]
struct PortTable {
    primary: u16,
    slots: BTreeMap<u16, Option<Arc<TerminalSession>>>,
}

impl PortTable {
    fn new(bridge: &BridgeConfig) -> Self {
        let slots = std::iter::once(bridge.base_port)
            .chain(bridge.secondary_ports())
            .map(|port| (port, None))
            .collect();
        Self {
            primary: bridge.base_port,
            slots,
        }
    }

    fn secondary_count(&self) -> u16 {
        (self.slots.len() - 1) as u16
    }

    /// Lowest free secondary port.
    fn first_free_secondary(&self) -> Option<u16> {
        self.slots
            .iter()
            .find(|(port, slot)| **port != self.primary && slot.is_none())
            .map(|(port, _)| *port)
    }

    fn get(&self, port: u16) -> Option<&Arc<TerminalSession>> {
        self.slots.get(&port).and_then(Option::as_ref)
    }

    /// The port must be in range and free before anything is started on it.
    fn check_claimable(&self, port: u16) -> Result<()> {
        match self.slots.get(&port) {
            None => Err(GatewayError::PortOutOfRange(port)),
            Some(Some(_)) => Err(GatewayError::PortBusy(port)),
            Some(None) => Ok(()),
        }
    }

    fn occupy(&mut self, port: u16, session: Arc<TerminalSession>) {
        if let Some(slot) = self.slots.get_mut(&port) {
            *slot = Some(session);
        }
    }

    fn release(&mut self, port: u16) -> Option<Arc<TerminalSession>> {
        self.slots.get_mut(&port).and_then(Option::take)
    }

    fn sessions(&self) -> impl Iterator<Item = &Arc<TerminalSession>> {
        self.slots.values().flatten()
    }
}

struct RegistryInner {
    bridge: BridgeConfig,
    origins: Arc<OriginPolicy>,
    timing: TrackerTiming,
    introspector: Arc<dyn Introspector>,
    table: Mutex<PortTable>,
    events: mpsc::UnboundedSender<HostEvent>,
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        // Sessions still registered here would otherwise keep their tasks alive.
        for session in self.table.get_mut().sessions() {
            session.cancel_token().cancel();
        }
    }
}

/// Owner of every session and its port. Cheap to clone.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("primary_port", &self.inner.bridge.base_port)
            .field("secondary_slots", &self.inner.bridge.secondary_slots)
            .field("introspector", &self.inner.introspector.name())
            .finish_non_exhaustive()
    }
}

impl SessionRegistry {
    /// Registry using this platform's introspection strategy.
    pub fn new(config: &RelayConfig) -> Result<(Self, EventStream)> {
        Self::with_introspector(config, native_introspector())
    }

    /// Fails with [`GatewayError::Config`] when the port layout or tracker
    /// timing in `config` cannot work.
    pub fn with_introspector(
        config: &RelayConfig,
        introspector: Arc<dyn Introspector>,
    ) -> Result<(Self, EventStream)> {
        config.validate()?;
        let (events, rx) = mpsc::unbounded_channel();
        let inner = RegistryInner {
            bridge: config.bridge.clone(),
            origins: Arc::new(OriginPolicy::from_config(&config.bridge)),
            timing: TrackerTiming {
                interval: Duration::from_millis(config.tracker.interval_ms),
                query_timeout: Duration::from_millis(config.tracker.query_timeout_ms),
            },
            introspector,
            table: Mutex::new(PortTable::new(&config.bridge)),
            events,
        };
        Ok((
            Self {
                inner: Arc::new(inner),
            },
            rx,
        ))
    }

    pub fn primary_port(&self) -> u16 {
        self.inner.bridge.base_port
    }

    pub fn secondary_ports(&self) -> Vec<u16> {
        self.inner.bridge.secondary_ports().collect()
    }

    /// Start the primary session on the base port.
    ///
    /// Meant to be called once at startup; the host should treat a failure
    /// as fatal.
    pub async fn spawn_primary(&self, shell: ShellConfig) -> Result<Arc<TerminalSession>> {
        let mut table = self.inner.table.lock().await;
        let port = table.primary;
        if table.get(port).is_some() {
            return Err(GatewayError::PrimaryAlreadySpawned(port));
        }
        let session = self.start_on(&mut table, port, SessionRole::Primary, shell).await?;
        Ok(session)
    }

    /// Start a secondary session on the lowest free secondary port.
    ///
    /// Fails with [`GatewayError::Exhausted`] and changes nothing when every
    /// slot is taken.
    pub async fn spawn_secondary(&self, shell: ShellConfig) -> Result<u16> {
        let mut table = self.inner.table.lock().await;
        let Some(port) = table.first_free_secondary() else {
            let slots = table.secondary_count();
            warn!(slots, "secondary session refused: all slots in use");
            return Err(GatewayError::Exhausted { slots });
        };
        self.start_on(&mut table, port, SessionRole::Secondary, shell)
            .await?;
        Ok(port)
    }

    async fn start_on(
        &self,
        table: &mut PortTable,
        port: u16,
        role: SessionRole,
        shell: ShellConfig,
    ) -> Result<Arc<TerminalSession>> {
        table.check_claimable(port)?;
        let ctx = SessionContext {
            port,
            role,
            bind: self.inner.bridge.bind.clone(),
            origins: Arc::clone(&self.inner.origins),
            max_frame_bytes: self.inner.bridge.max_frame_bytes,
            timing: self.inner.timing,
            introspector: Arc::clone(&self.inner.introspector),
            events: self.inner.events.clone(),
        };
        let (session, exit) = TerminalSession::start(ctx, shell).await.map_err(|e| {
            warn!(port, ?role, error = %e, "session spawn failed");
            e
        })?;
        table.occupy(port, Arc::clone(&session));
        tokio::spawn(watch_exit(
            Arc::downgrade(&self.inner),
            Arc::clone(&session),
            exit,
        ));
        Ok(session)
    }

    /// Tear down the session on `port` and free the slot.
    ///
    /// Idempotent. Returns whether a session was running there. No `closed`
    /// event is emitted, and nothing at all is emitted for the session once
    /// this returns.
    pub async fn close(&self, port: u16) -> bool {
        let mut table = self.inner.table.lock().await;
        let Some(session) = table.get(port).cloned() else {
            debug!(port, "close: no session on port");
            return false;
        };
        session.shutdown().await;
        table.release(port);
        info!(port, "session closed");
        true
    }

    /// Close every session, secondaries first.
    pub async fn close_all(&self) {
        let ports: Vec<u16> = {
            let table = self.inner.table.lock().await;
            let mut ports: Vec<u16> = table.sessions().map(|s| s.port()).collect();
            ports.sort_by_key(|p| *p == table.primary);
            ports
        };
        for port in ports {
            self.close(port).await;
        }
    }

    pub async fn is_free(&self, port: u16) -> bool {
        let table = self.inner.table.lock().await;
        matches!(table.slots.get(&port), Some(None))
    }

    pub async fn session(&self, port: u16) -> Option<Arc<TerminalSession>> {
        self.inner.table.lock().await.get(port).cloned()
    }

    /// In-process handle on a session's control channel.
    pub async fn control(&self, port: u16) -> Option<ControlChannel> {
        self.session(port).await.map(|s| s.control().clone())
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let table = self.inner.table.lock().await;
        table.sessions().map(|s| s.info()).collect()
    }

    /// Where new secondary sessions should start: the primary's last known
    /// directory, if a primary is running.
    pub async fn primary_cwd(&self) -> Option<PathBuf> {
        let table = self.inner.table.lock().await;
        table.get(table.primary).map(|s| s.cwd())
    }
}

/// Reclaim a session whose shell exited on its own.
async fn watch_exit(
    registry: Weak<RegistryInner>,
    session: Arc<TerminalSession>,
    exit: oneshot::Receiver<ExitStatus>,
) {
    let status = tokio::select! {
        _ = session.cancel_token().cancelled() => return,
        status = exit => match status {
            Ok(status) => status,
            // Wait thread vanished without reporting; treat as a failed exit.
            Err(_) => ExitStatus { code: 1, signal: None },
        },
    };
    info!(
        port = session.port(),
        code = status.code,
        signal = ?status.signal,
        "shell exited"
    );

    let Some(registry) = registry.upgrade() else {
        session.shutdown().await;
        return;
    };
    let mut table = registry.table.lock().await;
    // An explicit close may have won the lock; it owns the teardown then.
    if session.is_closed() {
        return;
    }
    let port = session.port();
    let still_owner = table.get(port).is_some_and(|s| Arc::ptr_eq(s, &session));
    session.shutdown().await;
    if still_owner {
        table.release(port);
    }
    session.report_exit(status);
}
