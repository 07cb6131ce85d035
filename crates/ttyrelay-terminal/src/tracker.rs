//! Session metadata tracker: debounced cwd and foreground-process polling.
//!
//! Every output chunk from the PTY marks both probes dirty. A fixed tick
//! (1 s by default) turns a dirty probe into exactly one OS query; a probe
//! that is already polling is never queried again until its query settles.
//!
//! ```text
//!   Idle ──output──▶ Dirty ──tick──▶ Polling ──resolved──▶ Idle
//!                                       │  (output while polling ⇒ Dirty)
//!                                       └──cwd failure──▶ Disabled  (terminal)
//! ```
//!
//! The first cwd failure disables cwd tracking for good and emits a single
//! [`MetadataUpdate::FallbackCwd`]. Process-name failures are logged and
//! retried on the next dirty tick.

use std::{
    future::Future,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{sync::mpsc, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{error::IntrospectionError, introspect::Introspector};

/// Lifecycle of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    /// Nothing new since the last query.
    Idle,
    /// Output observed; the next tick will query.
    Dirty,
    /// One query in flight.
    Polling,
    /// Permanently off. Only the cwd probe can reach this state.
    Disabled,
}

/// Change notifications produced by the tracker, in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataUpdate {
    Cwd(PathBuf),
    FallbackCwd(PathBuf),
    Process(String),
}

/// Point-in-time view of what the tracker knows.
#[derive(Debug, Clone)]
pub struct TrackerSnapshot {
    pub cwd: Option<PathBuf>,
    pub cwd_state: TrackerState,
    pub process: Option<String>,
    pub process_state: TrackerState,
    /// Directory reported once cwd tracking is disabled.
    pub fallback_cwd: PathBuf,
}

impl TrackerSnapshot {
    pub fn cwd_disabled(&self) -> bool {
        self.cwd_state == TrackerState::Disabled
    }
}

/// Tick cadence and per-query bound.
#[derive(Debug, Clone, Copy)]
pub struct TrackerTiming {
    pub interval: Duration,
    pub query_timeout: Duration,
}

impl Default for TrackerTiming {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(ttyrelay_core::config::TRACKER_INTERVAL_MS),
            query_timeout: Duration::from_millis(ttyrelay_core::config::QUERY_TIMEOUT_MS),
        }
    }
}

#[derive(Debug)]
struct Probe<T> {
    state: TrackerState,
    /// Output arrived while a query was in flight.
    redirtied: bool,
    last: Option<T>,
}

impl<T> Probe<T> {
    fn new() -> Self {
        Self {
            state: TrackerState::Idle,
            redirtied: false,
            last: None,
        }
    }

    fn mark_dirty(&mut self) {
        match self.state {
            TrackerState::Idle => self.state = TrackerState::Dirty,
            TrackerState::Polling => self.redirtied = true,
            TrackerState::Dirty | TrackerState::Disabled => {}
        }
    }

    /// Dirty → Polling. Returns whether a query should be issued.
    fn begin_poll(&mut self) -> bool {
        if self.state != TrackerState::Dirty {
            return false;
        }
        self.state = TrackerState::Polling;
        self.redirtied = false;
        true
    }

    fn settle(&mut self) {
        self.state = if self.redirtied {
            TrackerState::Dirty
        } else {
            TrackerState::Idle
        };
        self.redirtied = false;
    }
}

struct Inner {
    pid: Option<u32>,
    introspector: Arc<dyn Introspector>,
    fallback_cwd: PathBuf,
    timing: TrackerTiming,
    cwd: Mutex<Probe<PathBuf>>,
    process: Mutex<Probe<String>>,
    updates: mpsc::UnboundedSender<MetadataUpdate>,
    cancel: CancellationToken,
}

/// Per-session tracker. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct MetadataTracker {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MetadataTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataTracker")
            .field("pid", &self.inner.pid)
            .field("introspector", &self.inner.introspector.name())
            .finish_non_exhaustive()
    }
}

impl MetadataTracker {
    /// Build a tracker for the shell `pid`.
    ///
    /// `cancel` ends the tick loop and discards any query still in flight;
    /// nothing is sent on the returned receiver after it fires.
    pub fn new(
        pid: Option<u32>,
        introspector: Arc<dyn Introspector>,
        fallback_cwd: PathBuf,
        timing: TrackerTiming,
        cancel: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<MetadataUpdate>) {
        let (updates, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            pid,
            introspector,
            fallback_cwd,
            timing,
            cwd: Mutex::new(Probe::new()),
            process: Mutex::new(Probe::new()),
            updates,
            cancel,
        });
        (Self { inner }, rx)
    }

    /// Record PTY activity. Called for every output chunk, so it only flips flags.
    pub fn mark_dirty(&self) {
        lock(&self.inner.cwd).mark_dirty();
        lock(&self.inner.process).mark_dirty();
    }

    /// Spawn the tick loop on the current runtime.
    pub fn start(&self) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move { tracker.run().await })
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        let cwd = lock(&self.inner.cwd);
        let process = lock(&self.inner.process);
        TrackerSnapshot {
            cwd: cwd.last.clone(),
            cwd_state: cwd.state,
            process: process.last.clone(),
            process_state: process.state,
            fallback_cwd: self.inner.fallback_cwd.clone(),
        }
    }

    async fn run(self) {
        let period = self.inner.timing.interval;
        let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        debug!(pid = ?self.inner.pid, introspector = self.inner.introspector.name(), "metadata tracker started");
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = tick.tick() => self.tick(),
            }
        }
        debug!(pid = ?self.inner.pid, "metadata tracker stopped");
    }

    /// One scheduler tick: launch a query for every dirty, idle-in-flight probe.
    fn tick(&self) {
        if lock(&self.inner.cwd).begin_poll() {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.poll_cwd().await });
        }
        if lock(&self.inner.process).begin_poll() {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.poll_process().await });
        }
    }
}

impl Inner {
    async fn poll_cwd(&self) {
        let result = tokio::select! {
            _ = self.cancel.cancelled() => return,
            r = self.bounded(|pid| self.introspector.cwd(pid)) => r,
        };

        let mut probe = lock(&self.cwd);
        // Late result for a closed session.
        if self.cancel.is_cancelled() {
            return;
        }
        match result {
            Ok(path) => {
                if probe.last.as_ref() != Some(&path) {
                    debug!(pid = ?self.pid, cwd = %path.display(), "cwd changed");
                    probe.last = Some(path.clone());
                    let _ = self.updates.send(MetadataUpdate::Cwd(path));
                }
                probe.settle();
            }
            Err(e) => {
                warn!(pid = ?self.pid, error = %e, "cwd tracking failed; disabling for this session");
                probe.state = TrackerState::Disabled;
                info!(pid = ?self.pid, fallback = %self.fallback_cwd.display(), "reporting fallback cwd");
                let _ = self
                    .updates
                    .send(MetadataUpdate::FallbackCwd(self.fallback_cwd.clone()));
            }
        }
    }

    async fn poll_process(&self) {
        let result = tokio::select! {
            _ = self.cancel.cancelled() => return,
            r = self.bounded(|pid| self.introspector.foreground_process(pid)) => r,
        };

        let mut probe = lock(&self.process);
        if self.cancel.is_cancelled() {
            return;
        }
        match result {
            Ok(name) => {
                if probe.last.as_deref() != Some(name.as_str()) {
                    debug!(pid = ?self.pid, process = %name, "foreground process changed");
                    probe.last = Some(name.clone());
                    let _ = self.updates.send(MetadataUpdate::Process(name));
                }
            }
            Err(e) => warn!(pid = ?self.pid, error = %e, "foreground process lookup failed"),
        }
        probe.settle();
    }

    /// Run one query under the configured timeout.
    async fn bounded<'a, T, F, Fut>(&'a self, query: F) -> Result<T, IntrospectionError>
    where
        F: FnOnce(u32) -> Fut,
        Fut: Future<Output = Result<T, IntrospectionError>> + 'a,
    {
        let Some(pid) = self.pid else {
            return Err(IntrospectionError::Unsupported("shells without a pid"));
        };
        let limit = self.timing.query_timeout;
        match tokio::time::timeout(limit, query(pid)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(IntrospectionError::TimedOut {
                ms: limit.as_millis() as u64,
            }),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted introspector with call accounting.
    #[derive(Debug, Default)]
    struct FakeIntrospector {
        cwd: Mutex<Vec<Result<PathBuf, ()>>>,
        process_fails: bool,
        delay: Duration,
        cwd_calls: AtomicUsize,
        process_calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl FakeIntrospector {
        fn cwd_sequence(values: &[&str]) -> Self {
            Self {
                cwd: Mutex::new(values.iter().rev().map(|v| Ok(PathBuf::from(v))).collect()),
                ..Self::default()
            }
        }

        fn failing() -> Self {
            Self {
                cwd: Mutex::new(vec![Err(())]),
                process_fails: true,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl Introspector for FakeIntrospector {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn cwd(&self, _pid: u32) -> Result<PathBuf, IntrospectionError> {
            self.cwd_calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let mut script = lock(&self.cwd);
            // The last scripted value repeats forever.
            let next = if script.len() > 1 {
                script.pop()
            } else {
                script.last().cloned()
            };
            match next {
                Some(Ok(path)) => Ok(path),
                _ => Err(IntrospectionError::Unsupported("fake")),
            }
        }

        async fn foreground_process(&self, _pid: u32) -> Result<String, IntrospectionError> {
            self.process_calls.fetch_add(1, Ordering::SeqCst);
            if self.process_fails {
                Err(IntrospectionError::Parse("fake".into()))
            } else {
                Ok("bash".to_string())
            }
        }
    }

    fn tracker(
        fake: Arc<FakeIntrospector>,
    ) -> (
        MetadataTracker,
        mpsc::UnboundedReceiver<MetadataUpdate>,
        CancellationToken,
    ) {
        let cancel = CancellationToken::new();
        let (tracker, rx) = MetadataTracker::new(
            Some(4242),
            fake,
            PathBuf::from("/home/fallback"),
            TrackerTiming {
                interval: Duration::from_secs(1),
                query_timeout: Duration::from_secs(30),
            },
            cancel.clone(),
        );
        tracker.start();
        (tracker, rx, cancel)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<MetadataUpdate>) -> Vec<MetadataUpdate> {
        let mut out = Vec::new();
        while let Ok(update) = rx.try_recv() {
            out.push(update);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn no_activity_means_no_queries() {
        let fake = Arc::new(FakeIntrospector::cwd_sequence(&["/a"]));
        let (_tracker, mut rx, _cancel) = tracker(Arc::clone(&fake));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fake.cwd_calls.load(Ordering::SeqCst), 0);
        assert_eq!(fake.process_calls.load(Ordering::SeqCst), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn emits_only_on_change() {
        let fake = Arc::new(FakeIntrospector::cwd_sequence(&["/a", "/a", "/b"]));
        let (tracker, mut rx, _cancel) = tracker(Arc::clone(&fake));

        for _ in 0..3 {
            tracker.mark_dirty();
            tokio::time::sleep(Duration::from_millis(1_100)).await;
        }

        let cwd_updates: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|u| !matches!(u, MetadataUpdate::Process(_)))
            .collect();
        assert_eq!(
            cwd_updates,
            vec![
                MetadataUpdate::Cwd(PathBuf::from("/a")),
                MetadataUpdate::Cwd(PathBuf::from("/b")),
            ]
        );
        assert_eq!(fake.cwd_calls.load(Ordering::SeqCst), 3);
        assert_eq!(tracker.snapshot().cwd, Some(PathBuf::from("/b")));
        assert_eq!(tracker.snapshot().process.as_deref(), Some("bash"));
    }

    #[tokio::test(start_paused = true)]
    async fn cwd_failure_falls_back_exactly_once() {
        let fake = Arc::new(FakeIntrospector::failing());
        let (tracker, mut rx, _cancel) = tracker(Arc::clone(&fake));

        for _ in 0..20 {
            tracker.mark_dirty();
            tokio::time::sleep(Duration::from_millis(700)).await;
        }

        let cwd_updates: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|u| !matches!(u, MetadataUpdate::Process(_)))
            .collect();
        assert_eq!(
            cwd_updates,
            vec![MetadataUpdate::FallbackCwd(PathBuf::from("/home/fallback"))]
        );
        assert_eq!(fake.cwd_calls.load(Ordering::SeqCst), 1);
        assert!(tracker.snapshot().cwd_disabled());
    }

    #[tokio::test(start_paused = true)]
    async fn process_failures_retry_on_next_dirty_tick() {
        let fake = Arc::new(FakeIntrospector::failing());
        let (tracker, _rx, _cancel) = tracker(Arc::clone(&fake));

        tracker.mark_dirty();
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        tracker.mark_dirty();
        tokio::time::sleep(Duration::from_millis(1_000)).await;

        assert_eq!(fake.process_calls.load(Ordering::SeqCst), 2);
        assert_ne!(tracker.snapshot().process_state, TrackerState::Disabled);
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_one_query_in_flight() {
        let fake = Arc::new(FakeIntrospector {
            delay: Duration::from_millis(3_500),
            ..FakeIntrospector::cwd_sequence(&["/slow"])
        });
        let (tracker, _rx, _cancel) = tracker(Arc::clone(&fake));

        for _ in 0..100 {
            tracker.mark_dirty();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        assert_eq!(fake.max_in_flight.load(Ordering::SeqCst), 1);
        // 10 s of constant output, 3.5 s per query: never more than one query per tick.
        assert!(fake.cwd_calls.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_queries_time_out_and_disable_cwd() {
        let fake = Arc::new(FakeIntrospector {
            delay: Duration::from_secs(60),
            ..FakeIntrospector::cwd_sequence(&["/never"])
        });
        let (tracker, mut rx, _cancel) = tracker(Arc::clone(&fake));

        tracker.mark_dirty();
        tokio::time::sleep(Duration::from_secs(32)).await;

        assert!(tracker.snapshot().cwd_disabled());
        assert!(drain(&mut rx).contains(&MetadataUpdate::FallbackCwd(PathBuf::from(
            "/home/fallback"
        ))));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_discards_in_flight_results() {
        let fake = Arc::new(FakeIntrospector {
            delay: Duration::from_secs(2),
            ..FakeIntrospector::cwd_sequence(&["/late"])
        });
        let (tracker, mut rx, cancel) = tracker(Arc::clone(&fake));

        tracker.mark_dirty();
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(tracker.snapshot().cwd_state, TrackerState::Polling);

        cancel.cancel();
        tracker.mark_dirty();
        tokio::time::sleep(Duration::from_secs(5)).await;

        let late: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|u| !matches!(u, MetadataUpdate::Process(_)))
            .collect();
        assert!(late.is_empty(), "unexpected updates after cancel: {late:?}");
        assert_eq!(fake.cwd_calls.load(Ordering::SeqCst), 1);
    }
}
