//! PTY process: a real shell backed by `portable-pty`.
//!
//! Each `PtyProcess` owns the master side of a pseudo-terminal pair and a
//! spawned shell. Two dedicated OS threads do the blocking work: one drains
//! the master read-end into an async channel, the other waits for the child
//! and reports its exit status.

use std::{
    io::{Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::{
    error::{Result, TerminalError},
    types::{Dimensions, ExitStatus, ShellConfig},
};

const READ_CHUNK: usize = 8192;

/// Receiving ends handed to the owner of a freshly spawned [`PtyProcess`].
#[derive(Debug)]
pub struct PtyStreams {
    /// Raw output chunks, in the order the shell produced them.
    pub output: mpsc::UnboundedReceiver<Vec<u8>>,
    /// Fires exactly once when the child is reaped.
    pub exit: oneshot::Receiver<ExitStatus>,
}

/// A live shell process attached to a pseudo-terminal.
///
/// The struct uses:
/// - `Mutex<Box<dyn Write>>` for the write half (client input → shell)
/// - `Mutex<Box<dyn MasterPty>>` for resize (requires exclusive access)
/// - `Mutex<bool>` as the output gate, so `kill` can guarantee silence
/// - `AtomicBool` to track whether the child has been reaped
pub struct PtyProcess {
    pid: Option<u32>,
    writer: Mutex<Box<dyn Write + Send>>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    /// Last size successfully applied, reported if the master cannot be queried.
    size: Mutex<Dimensions>,
    /// `true` once `kill` ran; the reader thread checks it under the same lock
    /// before delivering each chunk.
    silenced: Arc<Mutex<bool>>,
    alive: Arc<AtomicBool>,
}

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess")
            .field("pid", &self.pid)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

impl PtyProcess {
    /// Spawn `config.shell` on a new PTY.
    ///
    /// The caller is expected to have validated the working directory; it is
    /// checked again here so a vanished directory still yields `CwdMissing`
    /// rather than an opaque spawn failure.
    pub fn spawn(config: &ShellConfig) -> Result<(Self, PtyStreams)> {
        config.validate()?;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(pty_size(config.size))
            .map_err(|e| TerminalError::PtySpawn(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&config.shell);
        cmd.args(config.effective_args());
        cmd.cwd(&config.cwd);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        cmd.env("TERM", config.term());

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TerminalError::PtySpawn(format!("{}: {e}", config.shell)))?;
        // The child holds its own copy; keeping ours would suppress EOF on exit.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| TerminalError::PtySpawn(e.to_string()))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| TerminalError::PtySpawn(e.to_string()))?;

        let silenced = Arc::new(Mutex::new(false));
        let alive = Arc::new(AtomicBool::new(true));

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        // Blocking I/O runs in dedicated OS threads so it never blocks Tokio.
        spawn_reader(reader, output_tx, Arc::clone(&silenced), pid);

        let alive_clone = Arc::clone(&alive);
        std::thread::spawn(move || {
            let status = match child.wait() {
                Ok(status) => ExitStatus::from(status),
                Err(e) => {
                    warn!(?pid, error = %e, "waiting for shell failed");
                    ExitStatus {
                        code: 1,
                        signal: None,
                    }
                }
            };
            alive_clone.store(false, Ordering::Release);
            debug!(?pid, code = status.code, signal = ?status.signal, "shell reaped");
            let _ = exit_tx.send(status);
        });

        info!(?pid, shell = %config.shell, cwd = %config.cwd.display(), size = %config.size, "spawned PTY shell");

        Ok((
            Self {
                pid,
                writer: Mutex::new(writer),
                master: Mutex::new(pair.master),
                killer: Mutex::new(killer),
                size: Mutex::new(config.size),
                silenced,
                alive,
            },
            PtyStreams {
                output: output_rx,
                exit: exit_rx,
            },
        ))
    }

    /// OS process id of the shell, when the platform exposes one.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Write raw bytes to the shell's input.
    ///
    /// Best-effort: there is no backpressure beyond the PTY's own buffer.
    pub fn write(&self, input: &[u8]) -> Result<()> {
        let mut guard = lock(&self.writer);
        guard.write_all(input)?;
        guard.flush()?;
        Ok(())
    }

    /// Resize the terminal window.
    ///
    /// A dead shell makes the resize immaterial, so failures are logged and
    /// never surfaced.
    pub fn resize(&self, cols: u16, rows: u16) {
        let size = Dimensions::new(cols, rows);
        if !self.is_alive() {
            debug!(pid = ?self.pid, %size, "resize ignored: shell already exited");
            return;
        }
        let result = lock(&self.master).resize(pty_size(size));
        match result {
            Ok(()) => *lock(&self.size) = size,
            Err(e) => warn!(pid = ?self.pid, %size, error = %e, "PTY resize failed"),
        }
    }

    /// Current terminal size as reported by the PTY.
    pub fn size(&self) -> Dimensions {
        match lock(&self.master).get_size() {
            Ok(size) => Dimensions::new(size.cols, size.rows),
            Err(_) => *lock(&self.size),
        }
    }

    /// Returns `true` until the shell has been reaped.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Terminate the shell.
    ///
    /// Idempotent. Once this returns the reader queues no new chunk; chunks
    /// already queued on [`PtyStreams::output`] can still be received.
    pub fn kill(&self) {
        {
            let mut silenced = lock(&self.silenced);
            if *silenced {
                return;
            }
            *silenced = true;
        }
        if !self.is_alive() {
            return;
        }
        match lock(&self.killer).kill() {
            Ok(()) => info!(pid = ?self.pid, "killed PTY shell"),
            // Already gone between the liveness check and the signal.
            Err(e) => debug!(pid = ?self.pid, error = %e, "kill after exit"),
        }
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    output_tx: mpsc::UnboundedSender<Vec<u8>>,
    silenced: Arc<Mutex<bool>>,
    pid: Option<u32>,
) {
    std::thread::spawn(move || {
        let mut raw = [0u8; READ_CHUNK];
        loop {
            match reader.read(&mut raw) {
                Ok(0) => break, // EOF, shell exited
                Ok(n) => {
                    let silenced = lock(&silenced);
                    if *silenced || output_tx.send(raw[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                // EIO is how Linux reports a closed slave side.
                Err(e) => {
                    debug!(?pid, error = %e, "PTY reader stopped");
                    break;
                }
            }
        }
        debug!(?pid, "PTY reader thread exited");
    });
}

fn pty_size(size: Dimensions) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Lock a std mutex, recovering the data if a holder panicked.
fn lock<T: ?Sized>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
