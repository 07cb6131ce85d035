//! Shared data types for ttyrelay-terminal.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use ttyrelay_core::config::{DEFAULT_COLS, DEFAULT_ROWS, DEFAULT_TERM};

use crate::error::{Result, TerminalError};

// ---------------------------------------------------------------------------
// Dimensions
// ---------------------------------------------------------------------------

/// Terminal size in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub cols: u16,
    pub rows: u16,
}

impl Dimensions {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl Default for Dimensions {
    fn default() -> Self {
        Self::new(DEFAULT_COLS, DEFAULT_ROWS)
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

// ---------------------------------------------------------------------------
// ExitStatus
// ---------------------------------------------------------------------------

/// How a shell process ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub code: u32,
    /// Name of the terminating signal, when the process did not exit normally.
    pub signal: Option<String>,
}

impl From<portable_pty::ExitStatus> for ExitStatus {
    fn from(status: portable_pty::ExitStatus) -> Self {
        Self {
            code: status.exit_code(),
            signal: status.signal().map(str::to_string),
        }
    }
}

// ---------------------------------------------------------------------------
// ShellConfig
// ---------------------------------------------------------------------------

/// Everything needed to launch one shell on a PTY.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    /// Shell binary, resolved through `PATH` when not absolute.
    pub shell: String,

    /// Startup arguments. Empty selects the platform default, see
    /// [`ShellConfig::effective_args`].
    pub args: Vec<String>,

    /// Directory the shell starts in. Must exist.
    pub cwd: PathBuf,

    /// Complete environment for the child, applied over the inherited one.
    pub env: BTreeMap<String, String>,

    /// Initial terminal size.
    pub size: Dimensions,
}

impl ShellConfig {
    pub fn new(shell: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: BTreeMap::new(),
            size: Dimensions::default(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_size(mut self, cols: u16, rows: u16) -> Self {
        self.size = Dimensions::new(cols, rows);
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    /// Arguments actually passed to the shell: the configured ones, or a
    /// login-shell flag on POSIX when none were given.
    pub fn effective_args(&self) -> Vec<String> {
        if !self.args.is_empty() {
            return self.args.clone();
        }
        if cfg!(windows) {
            Vec::new()
        } else {
            vec!["--login".to_string()]
        }
    }

    /// Terminal type advertised to the child.
    pub fn term(&self) -> &str {
        self.env.get("TERM").map(String::as_str).unwrap_or(DEFAULT_TERM)
    }

    /// Reject configurations that cannot possibly spawn.
    pub fn validate(&self) -> Result<()> {
        if !is_dir(&self.cwd) {
            return Err(TerminalError::CwdMissing(self.cwd.clone()));
        }
        if self.shell.trim().is_empty() {
            return Err(TerminalError::PtySpawn("empty shell command".to_string()));
        }
        Ok(())
    }
}

fn is_dir(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false)
}
