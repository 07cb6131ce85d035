//! Error types for the ttyrelay-terminal crate.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can originate from PTY operations.
#[derive(Debug, Error)]
pub enum TerminalError {
    /// PTY allocation or child-process spawn failed (shell missing, out of PTYs, …).
    #[error("PTY spawn error: {0}")]
    PtySpawn(String),

    /// The requested working directory does not exist or is not a directory.
    #[error("Working directory does not exist: {}", .0.display())]
    CwdMissing(PathBuf),

    /// Underlying I/O failure (read, write, flush).
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    Introspection(#[from] IntrospectionError),
}

/// Failure of a single OS-level metadata query.
#[derive(Debug, Error)]
pub enum IntrospectionError {
    #[error("Process introspection is not supported on {0}")]
    Unsupported(&'static str),

    #[error("Introspection I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("`{command}` failed: {detail}")]
    CommandFailed { command: String, detail: String },

    #[error("Could not parse introspection output: {0}")]
    Parse(String),

    #[error("Introspection timed out after {ms}ms")]
    TimedOut { ms: u64 },
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, TerminalError>;
