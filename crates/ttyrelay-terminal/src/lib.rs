//! ttyrelay-terminal: PTY-backed shell processes and the metadata tracker
//! that watches them.
//!
//! - [`pty::PtyProcess`]: one shell on a pseudo-terminal, with byte output,
//!   resize, idempotent kill and an exit notification.
//! - [`introspect::Introspector`]: per-platform strategy answering "where is
//!   this shell and what is it running?".
//! - [`tracker::MetadataTracker`]: debounced polling of the introspector,
//!   driven by PTY activity, with a permanent cwd fallback on failure.

pub mod error;
pub mod introspect;
pub mod pty;
pub mod tracker;
pub mod types;

pub use error::{IntrospectionError, Result, TerminalError};
pub use introspect::{native_introspector, Introspector};
pub use pty::{PtyProcess, PtyStreams};
pub use tracker::{MetadataTracker, MetadataUpdate, TrackerSnapshot, TrackerState, TrackerTiming};
pub use types::{Dimensions, ExitStatus, ShellConfig};
