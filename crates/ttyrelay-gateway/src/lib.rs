//! ttyrelay-gateway: bridges PTY shells to display clients over WebSockets.
//!
//! Each [`session::TerminalSession`] owns one shell, one metadata tracker,
//! one control channel and one listening port. The [`registry::SessionRegistry`]
//! hands out those ports: the primary session sits on the base port and up to
//! N secondaries occupy `base + 2 ..= base + 1 + N`.

pub mod control;
pub mod error;
pub mod events;
pub mod registry;
pub mod session;
pub mod shell;
pub mod ws;

pub use control::ControlChannel;
pub use error::{GatewayError, Result};
pub use events::{EventStream, HostEvent, SessionEvent};
pub use registry::SessionRegistry;
pub use session::{SessionInfo, SessionRole, TerminalSession};
