//! ttyrelay-protocol: the control-channel vocabulary spoken next to the raw
//! terminal byte stream.
//!
//! The byte stream itself is unframed and never touches this crate; only the
//! lifecycle side-channel (`startup`, `resize`, cwd and process updates) is
//! modelled here.

pub mod control;
pub mod dimension;
pub mod error;

pub use control::{ClientMessage, HostMessage};
pub use error::{ProtocolError, Result};

/// Route serving the raw terminal byte stream on every session port.
pub const STREAM_PATH: &str = "/";

/// Route serving the JSON control channel on every session port.
pub const CONTROL_PATH: &str = "/control";
