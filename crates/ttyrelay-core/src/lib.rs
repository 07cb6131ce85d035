//! ttyrelay-core: configuration and constants shared by every ttyrelay crate.

pub mod config;
pub mod error;

pub use error::{CoreError, Result};
