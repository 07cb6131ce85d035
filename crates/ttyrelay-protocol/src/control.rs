use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Client → host control message.
/// Wire: `{ "type": "resize", "cols": "040", "rows": "024" }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// The display client is ready; the host replays the cwd it knows.
    Startup,
    Resize {
        #[serde(with = "crate::dimension")]
        cols: u16,
        #[serde(with = "crate::dimension")]
        rows: u16,
    },
}

/// Host → client control message.
/// Wire: `{ "type": "new_cwd", "path": "/home/me" }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    NewCwd {
        path: String,
    },
    /// Sent once, when OS-level cwd tracking is permanently off for the session.
    FallbackCwd {
        path: String,
    },
    NewProcess {
        name: String,
    },
    /// Acknowledges an applied `Resize`.
    Resized {
        #[serde(with = "crate::dimension")]
        cols: u16,
        #[serde(with = "crate::dimension")]
        rows: u16,
    },
}

impl ClientMessage {
    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("control message serialization is infallible")
    }
}

impl HostMessage {
    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("control message serialization is infallible")
    }
}
