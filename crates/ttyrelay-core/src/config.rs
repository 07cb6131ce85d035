use std::collections::BTreeMap;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_BASE_PORT: u16 = 3000;
/// Secondary sessions start this many ports above the primary.
pub const SECONDARY_PORT_OFFSET: u16 = 2;
pub const DEFAULT_SECONDARY_SLOTS: u16 = 4;
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;
pub const DEFAULT_TERM: &str = "xterm-256color";
pub const MAX_FRAME_BYTES: usize = 1024 * 1024; // 1 MB per client frame
pub const TRACKER_INTERVAL_MS: u64 = 1_000; // metadata poll cadence
pub const QUERY_TIMEOUT_MS: u64 = 5_000; // upper bound on one OS query

/// Top-level config (ttyrelay.toml + TTYRELAY_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub shell: ShellSettings,
    #[serde(default)]
    pub tracker: TrackerConfig,
}

/// Listener side of every session: where ports live and who may connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Port of the primary session. Secondaries occupy `base_port + 2 ..`.
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    #[serde(default = "default_secondary_slots")]
    pub secondary_slots: u16,
    /// Exact `Origin` header values accepted at the WebSocket handshake.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
    /// Accept handshakes that carry no `Origin` header at all (non-browser clients).
    #[serde(default = "bool_true")]
    pub allow_missing_origin: bool,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            base_port: DEFAULT_BASE_PORT,
            secondary_slots: DEFAULT_SECONDARY_SLOTS,
            allowed_origins: default_allowed_origins(),
            allow_missing_origin: true,
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }
}

impl BridgeConfig {
    /// First port of the secondary range.
    pub fn secondary_base(&self) -> u16 {
        self.base_port.saturating_add(SECONDARY_PORT_OFFSET)
    }

    /// All secondary ports in allocation order, cut short at the last TCP port.
    pub fn secondary_ports(&self) -> impl Iterator<Item = u16> {
        let base = self.secondary_base();
        (0..self.secondary_slots).map_while(move |i| base.checked_add(i))
    }
}

/// How sessions launch their shell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellSettings {
    /// Shell binary. Falls back to `$SHELL`, then a platform default.
    pub program: Option<String>,
    /// Startup arguments. Empty means the platform default (`--login` on POSIX).
    #[serde(default)]
    pub args: Vec<String>,
    /// Initial working directory. Falls back to the process working directory.
    pub cwd: Option<String>,
    /// Extra variables layered over the inherited environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
}

impl Default for ShellSettings {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            interval_ms: TRACKER_INTERVAL_MS,
            query_timeout_ms: QUERY_TIMEOUT_MS,
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_base_port() -> u16 {
    DEFAULT_BASE_PORT
}
fn default_secondary_slots() -> u16 {
    DEFAULT_SECONDARY_SLOTS
}
fn default_allowed_origins() -> Vec<String> {
    // Desktop shells load their UI from file://, which browsers report as either form.
    vec!["file://".to_string(), "null".to_string()]
}
fn default_max_frame_bytes() -> usize {
    MAX_FRAME_BYTES
}
fn default_cols() -> u16 {
    DEFAULT_COLS
}
fn default_rows() -> u16 {
    DEFAULT_ROWS
}
fn default_interval_ms() -> u64 {
    TRACKER_INTERVAL_MS
}
fn default_query_timeout_ms() -> u64 {
    QUERY_TIMEOUT_MS
}

impl RelayConfig {
    /// Load config from a TOML file with TTYRELAY_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.ttyrelay/ttyrelay.toml
    ///
    /// Nested keys use a double underscore: `TTYRELAY_BRIDGE__BASE_PORT=4000`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: RelayConfig = Figment::from(Serialized::defaults(RelayConfig::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("TTYRELAY_").split("__"))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject port layouts that cannot be allocated.
    pub fn validate(&self) -> Result<()> {
        if self.bridge.secondary_slots == 0 {
            return Err(CoreError::Invalid(
                "bridge.secondary_slots must be at least 1".to_string(),
            ));
        }
        let last = u32::from(self.bridge.base_port)
            + u32::from(SECONDARY_PORT_OFFSET)
            + u32::from(self.bridge.secondary_slots)
            - 1;
        if last > u32::from(u16::MAX) {
            return Err(CoreError::Invalid(format!(
                "secondary range ends at {last}, beyond the last TCP port"
            )));
        }
        if self.shell.cols == 0 || self.shell.rows == 0 {
            return Err(CoreError::Invalid(
                "shell.cols and shell.rows must be non-zero".to_string(),
            ));
        }
        if self.tracker.interval_ms == 0 {
            return Err(CoreError::Invalid(
                "tracker.interval_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.ttyrelay/ttyrelay.toml", home)
}
