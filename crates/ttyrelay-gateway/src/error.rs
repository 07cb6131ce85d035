use thiserror::Error;
use ttyrelay_core::CoreError;
use ttyrelay_terminal::TerminalError;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Invalid relay config: {0}")]
    Config(#[from] CoreError),

    /// Shell could not be started: missing binary or cwd, PTY exhaustion, …
    #[error("Session spawn failed: {0}")]
    Spawn(#[from] TerminalError),

    #[error("Could not listen on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("All {slots} secondary sessions are in use")]
    Exhausted { slots: u16 },

    #[error("Primary session already running on port {0}")]
    PrimaryAlreadySpawned(u16),

    #[error("Port {0} is outside the configured session range")]
    PortOutOfRange(u16),

    #[error("Port {0} is still owned by another session")]
    PortBusy(u16),

    #[error("Cannot determine a working directory: {0}")]
    NoWorkingDirectory(#[source] std::io::Error),
}

impl GatewayError {
    /// Short error code string, suitable for host-facing replies.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Config(_) => "CONFIG_INVALID",
            GatewayError::Spawn(_) => "SPAWN_FAILED",
            GatewayError::Bind { .. } => "SPAWN_FAILED",
            GatewayError::Exhausted { .. } => "EXHAUSTED",
            GatewayError::PrimaryAlreadySpawned(_) => "PRIMARY_RUNNING",
            GatewayError::PortOutOfRange(_) => "PORT_OUT_OF_RANGE",
            GatewayError::PortBusy(_) => "PORT_BUSY",
            GatewayError::NoWorkingDirectory(_) => "NO_CWD",
        }
    }

    /// Whether this failure happened while starting a session's shell or listener.
    pub fn is_spawn_error(&self) -> bool {
        matches!(
            self,
            GatewayError::Spawn(_) | GatewayError::Bind { .. } | GatewayError::NoWorkingDirectory(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
