use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl CoreError {
    /// Short error code string, suitable for logs and host-facing replies.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Config(_) => "CONFIG_ERROR",
            CoreError::Invalid(_) => "CONFIG_INVALID",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
