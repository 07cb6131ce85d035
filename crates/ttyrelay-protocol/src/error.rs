use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed control frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid dimension {value:?}: {reason}")]
    InvalidDimension { value: String, reason: &'static str },
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
