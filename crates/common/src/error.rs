use thiserror::Error;

/// Common error types for bitmesh
#[derive(Debug, Error)]
pub enum BitmeshError {
    /// Malformed input on the control link. Fatal to the link.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The routing daemon rejected a command. The link stays open.
    #[error("Request rejected ({code}): {message}")]
    Request { code: u16, message: String },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: u64, available: u64 },

    #[error("Duplicate token: {0}")]
    DuplicateToken(String),

    #[error("Replay detected: expected sequence {expected}, got {got}")]
    ReplayDetected { expected: u16, got: u16 },

    /// A required subsystem (control link, bank login) is not ready.
    #[error("Dependency not ready: {0}")]
    Dependency(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type for bitmesh operations
pub type Result<T> = std::result::Result<T, BitmeshError>;

impl BitmeshError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn request(code: u16, msg: impl Into<String>) -> Self {
        Self::Request {
            code,
            message: msg.into(),
        }
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn dependency(msg: impl Into<String>) -> Self {
        Self::Dependency(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the failure is worth retrying later (timeouts, I/O hiccups)
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Io(_) | Self::Dependency(_))
    }
}
