//! Error types for mesh-call

use thiserror::Error;

/// Main error type for call orchestration
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration retrieval or validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Signaling protocol errors
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// Websocket-level errors on the signaling channel
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Envelope encode/decode errors
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Errors raised by the underlying transport engine
    #[error("Transport error: {0}")]
    Transport(String),

    /// Timeout errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Invalid state for operation
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a signaling error
    pub fn signaling(msg: impl Into<String>) -> Self {
        Self::Signaling(msg.into())
    }

    /// Whether the error is session-scoped and eligible for the bounded
    /// retry path, as opposed to fatal to call startup.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Timeout(_))
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Self::Timeout(err.to_string())
    }
}

/// Result type for call orchestration operations
pub type Result<T> = std::result::Result<T, Error>;
