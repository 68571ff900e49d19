//! Client error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    /// The server answered with a different storage identity than before;
    /// local history belongs to another database.
    #[error("Server mismatch: expected {expected}, got {actual}")]
    ServerMismatch { expected: String, actual: String },

    #[error("Corrupt history: {0}")]
    CorruptHistory(String),

    #[error("Server error {code}: {message}")]
    Server { code: String, message: String },

    #[error("Core error: {0}")]
    Core(#[from] tandem_core::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] tandem_protocol::ProtocolError),

    #[cfg(feature = "websocket")]
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Disconnected")]
    Disconnected,
}

impl ClientError {
    /// Whether the session cannot continue after this error
    pub fn is_fatal(&self) -> bool {
        match self {
            ClientError::Server { code, .. } => code != tandem_protocol::codes::STORAGE,
            _ => true,
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
