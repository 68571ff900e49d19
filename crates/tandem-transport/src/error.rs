//! Transport error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Core error: {0}")]
    Core(#[from] tandem_core::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] tandem_protocol::ProtocolError),

    #[error("Storage error: {0}")]
    Storage(#[from] tandem_storage::StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "websocket")]
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Connection closed")]
    Closed,
}

impl TransportError {
    /// Whether the peer broke the rebase protocol and must be disconnected
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, TransportError::Core(_))
    }
}

pub type TransportResult<T> = Result<T, TransportError>;
