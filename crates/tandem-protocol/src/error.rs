//! Protocol error types

use thiserror::Error;

/// Protocol-specific errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Message too large: {size} > {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Invalid MessagePack: {0}")]
    InvalidMessagePack(#[from] rmp_serde::decode::Error),

    #[error("Encoding failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Core error: {0}")]
    Core(#[from] tandem_core::Error),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;
