//! Error types for Tandem Core

use thiserror::Error;

/// Core error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid document name: {0}")]
    InvalidDocumentName(String),

    #[error("Changes are not contiguous: {left_end} != {right_start}")]
    Discontiguous { left_end: usize, right_start: usize },

    #[error("Changes do not share an ancestor: base starts at {base}, uncommitted at {uncommitted}")]
    Misaligned { base: usize, uncommitted: usize },

    #[error("Backtrack mismatch for author {author_id}: reported {backtrack}, expected {rejections}")]
    BacktrackMismatch {
        author_id: u32,
        backtrack: usize,
        rejections: usize,
    },

    #[error("Change for author {author_id} starts at {start}, before its continuation base at {base_start}")]
    StaleBase {
        author_id: u32,
        start: usize,
        base_start: usize,
    },

    #[error("Change starts at {start}, past the end of history at {end}")]
    AheadOfHistory { start: usize, end: usize },

    #[error("Step position {0} overflows the offset space")]
    PositionOverflow(usize),

    #[error("Step out of range: position {pos} in document of length {len}")]
    OutOfRange { pos: usize, len: usize },

    #[error("Deleted text does not match document at position {0}")]
    TextMismatch(usize),

    #[error("History splice mismatch: expected change ending at {expected}, history ends at {actual}")]
    HistoryMismatch { expected: usize, actual: usize },

    #[error("Unknown author: {0}")]
    UnknownAuthor(u32),
}

impl Error {
    /// Whether this error means the peer broke the rebase protocol
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::BacktrackMismatch { .. }
                | Error::StaleBase { .. }
                | Error::AheadOfHistory { .. }
                | Error::PositionOverflow(_)
                | Error::OutOfRange { .. }
                | Error::TextMismatch(_)
        )
    }
}

/// Result type alias for Tandem Core operations
pub type Result<T> = std::result::Result<T, Error>;
