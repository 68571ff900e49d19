//! Tandem Core - change primitive, rebase and document state
//!
//! This crate provides the synchronization core shared by server and client:
//! - Positioned batches of text transactions and their rebase
//! - The server-side coordinator admitting concurrent edits
//! - The client-side engine mirroring it

pub mod change;
pub mod coordinator;
pub mod document;
pub mod engine;
pub mod error;
pub mod rebase;
pub mod state;

pub use change::{AuthorId, Change, Selection, Step, TextDocument, Transaction};
pub use coordinator::{CoordinatorStats, Credentials, RebaseCoordinator};
pub use document::DocumentName;
pub use engine::{Accepted, ClientRebaseEngine, EngineHost};
pub use error::{Error, Result};
pub use rebase::{rebase_uncommitted_change, RebaseResult};
pub use state::{author_color, AuthorData, AuthorPatch, AuthorRecord, DocumentState, AUTHOR_COLORS};
