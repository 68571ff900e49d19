//! Tandem Storage Backends
//!
//! Persists each document's committed history as an append-only log:
//! - Memory (default): Fast, volatile storage
//! - SQLite: Embedded persistence

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tandem_core::{Change, DocumentName, Transaction};

/// Persisted history of one document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredHistory {
    pub start: usize,
    pub transactions: Vec<Transaction>,
    /// One opaque blob per transaction
    pub stores: Vec<serde_json::Value>,
}

impl StoredHistory {
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Offset the next append must start at
    pub fn end(&self) -> usize {
        self.start + self.transactions.len()
    }

    pub fn into_change(self) -> Change {
        Change::new(self.start, self.transactions).with_stores(self.stores)
    }
}

/// Storage backend trait
#[async_trait]
pub trait Storage: Send + Sync {
    /// Load a document's history, creating an empty one if absent
    async fn load(&self, doc: &DocumentName) -> Result<StoredHistory, StorageError>;

    /// Append transactions at `expected_offset`, which must equal the
    /// persisted length. Returns the new length.
    async fn append(
        &self,
        doc: &DocumentName,
        expected_offset: usize,
        transactions: &[Transaction],
        stores: &[serde_json::Value],
    ) -> Result<usize, StorageError>;

    /// Identity of this storage instance, stable across restarts
    async fn server_id(&self) -> Result<String, StorageError>;

    /// List document names matching a pattern
    async fn list(&self, pattern: Option<&str>) -> Result<Vec<DocumentName>, StorageError>;

    /// Get storage statistics
    async fn stats(&self) -> Result<StorageStats, StorageError>;

    /// Append a committed change at its own start offset
    async fn append_change(&self, doc: &DocumentName, change: &Change) -> Result<usize, StorageError> {
        self.append(doc, change.start(), change.transactions(), change.stores())
            .await
    }
}

/// Storage error types
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Append offset mismatch: expected {expected}, persisted length is {actual}")]
    OffsetMismatch { expected: usize, actual: usize },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Database error: {0}")]
    Database(String),
}

/// Storage statistics
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    pub document_count: usize,
    pub transaction_count: usize,
}

/// Simple glob pattern matching
pub(crate) fn matches_pattern(key: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    if let Some(prefix) = pattern.strip_suffix('*') {
        return key.starts_with(prefix);
    }

    if let Some(suffix) = pattern.strip_prefix('*') {
        return key.ends_with(suffix);
    }

    key == pattern
}

pub use memory::MemoryStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
