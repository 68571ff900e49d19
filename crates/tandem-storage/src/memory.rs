//! In-memory storage backend

use crate::{matches_pattern, Storage, StorageError, StorageStats, StoredHistory};
use async_trait::async_trait;
use dashmap::DashMap;
use tandem_core::{DocumentName, Transaction};
use tracing::debug;
use uuid::Uuid;

/// In-memory storage backend
///
/// Fast, volatile storage suitable for development and tests.
/// Data is lost when the process exits.
pub struct MemoryStorage {
    docs: DashMap<DocumentName, StoredHistory>,
    server_id: String,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            docs: DashMap::new(),
            server_id: Uuid::new_v4().to_string(),
        }
    }

    /// Storage pre-seeded with a document's history
    pub fn with_document(self, doc: DocumentName, history: StoredHistory) -> Self {
        self.docs.insert(doc, history);
        self
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn load(&self, doc: &DocumentName) -> Result<StoredHistory, StorageError> {
        Ok(self.docs.entry(doc.clone()).or_default().clone())
    }

    async fn append(
        &self,
        doc: &DocumentName,
        expected_offset: usize,
        transactions: &[Transaction],
        stores: &[serde_json::Value],
    ) -> Result<usize, StorageError> {
        let mut entry = self.docs.entry(doc.clone()).or_default();
        let history = entry.value_mut();

        if history.end() != expected_offset {
            return Err(StorageError::OffsetMismatch {
                expected: expected_offset,
                actual: history.end(),
            });
        }

        history.transactions.extend_from_slice(transactions);
        history
            .stores
            .extend((0..transactions.len()).map(|i| stores.get(i).cloned().unwrap_or_default()));

        debug!(doc = %doc, appended = transactions.len(), length = history.end(), "Appended history");
        Ok(history.end())
    }

    async fn server_id(&self) -> Result<String, StorageError> {
        Ok(self.server_id.clone())
    }

    async fn list(&self, pattern: Option<&str>) -> Result<Vec<DocumentName>, StorageError> {
        Ok(self
            .docs
            .iter()
            .filter(|entry| pattern.map_or(true, |p| matches_pattern(entry.key().as_str(), p)))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn stats(&self) -> Result<StorageStats, StorageError> {
        Ok(StorageStats {
            document_count: self.docs.len(),
            transaction_count: self.docs.iter().map(|entry| entry.value().len()).sum(),
        })
    }
}
