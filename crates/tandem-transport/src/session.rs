//! Session orchestration - authentication, history replay and event routing

use crate::error::{TransportError, TransportResult};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tandem_core::{AuthorData, AuthorId, AuthorPatch, Change, DocumentName, RebaseCoordinator};
use tandem_protocol::ServerMessage;
use tandem_storage::Storage;
use tokio::sync::{broadcast, Mutex, OnceCell};
use tracing::{debug, error, info};

/// Default capacity of each document's broadcast channel
pub const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

/// Identity of an authenticated connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub doc: DocumentName,
    pub author_id: AuthorId,
    pub token: String,
    pub resumed: bool,
}

/// Messages for a newly joined connection, plus its broadcast subscription
pub struct Welcome {
    pub messages: Vec<ServerMessage>,
    pub updates: broadcast::Receiver<ServerMessage>,
}

/// Result of a submission
#[derive(Debug, Clone, PartialEq)]
pub struct Submitted {
    /// Change appended to history; empty when nothing was admitted
    pub applied: Change,
    /// Transactions of the submission the sender must roll back
    pub rejections: usize,
}

/// Per-document session state
struct DocumentSession {
    loaded: OnceCell<()>,
    /// Length of history known to be in storage
    persisted: AtomicUsize,
    /// Serializes admission, persistence and broadcast
    submit: Mutex<()>,
    updates: broadcast::Sender<ServerMessage>,
}

impl DocumentSession {
    fn new(capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(capacity);
        Self {
            loaded: OnceCell::new(),
            persisted: AtomicUsize::new(0),
            submit: Mutex::new(()),
            updates,
        }
    }
}

/// Wraps a [`RebaseCoordinator`] and a storage backend, and routes events
/// for every connection of every document.
pub struct SessionOrchestrator {
    coordinator: RebaseCoordinator,
    storage: Arc<dyn Storage>,
    sessions: DashMap<DocumentName, Arc<DocumentSession>>,
    server_id: OnceCell<String>,
    broadcast_capacity: usize,
}

impl SessionOrchestrator {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            coordinator: RebaseCoordinator::new(),
            storage,
            sessions: DashMap::new(),
            server_id: OnceCell::new(),
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
        }
    }

    pub fn with_broadcast_capacity(mut self, capacity: usize) -> Self {
        self.broadcast_capacity = capacity.max(1);
        self
    }

    pub fn coordinator(&self) -> &RebaseCoordinator {
        &self.coordinator
    }

    fn session(&self, doc: &DocumentName) -> Arc<DocumentSession> {
        self.sessions
            .entry(doc.clone())
            .or_insert_with(|| Arc::new(DocumentSession::new(self.broadcast_capacity)))
            .value()
            .clone()
    }

    /// Storage identity, fetched once
    pub async fn server_id(&self) -> TransportResult<String> {
        let id = self
            .server_id
            .get_or_try_init(|| async { self.storage.server_id().await })
            .await?;
        Ok(id.clone())
    }

    /// Load a document's history from storage exactly once. Concurrent
    /// callers await the same in-flight load.
    pub async fn ensure_loaded(&self, doc: &DocumentName) -> TransportResult<()> {
        let session = self.session(doc);
        session
            .loaded
            .get_or_try_init(|| async {
                let stored = self.storage.load(doc).await?;
                info!(doc = %doc, start = stored.start, length = stored.end(), "Loaded document");
                session.persisted.store(stored.end(), Ordering::Release);
                self.coordinator.load_history(doc, stored.into_change());
                Ok::<_, TransportError>(())
            })
            .await?;
        Ok(())
    }

    /// Resume or mint the identity of a connection
    pub async fn authenticate(
        &self,
        doc: &DocumentName,
        author_id: Option<AuthorId>,
        token: Option<&str>,
    ) -> TransportResult<SessionContext> {
        self.ensure_loaded(doc).await?;
        let credentials = self.coordinator.authenticate(doc, author_id, token);
        info!(
            doc = %doc,
            author = credentials.author_id,
            resumed = credentials.resumed,
            "Authenticated connection"
        );
        Ok(SessionContext {
            doc: doc.clone(),
            author_id: credentials.author_id,
            token: credentials.token,
            resumed: credentials.resumed,
        })
    }

    /// Register the author, announce it, and replay history from
    /// `start_length` (zero means everything).
    pub async fn welcome_client(
        &self,
        context: &SessionContext,
        start_length: usize,
    ) -> TransportResult<Welcome> {
        let server_id = self.server_id().await?;
        let session = self.session(&context.doc);
        // No change may be broadcast between the snapshot and the subscription.
        let _guard = session.submit.lock().await;

        let author = self.coordinator.register_author(&context.doc, context.author_id);
        let updates = session.updates.subscribe();

        let start = start_length.min(self.coordinator.history_length(&context.doc));
        let history = self.coordinator.history_since(&context.doc, start);
        let authors = self.coordinator.authors(&context.doc);

        let _ = session.updates.send(ServerMessage::AuthorChange {
            author_id: context.author_id,
            author,
        });

        debug!(
            doc = %context.doc,
            author = context.author_id,
            start = history.start(),
            len = history.len(),
            "Welcomed client"
        );

        Ok(Welcome {
            messages: vec![
                ServerMessage::Registered {
                    server_id,
                    author_id: context.author_id,
                    token: context.token.clone(),
                },
                ServerMessage::InitDoc { history, authors },
            ],
            updates,
        })
    }

    /// Admit a submission, then persist and broadcast what was applied
    pub async fn on_submit_change(
        &self,
        context: &SessionContext,
        backtrack: usize,
        change: &Change,
    ) -> TransportResult<Submitted> {
        let session = self.session(&context.doc);
        let _guard = session.submit.lock().await;

        let applied = self
            .coordinator
            .apply_change(&context.doc, context.author_id, backtrack, change)?;
        let rejections = self.coordinator.rejections(&context.doc, context.author_id);

        if applied.is_empty() {
            // Selection-only updates are relayed but never stored.
            if !applied.selections().is_empty() {
                let _ = session.updates.send(ServerMessage::NewChange {
                    change: applied.clone(),
                });
            }
            return Ok(Submitted { applied, rejections });
        }

        let persisted = self.persist(&context.doc, &session).await;
        let _ = session.updates.send(ServerMessage::NewChange {
            change: applied.clone(),
        });
        persisted?;

        Ok(Submitted { applied, rejections })
    }

    /// Write every committed transaction storage does not have yet
    async fn persist(&self, doc: &DocumentName, session: &DocumentSession) -> TransportResult<()> {
        let from = session.persisted.load(Ordering::Acquire);
        let pending = self.coordinator.history_since(doc, from);
        if pending.is_empty() {
            return Ok(());
        }

        match self.storage.append_change(doc, &pending).await {
            Ok(length) => {
                session.persisted.store(length, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                error!(doc = %doc, from, pending = pending.len(), error = %e, "Failed to persist history");
                Err(e.into())
            }
        }
    }

    pub fn on_change_author(
        &self,
        context: &SessionContext,
        patch: &AuthorPatch,
    ) -> TransportResult<AuthorData> {
        let author = self
            .coordinator
            .update_author(&context.doc, context.author_id, patch)?;
        self.publish(
            &context.doc,
            ServerMessage::AuthorChange {
                author_id: context.author_id,
                author: author.clone(),
            },
        );
        Ok(author)
    }

    /// Mark the author inactive and drop its rebase continuation
    pub fn on_disconnect(&self, context: &SessionContext) {
        if self.coordinator.deactivate_author(&context.doc, context.author_id) {
            info!(doc = %context.doc, author = context.author_id, "Author disconnected");
            self.publish(
                &context.doc,
                ServerMessage::AuthorDisconnect {
                    author_id: context.author_id,
                },
            );
        }
    }

    /// Re-emit a client log record
    pub fn on_log_event(&self, context: &SessionContext, event: &str, data: &serde_json::Value) {
        debug!(
            doc = %context.doc,
            author = context.author_id,
            event,
            data = %data,
            "Client event"
        );
    }

    fn publish(&self, doc: &DocumentName, message: ServerMessage) {
        let _ = self.session(doc).updates.send(message);
    }

    /// Number of documents with session state
    pub fn document_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;
    use tandem_core::{Selection, Step, Transaction};
    use tandem_storage::{MemoryStorage, StorageError, StorageStats, StoredHistory};

    /// Memory storage that counts loads and can fail appends
    #[derive(Default)]
    struct FlakyStorage {
        inner: MemoryStorage,
        loads: AtomicUsize,
        fail_appends: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl Storage for FlakyStorage {
        async fn load(&self, doc: &DocumentName) -> Result<StoredHistory, StorageError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.inner.load(doc).await
        }

        async fn append(
            &self,
            doc: &DocumentName,
            expected_offset: usize,
            transactions: &[Transaction],
            stores: &[serde_json::Value],
        ) -> Result<usize, StorageError> {
            if self.fail_appends.load(Ordering::SeqCst) {
                return Err(StorageError::Database("disk full".into()));
            }
            self.inner.append(doc, expected_offset, transactions, stores).await
        }

        async fn server_id(&self) -> Result<String, StorageError> {
            Ok("flaky".into())
        }

        async fn list(&self, pattern: Option<&str>) -> Result<Vec<DocumentName>, StorageError> {
            self.inner.list(pattern).await
        }

        async fn stats(&self) -> Result<StorageStats, StorageError> {
            self.inner.stats().await
        }
    }

    fn doc() -> DocumentName {
        DocumentName::new("notes").unwrap()
    }

    fn insert(start: usize, author: AuthorId, pos: usize, text: &str) -> Change {
        Change::new(start, vec![Transaction::new(author, vec![Step::insert(pos, text)])])
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_access_loads_once() {
        let storage = Arc::new(FlakyStorage::default());
        let orchestrator = Arc::new(SessionOrchestrator::new(storage.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let orchestrator = orchestrator.clone();
            handles.push(tokio::spawn(async move { orchestrator.ensure_loaded(&doc()).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(storage.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_welcome_replays_stored_history() {
        let stored = StoredHistory {
            start: 0,
            transactions: vec![
                Transaction::new(1, vec![Step::insert(0, "ab")]),
                Transaction::new(1, vec![Step::insert(2, "c")]),
            ],
            stores: vec![],
        };
        let storage = Arc::new(MemoryStorage::new().with_document(doc(), stored));
        let orchestrator = SessionOrchestrator::new(storage);

        let context = orchestrator.authenticate(&doc(), None, None).await.unwrap();
        assert_eq!(context.author_id, 1);
        let welcome = orchestrator.welcome_client(&context, 1).await.unwrap();

        match &welcome.messages[..] {
            [ServerMessage::Registered { author_id, token, .. }, ServerMessage::InitDoc { history, authors }] => {
                assert_eq!(*author_id, 1);
                assert_eq!(token, &context.token);
                assert_eq!(history.start(), 1);
                assert_eq!(history.len(), 1);
                assert_eq!(authors[&1].name, "Author 1");
            }
            other => panic!("unexpected welcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_submit_persists_and_broadcasts() {
        let storage = Arc::new(MemoryStorage::new());
        let orchestrator = SessionOrchestrator::new(storage.clone());

        let ctx = orchestrator.authenticate(&doc(), None, None).await.unwrap();
        let mut welcome = orchestrator.welcome_client(&ctx, 0).await.unwrap();
        assert!(matches!(
            welcome.updates.recv().await.unwrap(),
            ServerMessage::AuthorChange { author_id: 1, .. }
        ));

        let submitted = orchestrator
            .on_submit_change(&ctx, 0, &insert(0, ctx.author_id, 0, "hi"))
            .await
            .unwrap();
        assert_eq!(submitted.applied.len(), 1);
        assert_eq!(submitted.rejections, 0);

        match welcome.updates.recv().await.unwrap() {
            ServerMessage::NewChange { change } => assert_eq!(change, submitted.applied),
            other => panic!("unexpected broadcast: {:?}", other),
        }
        assert_eq!(storage.load(&doc()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_persist_is_surfaced_and_retried() {
        let storage = Arc::new(FlakyStorage::default());
        let orchestrator = SessionOrchestrator::new(storage.clone());
        let ctx = orchestrator.authenticate(&doc(), None, None).await.unwrap();

        storage.fail_appends.store(true, Ordering::SeqCst);
        let err = orchestrator
            .on_submit_change(&ctx, 0, &insert(0, ctx.author_id, 0, "a"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Storage(_)));
        assert_eq!(orchestrator.coordinator().history_length(&doc()), 1);

        storage.fail_appends.store(false, Ordering::SeqCst);
        orchestrator
            .on_submit_change(&ctx, 0, &insert(1, ctx.author_id, 1, "b"))
            .await
            .unwrap();
        assert_eq!(storage.inner.load(&doc()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_inapplicable_change_is_neither_stored_nor_broadcast() {
        let storage = Arc::new(MemoryStorage::new());
        let orchestrator = SessionOrchestrator::new(storage.clone());
        let ctx = orchestrator.authenticate(&doc(), None, None).await.unwrap();
        let mut watch = orchestrator.welcome_client(&ctx, 0).await.unwrap().updates;
        orchestrator
            .on_submit_change(&ctx, 0, &insert(0, ctx.author_id, 0, "ab"))
            .await
            .unwrap();

        let bogus = Change::new(1, vec![Transaction::new(ctx.author_id, vec![Step::delete(50, "zz")])]);
        let err = orchestrator.on_submit_change(&ctx, 0, &bogus).await.unwrap_err();
        assert!(err.is_protocol_violation());
        assert_eq!(orchestrator.coordinator().history_length(&doc()), 1);
        assert_eq!(storage.load(&doc()).await.unwrap().len(), 1);

        let mut new_changes = 0;
        while let Ok(message) = watch.try_recv() {
            if matches!(message, ServerMessage::NewChange { .. }) {
                new_changes += 1;
            }
        }
        assert_eq!(new_changes, 1);
    }

    #[tokio::test]
    async fn test_selection_only_change_is_relayed_not_stored() {
        let storage = Arc::new(MemoryStorage::new());
        let orchestrator = SessionOrchestrator::new(storage.clone());
        let writer = orchestrator.authenticate(&doc(), None, None).await.unwrap();
        let reader = orchestrator.authenticate(&doc(), None, None).await.unwrap();
        orchestrator.welcome_client(&writer, 0).await.unwrap();
        let mut watch = orchestrator.welcome_client(&reader, 0).await.unwrap().updates;

        orchestrator
            .on_submit_change(&writer, 0, &insert(0, writer.author_id, 0, "hello"))
            .await
            .unwrap();
        // The reader moves its caret without having seen "hello".
        let caret = Change::empty(0).with_selection(reader.author_id, Selection::caret(0));
        let submitted = orchestrator.on_submit_change(&reader, 0, &caret).await.unwrap();
        assert!(submitted.applied.is_empty());
        assert_eq!(submitted.applied.start(), 1);

        let mut relayed = None;
        while let Ok(message) = watch.try_recv() {
            if let ServerMessage::NewChange { change } = message {
                relayed = Some(change);
            }
        }
        let relayed = relayed.unwrap();
        assert!(relayed.is_empty());
        assert_eq!(relayed.selections()[&reader.author_id], Selection::caret(5));
        assert_eq!(orchestrator.coordinator().history_length(&doc()), 1);
        assert_eq!(storage.load(&doc()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_backtrack_mismatch_is_a_protocol_violation() {
        let orchestrator = SessionOrchestrator::new(Arc::new(MemoryStorage::new()));
        let ctx = orchestrator.authenticate(&doc(), None, None).await.unwrap();

        let err = orchestrator
            .on_submit_change(&ctx, 2, &insert(0, ctx.author_id, 0, "a"))
            .await
            .unwrap_err();
        assert!(err.is_protocol_violation());
        assert_eq!(orchestrator.coordinator().history_length(&doc()), 0);
    }

    #[tokio::test]
    async fn test_disconnect_announces_and_allows_resume() {
        let orchestrator = SessionOrchestrator::new(Arc::new(MemoryStorage::new()));
        let first = orchestrator.authenticate(&doc(), None, None).await.unwrap();
        let observer = orchestrator.authenticate(&doc(), None, None).await.unwrap();
        orchestrator.welcome_client(&first, 0).await.unwrap();
        let mut watch = orchestrator.welcome_client(&observer, 0).await.unwrap().updates;

        orchestrator.on_disconnect(&first);
        loop {
            match watch.recv().await.unwrap() {
                ServerMessage::AuthorDisconnect { author_id } => {
                    assert_eq!(author_id, first.author_id);
                    break;
                }
                _ => continue,
            }
        }
        assert!(!orchestrator.coordinator().authors(&doc()).contains_key(&first.author_id));

        let again = orchestrator
            .authenticate(&doc(), Some(first.author_id), Some(&first.token))
            .await
            .unwrap();
        assert!(again.resumed);
        assert_eq!(again.author_id, first.author_id);
    }

    #[tokio::test]
    async fn test_change_author_broadcasts_patch() {
        let orchestrator = SessionOrchestrator::new(Arc::new(MemoryStorage::new()));
        let ctx = orchestrator.authenticate(&doc(), None, None).await.unwrap();
        let mut updates = orchestrator.welcome_client(&ctx, 0).await.unwrap().updates;
        updates.recv().await.unwrap();

        let patch = AuthorPatch {
            name: Some("Ada".into()),
            color: None,
        };
        let author = orchestrator.on_change_author(&ctx, &patch).unwrap();
        assert_eq!(author.name, "Ada");
        assert!(matches!(
            updates.recv().await.unwrap(),
            ServerMessage::AuthorChange { author, .. } if author.name == "Ada"
        ));
    }
}
