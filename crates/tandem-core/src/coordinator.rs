//! Rebase Coordinator - owns every document's state and admits changes

use crate::change::{AuthorId, Change};
use crate::document::DocumentName;
use crate::error::{Error, Result};
use crate::rebase::rebase_uncommitted_change;
use crate::state::{AuthorData, AuthorPatch, AuthorRecord, DocumentState};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Credentials handed to an authenticated connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub author_id: AuthorId,
    pub token: String,
    /// Whether an existing identity was resumed
    pub resumed: bool,
}

/// Server-side registry of documents. Each document is mutated under its own
/// lock; different documents never contend.
pub struct RebaseCoordinator {
    documents: DashMap<DocumentName, Arc<Mutex<DocumentState>>>,
}

impl RebaseCoordinator {
    /// Create an empty coordinator
    pub fn new() -> Self {
        Self {
            documents: DashMap::new(),
        }
    }

    /// State of `doc`, created empty on first access
    pub fn document(&self, doc: &DocumentName) -> Arc<Mutex<DocumentState>> {
        self.documents
            .entry(doc.clone())
            .or_insert_with(|| Arc::new(Mutex::new(DocumentState::new())))
            .value()
            .clone()
    }

    pub fn contains(&self, doc: &DocumentName) -> bool {
        self.documents.contains_key(doc)
    }

    /// Seed a document with history loaded from storage. Ignored if the
    /// document already has committed history.
    pub fn load_history(&self, doc: &DocumentName, history: Change) {
        let state = self.document(doc);
        let mut state = state.lock();
        if state.history.is_empty() && state.history.start() == 0 {
            debug!(doc = %doc, start = history.start(), len = history.len(), "Loaded history");
            if let Err(e) = state.replace_history(history.clone()) {
                warn!(doc = %doc, error = %e, "Stored history does not replay, submissions go unchecked");
                state.history = history;
                state.text = None;
            }
        } else {
            warn!(doc = %doc, "Ignoring history load for a document already in use");
        }
    }

    /// Admit `change` from `author_id`, rebasing it over everything the
    /// author has not yet seen. Returns the change appended to history,
    /// which is empty when nothing was admitted.
    pub fn apply_change(
        &self,
        doc: &DocumentName,
        author_id: AuthorId,
        backtrack: usize,
        change: &Change,
    ) -> Result<Change> {
        let state = self.document(doc);
        let mut state = state.lock();
        let history_end = state.history.end();
        let author = state.author_mut(author_id);

        let rejections = author.rejections;

        if rejections > backtrack {
            // The sender has not rolled back what we rejected yet.
            author.rejections = (rejections + change.len()).saturating_sub(backtrack);
            info!(
                doc = %doc,
                author = author_id,
                backtrack,
                incoming_start = change.start(),
                incoming_len = change.len(),
                rejections = author.rejections,
                "Stale sender, nothing admitted"
            );
            return Ok(Change::empty(history_end));
        }

        if rejections < backtrack {
            return Err(Error::BacktrackMismatch {
                author_id,
                backtrack,
                rejections,
            });
        }

        if change.start() > history_end {
            return Err(Error::AheadOfHistory {
                start: change.start(),
                end: history_end,
            });
        }

        let mut base = author
            .continue_base
            .clone()
            .unwrap_or_else(|| change.truncate(0));
        if change.start() > base.start() {
            base = base.most_recent(change.start());
        } else if change.start() < base.start() {
            return Err(Error::StaleBase {
                author_id,
                start: change.start(),
                base_start: base.start(),
            });
        }
        base.append(&state.history.most_recent(base.end()))?;

        let result = rebase_uncommitted_change(&base, change)?;
        let applied = result.rebased;
        if !applied.is_empty() {
            if let Err(e) = state.commit(&applied) {
                warn!(doc = %doc, author = author_id, error = %e, "Rebased change does not apply to committed text");
                return Err(e);
            }
        }

        let author = state.author_mut(author_id);
        author.rejections = result.rejected.as_ref().map_or(0, Change::len);
        author.continue_base = Some(result.transposed_history);
        let rejections = author.rejections;
        let history_len = state.history.end();

        info!(
            doc = %doc,
            author = author_id,
            backtrack,
            incoming_start = change.start(),
            incoming_len = change.len(),
            applied_start = applied.start(),
            applied_len = applied.len(),
            rejections,
            history_len,
            "Applied change"
        );
        debug!(
            doc = %doc,
            author = author_id,
            incoming = %audit_json(change),
            applied = %audit_json(&applied),
            "Change audit"
        );

        Ok(applied)
    }

    /// Committed history from `offset` onward
    pub fn history_since(&self, doc: &DocumentName, offset: usize) -> Change {
        self.document(doc).lock().history.most_recent(offset)
    }

    pub fn history_length(&self, doc: &DocumentName) -> usize {
        self.document(doc).lock().history_length()
    }

    /// Resume the identity matching `author_id`/`token`, or mint a new one
    pub fn authenticate(
        &self,
        doc: &DocumentName,
        author_id: Option<AuthorId>,
        token: Option<&str>,
    ) -> Credentials {
        let state = self.document(doc);
        let mut state = state.lock();

        if let (Some(id), Some(token)) = (author_id, token) {
            if state.authors.get(&id).is_some_and(|r| r.token == token) {
                return Credentials {
                    author_id: id,
                    token: token.to_string(),
                    resumed: true,
                };
            }
            debug!(doc = %doc, author = id, "Credentials did not match, minting a new author");
        }

        let id = state.mint_author_id();
        let token = Uuid::new_v4().simple().to_string();
        state.authors.insert(id, AuthorRecord::new(id, token.clone()));

        Credentials {
            author_id: id,
            token,
            resumed: false,
        }
    }

    /// Mark an author active and return its public metadata
    pub fn register_author(&self, doc: &DocumentName, author_id: AuthorId) -> AuthorData {
        let state = self.document(doc);
        let mut state = state.lock();
        let author = state.author_mut(author_id);
        author.active = true;
        author.data()
    }

    /// Apply a metadata patch field by field
    pub fn update_author(
        &self,
        doc: &DocumentName,
        author_id: AuthorId,
        patch: &AuthorPatch,
    ) -> Result<AuthorData> {
        let state = self.document(doc);
        let mut state = state.lock();
        let author = state
            .authors
            .get_mut(&author_id)
            .ok_or(Error::UnknownAuthor(author_id))?;
        author.apply_patch(patch);
        Ok(author.data())
    }

    /// Mark an author inactive and drop its in-flight rebase state.
    /// Returns false if the author was unknown.
    pub fn deactivate_author(&self, doc: &DocumentName, author_id: AuthorId) -> bool {
        let state = self.document(doc);
        let mut state = state.lock();
        match state.authors.get_mut(&author_id) {
            Some(author) => {
                author.active = false;
                author.reset_continuation();
                true
            }
            None => false,
        }
    }

    /// Trailing transactions of the author's last submission still awaiting rollback
    pub fn rejections(&self, doc: &DocumentName, author_id: AuthorId) -> usize {
        self.document(doc)
            .lock()
            .authors
            .get(&author_id)
            .map_or(0, |author| author.rejections)
    }

    /// Public metadata of every active author
    pub fn authors(&self, doc: &DocumentName) -> BTreeMap<AuthorId, AuthorData> {
        self.document(doc).lock().active_authors()
    }

    /// Drop a document's in-memory state
    pub fn clear(&self, doc: &DocumentName) -> bool {
        self.documents.remove(doc).is_some()
    }

    /// Names of all documents held in memory
    pub fn list(&self) -> Vec<DocumentName> {
        self.documents.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Get statistics
    pub fn stats(&self) -> CoordinatorStats {
        let mut stats = CoordinatorStats {
            document_count: self.documents.len(),
            ..Default::default()
        };
        for entry in self.documents.iter() {
            let state = entry.value().lock();
            stats.transaction_count += state.history.len();
            stats.active_authors += state.authors.values().filter(|a| a.active).count();
        }
        stats
    }
}

impl Default for RebaseCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Coordinator statistics
#[derive(Debug, Clone, Default)]
pub struct CoordinatorStats {
    pub document_count: usize,
    pub transaction_count: usize,
    pub active_authors: usize,
}

fn audit_json(change: &Change) -> String {
    serde_json::to_string(change).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{Step, TextDocument, Transaction};

    fn doc() -> DocumentName {
        DocumentName::new("notes").unwrap()
    }

    fn edit(start: usize, author: AuthorId, steps: Vec<Step>) -> Change {
        Change::new(start, vec![Transaction::new(author, steps)])
    }

    #[test]
    fn test_first_change_is_admitted_unchanged() {
        let coordinator = RebaseCoordinator::new();
        let c1 = edit(0, 1, vec![Step::insert(0, "a")]);

        let applied = coordinator.apply_change(&doc(), 1, 0, &c1).unwrap();
        assert_eq!(applied, c1);
        assert_eq!(coordinator.history_length(&doc()), 1);
    }

    #[test]
    fn test_concurrent_change_is_rebased_after_history() {
        let coordinator = RebaseCoordinator::new();
        let c1 = edit(0, 1, vec![Step::insert(0, "a")]);
        let c2 = edit(0, 2, vec![Step::insert(0, "b")]);

        coordinator.apply_change(&doc(), 1, 0, &c1).unwrap();
        let applied = coordinator.apply_change(&doc(), 2, 0, &c2).unwrap();

        assert_eq!(applied.start(), 1);
        assert_eq!(applied.transactions()[0].steps, vec![Step::insert(1, "b")]);

        let history = coordinator.history_since(&doc(), 0);
        assert_eq!(history.len(), 2);
        let mut text = TextDocument::new();
        history.apply_to(&mut text).unwrap();
        assert_eq!(text.text(), "ab");
    }

    #[test]
    fn test_continuation_base_tracks_unseen_history() {
        let coordinator = RebaseCoordinator::new();
        coordinator
            .apply_change(&doc(), 1, 0, &edit(0, 1, vec![Step::insert(0, "xy")]))
            .unwrap();
        coordinator
            .apply_change(&doc(), 2, 0, &edit(0, 2, vec![Step::insert(0, "1")]))
            .unwrap();

        // Author 2 keeps typing on top of its own unrebased "1".
        let applied = coordinator
            .apply_change(&doc(), 2, 0, &edit(1, 2, vec![Step::insert(1, "2")]))
            .unwrap();
        assert_eq!(applied.start(), 2);

        let mut text = TextDocument::new();
        coordinator.history_since(&doc(), 0).apply_to(&mut text).unwrap();
        assert_eq!(text.text(), "xy12");
    }

    #[test]
    fn test_rejection_accounting() {
        let coordinator = RebaseCoordinator::new();
        coordinator
            .apply_change(&doc(), 1, 0, &edit(0, 1, vec![Step::insert(0, "abcdef")]))
            .unwrap();
        coordinator
            .apply_change(&doc(), 1, 0, &edit(1, 1, vec![Step::delete(1, "bcde")]))
            .unwrap();

        // Author 2 only saw "abcdef" and inserts inside the deleted range.
        let stale = Change::new(
            1,
            vec![
                Transaction::new(2, vec![Step::insert(0, ">")]),
                Transaction::new(2, vec![Step::insert(4, "!")]),
            ],
        );
        let applied = coordinator.apply_change(&doc(), 2, 0, &stale).unwrap();
        assert_eq!(applied.len(), 1);
        {
            let state = coordinator.document(&doc());
            let state = state.lock();
            assert_eq!(state.authors[&2].rejections, 1);
        }

        // Sending more before acknowledging the rejection admits nothing.
        let more = edit(3, 2, vec![Step::insert(0, "#")]);
        let applied = coordinator.apply_change(&doc(), 2, 0, &more).unwrap();
        assert!(applied.is_empty());
        assert_eq!(applied.start(), 3);
        {
            let state = coordinator.document(&doc());
            let state = state.lock();
            assert_eq!(state.authors[&2].rejections, 2);
        }
        assert_eq!(coordinator.history_length(&doc()), 3);

        // Over-reporting is a protocol violation.
        let err = coordinator.apply_change(&doc(), 2, 3, &more).unwrap_err();
        assert!(err.is_protocol_violation());
    }

    fn author_state(coordinator: &RebaseCoordinator, author_id: AuthorId) -> (usize, Option<Change>) {
        let state = coordinator.document(&doc());
        let state = state.lock();
        let record = &state.authors[&author_id];
        (record.rejections, record.continue_base.clone())
    }

    #[test]
    fn test_inapplicable_change_is_refused_without_side_effects() {
        let coordinator = RebaseCoordinator::new();
        coordinator
            .apply_change(&doc(), 1, 0, &edit(0, 1, vec![Step::insert(0, "a")]))
            .unwrap();
        coordinator
            .apply_change(&doc(), 1, 0, &edit(1, 1, vec![Step::insert(1, "b")]))
            .unwrap();
        coordinator.register_author(&doc(), 3);
        let before = author_state(&coordinator, 3);

        for bogus in [
            edit(2, 3, vec![Step::delete(50, "zz")]),
            edit(2, 3, vec![Step::delete(0, "xy")]),
            edit(2, 3, vec![Step::insert(usize::MAX, "!")]),
        ] {
            let err = coordinator.apply_change(&doc(), 3, 0, &bogus).unwrap_err();
            assert!(err.is_protocol_violation(), "{err}");
            assert_eq!(author_state(&coordinator, 3), before);
        }

        let history = coordinator.history_since(&doc(), 0);
        assert_eq!(history.len(), 2);
        let mut text = TextDocument::new();
        history.apply_to(&mut text).unwrap();
        assert_eq!(text.text(), "ab");
    }

    #[test]
    fn test_overflowing_position_under_rebase_is_refused() {
        let coordinator = RebaseCoordinator::new();
        coordinator
            .apply_change(&doc(), 1, 0, &edit(0, 1, vec![Step::insert(0, "ab")]))
            .unwrap();

        // Rebased across "ab", the position would have to grow past usize::MAX.
        let bogus: Change = serde_json::from_str(
            r#"{"start":0,"transactions":[{"author":2,"steps":[{"op":"insert","pos":18446744073709551615,"text":"x"}]}]}"#,
        )
        .unwrap();
        let err = coordinator.apply_change(&doc(), 2, 0, &bogus).unwrap_err();
        assert_eq!(err, Error::PositionOverflow(usize::MAX));
        assert_eq!(coordinator.history_length(&doc()), 1);
    }

    #[test]
    fn test_change_past_history_end_leaves_record_untouched() {
        let coordinator = RebaseCoordinator::new();
        coordinator
            .apply_change(&doc(), 1, 0, &edit(0, 1, vec![Step::insert(0, "hello")]))
            .unwrap();
        let before = author_state(&coordinator, 1);

        let err = coordinator
            .apply_change(&doc(), 1, 0, &edit(100, 1, vec![Step::insert(0, "x")]))
            .unwrap_err();
        assert_eq!(err, Error::AheadOfHistory { start: 100, end: 1 });
        assert!(err.is_protocol_violation());

        let after = author_state(&coordinator, 1);
        assert_eq!(after, before);
        let base = after.1.unwrap();
        assert!(base.end() <= coordinator.history_length(&doc()));
    }

    #[test]
    fn test_load_history_rebuilds_committed_text() {
        let coordinator = RebaseCoordinator::new();
        coordinator.load_history(&doc(), edit(0, 1, vec![Step::insert(0, "ab")]));

        let err = coordinator
            .apply_change(&doc(), 2, 0, &edit(1, 2, vec![Step::delete(1, "bc")]))
            .unwrap_err();
        assert!(matches!(err, Error::OutOfRange { .. }));

        let applied = coordinator
            .apply_change(&doc(), 2, 0, &edit(1, 2, vec![Step::delete(1, "b")]))
            .unwrap();
        assert_eq!(applied.len(), 1);
    }

    #[test]
    fn test_authenticate_resumes_or_mints() {
        let coordinator = RebaseCoordinator::new();
        let first = coordinator.authenticate(&doc(), None, None);
        assert_eq!(first.author_id, 1);
        assert!(!first.resumed);

        let again = coordinator.authenticate(&doc(), Some(1), Some(&first.token));
        assert!(again.resumed);
        assert_eq!(again.author_id, 1);

        let forged = coordinator.authenticate(&doc(), Some(1), Some("nope"));
        assert!(!forged.resumed);
        assert_eq!(forged.author_id, 2);
    }

    #[test]
    fn test_deactivate_clears_continuation() {
        let coordinator = RebaseCoordinator::new();
        let creds = coordinator.authenticate(&doc(), None, None);
        coordinator.register_author(&doc(), creds.author_id);
        coordinator
            .apply_change(&doc(), creds.author_id, 0, &edit(0, 1, vec![Step::insert(0, "a")]))
            .unwrap();
        assert_eq!(coordinator.authors(&doc()).len(), 1);

        assert!(coordinator.deactivate_author(&doc(), creds.author_id));
        assert!(coordinator.authors(&doc()).is_empty());

        let state = coordinator.document(&doc());
        let state = state.lock();
        let record = &state.authors[&creds.author_id];
        assert!(record.continue_base.is_none());
        assert_eq!(record.rejections, 0);
        assert_eq!(state.history.len(), 1);
    }

    #[test]
    fn test_update_author_unknown() {
        let coordinator = RebaseCoordinator::new();
        let patch = AuthorPatch {
            name: Some("Ada".into()),
            color: None,
        };
        assert!(matches!(
            coordinator.update_author(&doc(), 9, &patch),
            Err(Error::UnknownAuthor(9))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submissions_keep_history_consistent() {
        let coordinator = Arc::new(RebaseCoordinator::new());
        let mut handles = Vec::new();

        for author in 1..=8u32 {
            let coordinator = coordinator.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                let change = edit(0, author, vec![Step::insert(0, author.to_string())]);
                coordinator.apply_change(&doc(), author, 0, &change).unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().len(), 1);
        }

        let history = coordinator.history_since(&doc(), 0);
        assert_eq!(history.len(), 8);
        let mut text = TextDocument::new();
        history.apply_to(&mut text).unwrap();
        assert_eq!(text.len(), 8);
    }
}
