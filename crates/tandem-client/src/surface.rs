//! Binds a [`ClientRebaseEngine`] to a local text surface
//!
//! The synchronizer owns the live document, the local history and the caches
//! an editor needs for rendering collaborators. It is transport agnostic:
//! server messages are fed in through [`SurfaceSynchronizer::handle`] and
//! outgoing messages are collected from [`SurfaceSynchronizer::submit`].

use crate::error::{ClientError, ClientResult};
use std::collections::BTreeMap;
use std::collections::VecDeque;
use tandem_core::{
    Accepted, AuthorData, AuthorId, Change, ClientRebaseEngine, EngineHost, Selection, Step, TextDocument,
    Transaction,
};
use tandem_protocol::{ClientMessage, ServerMessage};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Notifications for the editor binding
#[derive(Debug, Clone, PartialEq)]
pub enum SurfaceEvent {
    /// A collaborator's selection moved, appeared or went away
    SelectionChanged {
        author_id: AuthorId,
        selection: Option<Selection>,
    },
    /// The set of active authors or their display data changed
    AuthorsChanged(BTreeMap<AuthorId, AuthorData>),
    /// Remote work changed the document text
    DocumentChanged,
}

/// Document side of the engine: everything [`EngineHost`] touches
struct Surface {
    author_id: AuthorId,
    doc: TextDocument,
    history: Change,
    selection: Option<Selection>,
    selections: BTreeMap<AuthorId, Selection>,
    outbox: Vec<ClientMessage>,
    events: mpsc::UnboundedSender<SurfaceEvent>,
}

impl Surface {
    fn emit(&self, event: SurfaceEvent) {
        // The editor may have gone away; synchronization carries on without it
        let _ = self.events.send(event);
    }

    /// Move every cached selection through steps applied to the document
    fn map_selections(&mut self, steps: &[Step], explicit: &BTreeMap<AuthorId, Selection>) {
        self.selection = match explicit.get(&self.author_id) {
            Some(own) => Some(*own),
            None => self.selection.map(|own| own.map_through(steps)),
        };

        let mut moved = Vec::new();
        for (author, selection) in self.selections.iter_mut() {
            let next = match explicit.get(author) {
                Some(explicit) => *explicit,
                None => selection.map_through(steps),
            };
            if next != *selection {
                *selection = next;
                moved.push((*author, next));
            }
        }
        for (author, selection) in explicit {
            if *author != self.author_id && !self.selections.contains_key(author) {
                self.selections.insert(*author, *selection);
                moved.push((*author, *selection));
            }
        }

        for (author_id, selection) in moved {
            self.emit(SurfaceEvent::SelectionChanged {
                author_id,
                selection: Some(selection),
            });
        }
    }

    /// Take over the selections of a change without transactions. They are
    /// in committed coordinates and still have to cross unconfirmed local work.
    fn adopt_selections(&mut self, change: &Change, commit_length: usize) {
        let pending: Vec<Step> = self.history.most_recent(commit_length).steps().cloned().collect();
        let explicit: BTreeMap<AuthorId, Selection> = change
            .selections()
            .iter()
            .filter(|(author, _)| **author != self.author_id)
            .map(|(author, selection)| (*author, selection.map_through(&pending)))
            .collect();
        self.map_selections(&[], &explicit);
    }
}

impl EngineHost for Surface {
    fn change_since(&mut self, offset: usize, _mark_as_sent: bool) -> Change {
        let change = self.history.most_recent(offset).with_selections(BTreeMap::new());
        match self.selection {
            Some(selection) if !change.is_empty() => change.with_selection(self.author_id, selection),
            _ => change,
        }
    }

    fn send_change(&mut self, backtrack: usize, change: Change) {
        self.outbox.push(ClientMessage::SubmitChange { backtrack, change });
    }

    fn apply_change(&mut self, change: &Change) -> tandem_core::Result<()> {
        if self.history.end() != change.start() {
            return Err(tandem_core::Error::Discontiguous {
                left_end: self.history.end(),
                right_start: change.start(),
            });
        }
        change.apply_to(&mut self.doc)?;
        self.history.append(change)?;
        let steps: Vec<Step> = change.steps().cloned().collect();
        self.map_selections(&steps, change.selections());
        Ok(())
    }

    fn unapply_change(&mut self, change: &Change) -> tandem_core::Result<()> {
        let history = self.history.strip_suffix(change)?;
        change.unapply_from(&mut self.doc)?;
        self.history = history;
        let steps: Vec<Step> = change.reversed().steps().cloned().collect();
        self.map_selections(&steps, &BTreeMap::new());
        Ok(())
    }

    fn add_to_history(&mut self, change: &Change) -> tandem_core::Result<()> {
        self.history.append(change)
    }

    fn remove_from_history(&mut self, change: &Change) -> tandem_core::Result<()> {
        self.history = self.history.strip_suffix(change)?;
        Ok(())
    }
}

/// Keeps a local document in step with the server
pub struct SurfaceSynchronizer {
    engine: ClientRebaseEngine,
    surface: Surface,
    server_id: Option<String>,
    token: Option<String>,
    authors: BTreeMap<AuthorId, AuthorData>,
    initialized: bool,
    applying: bool,
    paused: bool,
    queued: VecDeque<Change>,
    /// The local selection moved since it was last sent
    selection_pending: bool,
}

impl SurfaceSynchronizer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SurfaceEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let synchronizer = Self {
            engine: ClientRebaseEngine::default(),
            surface: Surface {
                author_id: 0,
                doc: TextDocument::new(),
                history: Change::empty(0),
                selection: None,
                selections: BTreeMap::new(),
                outbox: Vec::new(),
                events,
            },
            server_id: None,
            token: None,
            authors: BTreeMap::new(),
            initialized: false,
            applying: false,
            paused: false,
            queued: VecDeque::new(),
            selection_pending: false,
        };
        (synchronizer, receiver)
    }

    pub fn text(&self) -> &str {
        self.surface.doc.text()
    }

    pub fn history(&self) -> &Change {
        &self.surface.history
    }

    pub fn engine(&self) -> &ClientRebaseEngine {
        &self.engine
    }

    pub fn author_id(&self) -> Option<AuthorId> {
        self.server_id.as_ref().map(|_| self.surface.author_id)
    }

    /// Credentials to present when reconnecting
    pub fn credentials(&self) -> Option<(AuthorId, &str)> {
        self.token.as_deref().map(|token| (self.surface.author_id, token))
    }

    pub fn server_id(&self) -> Option<&str> {
        self.server_id.as_deref()
    }

    pub fn selection(&self) -> Option<Selection> {
        self.surface.selection
    }

    /// Last known selections of other authors
    pub fn selections(&self) -> &BTreeMap<AuthorId, Selection> {
        &self.surface.selections
    }

    pub fn authors(&self) -> &BTreeMap<AuthorId, AuthorData> {
        &self.authors
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_applying(&self) -> bool {
        self.applying
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Local work or a selection move not yet handed to the transport
    pub fn has_unsent(&self) -> bool {
        self.initialized && (self.surface.history.end() > self.engine.sent_length() || self.selection_pending)
    }

    /// Local work the server has not confirmed yet
    pub fn has_uncommitted(&self) -> bool {
        self.surface.history.end() > self.engine.commit_length()
    }

    /// Route one server message. Server errors come back as
    /// [`ClientError::Server`] so the caller can decide whether to go on.
    pub fn handle(&mut self, message: ServerMessage) -> ClientResult<()> {
        match message {
            ServerMessage::Registered {
                server_id,
                author_id,
                token,
            } => self.on_registered(server_id, author_id, token),
            ServerMessage::InitDoc { history, authors } => self.on_init_doc(history, authors),
            ServerMessage::NewChange { change } => self.on_new_change(change),
            ServerMessage::AuthorChange { author_id, author } => {
                self.on_author_change(author_id, author);
                Ok(())
            }
            ServerMessage::AuthorDisconnect { author_id } => {
                self.on_author_disconnect(author_id);
                Ok(())
            }
            ServerMessage::Error { code, message } => Err(ClientError::Server { code, message }),
        }
    }

    /// Adopt the identity assigned by the server. A different server id than
    /// the one seen before means local history is not this server's.
    pub fn on_registered(&mut self, server_id: String, author_id: AuthorId, token: String) -> ClientResult<()> {
        if let Some(known) = &self.server_id {
            if *known != server_id {
                return Err(ClientError::ServerMismatch {
                    expected: known.clone(),
                    actual: server_id,
                });
            }
        }

        debug!(author = author_id, server = %server_id, "Registered");
        self.server_id = Some(server_id);
        self.token = Some(token);
        self.surface.author_id = author_id;
        Ok(())
    }

    /// Install server history. A history starting at zero replaces local
    /// state; one starting at the local commit watermark extends the
    /// committed prefix and drops unconfirmed local work. Anything that fails
    /// to replay leaves the synchronizer as it was.
    pub fn on_init_doc(&mut self, history: Change, authors: BTreeMap<AuthorId, AuthorData>) -> ClientResult<()> {
        let (mut doc, mut local) = if history.start() == 0 {
            (TextDocument::new(), Change::empty(0))
        } else if self.initialized && history.start() == self.engine.commit_length() {
            let mut doc = self.surface.doc.clone();
            let unconfirmed = self.surface.history.most_recent(history.start());
            unconfirmed
                .unapply_from(&mut doc)
                .map_err(|e| ClientError::CorruptHistory(e.to_string()))?;
            let local = self
                .surface
                .history
                .strip_suffix(&unconfirmed)
                .map_err(|e| ClientError::CorruptHistory(e.to_string()))?;
            (doc, local)
        } else {
            return Err(ClientError::CorruptHistory(format!(
                "history starts at {} but {} transactions are committed locally",
                history.start(),
                self.engine.commit_length()
            )));
        };

        history
            .apply_to(&mut doc)
            .map_err(|e| ClientError::CorruptHistory(e.to_string()))?;
        local
            .append(&history)
            .map_err(|e| ClientError::CorruptHistory(e.to_string()))?;

        let author_id = self.surface.author_id;
        self.engine.reset(author_id, local.end());
        self.surface.doc = doc;
        self.surface.selections = local
            .selections()
            .iter()
            .filter(|(author, _)| **author != author_id && authors.contains_key(author))
            .map(|(author, selection)| (*author, *selection))
            .collect();
        self.surface.selection = local.selections().get(&author_id).copied();
        self.surface.history = local;
        self.surface.outbox.clear();
        self.queued.clear();
        self.selection_pending = false;
        self.initialized = true;

        info!(
            author = author_id,
            length = self.surface.history.end(),
            authors = authors.len(),
            "Document initialized"
        );

        self.authors = authors;
        self.surface.emit(SurfaceEvent::AuthorsChanged(self.authors.clone()));
        for (author_id, selection) in &self.surface.selections {
            self.surface.emit(SurfaceEvent::SelectionChanged {
                author_id: *author_id,
                selection: Some(*selection),
            });
        }
        self.surface.emit(SurfaceEvent::DocumentChanged);
        Ok(())
    }

    /// A confirmed change from the server; queued while paused
    pub fn on_new_change(&mut self, change: Change) -> ClientResult<()> {
        if !self.initialized {
            warn!(start = change.start(), "Change before document init, ignoring");
            return Ok(());
        }
        if self.paused {
            self.queued.push_back(change);
            return Ok(());
        }
        self.accept(&change)
    }

    fn accept(&mut self, change: &Change) -> ClientResult<()> {
        self.applying = true;
        let accepted = self.engine.accept_change(&mut self.surface, change);
        self.applying = false;

        match accepted? {
            Accepted::Rebased { rejected } => {
                if rejected > 0 {
                    warn!(author = self.surface.author_id, rejected, "Local work rejected");
                }
                self.surface.emit(SurfaceEvent::DocumentChanged);
            }
            Accepted::Ignored => {
                if !change.selections().is_empty() {
                    self.surface.adopt_selections(change, self.engine.commit_length());
                }
            }
            Accepted::Echo => {}
        }
        Ok(())
    }

    pub fn on_author_change(&mut self, author_id: AuthorId, author: AuthorData) {
        if self.authors.get(&author_id) == Some(&author) {
            return;
        }
        self.authors.insert(author_id, author);
        self.surface.emit(SurfaceEvent::AuthorsChanged(self.authors.clone()));
    }

    pub fn on_author_disconnect(&mut self, author_id: AuthorId) {
        if self.authors.remove(&author_id).is_none() {
            return;
        }
        if self.surface.selections.remove(&author_id).is_some() {
            self.surface.emit(SurfaceEvent::SelectionChanged {
                author_id,
                selection: None,
            });
        }
        self.surface.emit(SurfaceEvent::AuthorsChanged(self.authors.clone()));
    }

    /// Record a local edit. Returns whether a submission should be scheduled;
    /// edits reported while remote work is being applied are ignored.
    pub fn local_edit(&mut self, steps: Vec<Step>) -> ClientResult<bool> {
        if self.applying {
            return Ok(false);
        }
        if steps.iter().all(Step::is_noop) {
            return Ok(false);
        }
        let change = Change::new(
            self.surface.history.end(),
            vec![Transaction::new(self.surface.author_id, steps)],
        );
        self.surface.apply_change(&change)?;
        Ok(self.initialized)
    }

    /// Move the local selection. It rides along with the next edit, or goes
    /// out on its own once no local work is in flight.
    pub fn local_select(&mut self, selection: Selection) -> ClientResult<bool> {
        if self.applying || self.surface.selection == Some(selection) {
            return Ok(false);
        }
        let len = self.surface.doc.len();
        if selection.anchor > len || selection.head > len {
            return Err(tandem_core::Error::OutOfRange {
                pos: selection.anchor.max(selection.head),
                len,
            }
            .into());
        }
        self.surface.selection = Some(selection);
        self.selection_pending = true;
        Ok(self.initialized)
    }

    /// Hold incoming changes, e.g. during an editor composition
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Apply held changes in order. Returns whether local work is waiting to
    /// be submitted.
    pub fn resume(&mut self) -> ClientResult<bool> {
        self.paused = false;
        while let Some(change) = self.queued.pop_front() {
            self.accept(&change)?;
        }
        Ok(self.has_unsent())
    }

    /// Hand unsent local work to the outbox and drain it. Nothing is sent
    /// before the document was initialized.
    pub fn submit(&mut self) -> Vec<ClientMessage> {
        if !self.initialized {
            return Vec::new();
        }
        if self.engine.submit_change(&mut self.surface) > 0 {
            self.selection_pending = false;
        } else if let Some(selection) = self.surface.selection.filter(|_| self.selection_pending) {
            let selections = BTreeMap::from([(self.surface.author_id, selection)]);
            if self.engine.submit_selections(&mut self.surface, selections) {
                self.selection_pending = false;
            }
        }
        std::mem::take(&mut self.surface.outbox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joined(author_id: AuthorId, history: Change) -> (SurfaceSynchronizer, mpsc::UnboundedReceiver<SurfaceEvent>) {
        let (mut sync, events) = SurfaceSynchronizer::new();
        sync.on_registered("server-a".into(), author_id, "token".into()).unwrap();
        sync.on_init_doc(history, BTreeMap::new()).unwrap();
        (sync, events)
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<SurfaceEvent>) -> Vec<SurfaceEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    fn author(name: &str) -> AuthorData {
        AuthorData {
            name: name.into(),
            color: "#000000".into(),
        }
    }

    fn insert(author: AuthorId, start: usize, pos: usize, text: &str) -> Change {
        Change::new(start, vec![Transaction::new(author, vec![Step::insert(pos, text)])])
    }

    #[test]
    fn test_init_doc_replays_history() {
        let history = insert(1, 0, 0, "hello").concat(&insert(1, 1, 5, "!")).unwrap();
        let (sync, _) = joined(2, history);

        assert_eq!(sync.text(), "hello!");
        assert_eq!(sync.engine().commit_length(), 2);
        assert_eq!(sync.engine().sent_length(), 2);
        assert!(!sync.has_unsent());
    }

    #[test]
    fn test_corrupt_history_keeps_state() {
        let (mut sync, _) = joined(2, insert(1, 0, 0, "abc"));
        let bad = Change::new(0, vec![Transaction::new(1, vec![Step::delete(0, "zz")])]);

        let err = sync.on_init_doc(bad, BTreeMap::new()).unwrap_err();
        assert!(matches!(err, ClientError::CorruptHistory(_)));
        assert_eq!(sync.text(), "abc");
        assert_eq!(sync.history().end(), 1);
    }

    #[test]
    fn test_server_mismatch() {
        let (mut sync, _) = joined(2, Change::empty(0));
        let err = sync.on_registered("server-b".into(), 2, "token".into()).unwrap_err();
        assert!(matches!(err, ClientError::ServerMismatch { .. }));
        assert!(sync.on_registered("server-a".into(), 2, "token".into()).is_ok());
    }

    #[test]
    fn test_no_submission_before_init() {
        let (mut sync, _) = SurfaceSynchronizer::new();
        sync.on_registered("server-a".into(), 1, "token".into()).unwrap();
        assert!(!sync.local_edit(vec![Step::insert(0, "x")]).unwrap());
        assert!(sync.submit().is_empty());
    }

    #[test]
    fn test_local_edit_submits_once() {
        let (mut sync, _) = joined(1, Change::empty(0));
        assert!(sync.local_edit(vec![Step::insert(0, "hi")]).unwrap());
        assert!(sync.has_unsent());

        let sent = sync.submit();
        assert!(matches!(
            &sent[..],
            [ClientMessage::SubmitChange { backtrack: 0, change }] if change.start() == 0 && change.len() == 1
        ));
        assert!(!sync.has_unsent());
        assert!(sync.submit().is_empty());
    }

    #[test]
    fn test_selection_only_move_adds_no_history() {
        let (mut sync, _) = joined(1, insert(2, 0, 0, "hello"));
        assert!(sync.local_select(Selection::new(1, 3)).unwrap());
        assert!(sync.has_unsent());

        let sent = sync.submit();
        let [ClientMessage::SubmitChange { backtrack: 0, change }] = &sent[..] else {
            panic!("expected one submission");
        };
        assert!(change.is_empty());
        assert_eq!(change.start(), 1);
        assert_eq!(change.selections().get(&1), Some(&Selection::new(1, 3)));
        assert_eq!(sync.history().end(), 1);
        assert!(!sync.has_unsent());
        assert!(sync.submit().is_empty());
        assert!(sync.local_select(Selection::new(6, 6)).is_err());
    }

    #[test]
    fn test_selection_rides_with_edit_or_waits() {
        let (mut sync, _) = joined(1, Change::empty(0));
        sync.local_edit(vec![Step::insert(0, "abc")]).unwrap();
        sync.local_select(Selection::caret(3)).unwrap();

        let sent = sync.submit();
        let [ClientMessage::SubmitChange { change: edit, .. }] = &sent[..] else {
            panic!("expected one submission");
        };
        assert_eq!(edit.len(), 1);
        assert_eq!(edit.selections().get(&1), Some(&Selection::caret(3)));

        // A move while the edit is in flight waits for the echo.
        sync.local_select(Selection::caret(1)).unwrap();
        assert!(sync.submit().is_empty());
        assert!(sync.has_unsent());

        sync.on_new_change(edit.clone()).unwrap();
        let sent = sync.submit();
        let [ClientMessage::SubmitChange { change, .. }] = &sent[..] else {
            panic!("expected one submission");
        };
        assert!(change.is_empty());
        assert_eq!(change.start(), 1);
        assert_eq!(change.selections().get(&1), Some(&Selection::caret(1)));
    }

    #[test]
    fn test_remote_selection_crosses_unconfirmed_work() {
        let (mut sync, mut events) = joined(1, insert(2, 0, 0, "hello"));
        sync.local_edit(vec![Step::insert(0, ">> ")]).unwrap();
        drain(&mut events);

        sync.on_new_change(Change::empty(1).with_selection(2, Selection::new(0, 5)))
            .unwrap();
        assert_eq!(sync.selections().get(&2), Some(&Selection::new(3, 8)));
        assert_eq!(sync.engine().commit_length(), 1);
        assert_eq!(
            drain(&mut events),
            vec![SurfaceEvent::SelectionChanged {
                author_id: 2,
                selection: Some(Selection::new(3, 8)),
            }]
        );

        // Our own relayed selection is already known.
        sync.on_new_change(Change::empty(1).with_selection(1, Selection::caret(0)))
            .unwrap();
        assert_eq!(sync.selection(), None);
    }

    #[test]
    fn test_remote_change_maps_selections() {
        let (mut sync, mut events) = joined(1, insert(2, 0, 0, "hello"));
        sync.local_select(Selection::caret(5)).unwrap();
        sync.submit();
        sync.on_new_change(Change::empty(1).with_selection(1, Selection::caret(5)))
            .unwrap();
        drain(&mut events);

        let remote = insert(2, 1, 0, ">> ").with_selection(2, Selection::caret(3));
        sync.on_new_change(remote).unwrap();

        assert_eq!(sync.text(), ">> hello");
        assert_eq!(sync.selection(), Some(Selection::caret(8)));
        assert_eq!(sync.selections().get(&2), Some(&Selection::caret(3)));
        let events = drain(&mut events);
        assert!(events.contains(&SurfaceEvent::SelectionChanged {
            author_id: 2,
            selection: Some(Selection::caret(3)),
        }));
        assert!(events.contains(&SurfaceEvent::DocumentChanged));
    }

    #[test]
    fn test_echo_commits_without_touching_text() {
        let (mut sync, mut events) = joined(1, Change::empty(0));
        sync.local_edit(vec![Step::insert(0, "abc")]).unwrap();
        let sent = sync.submit();
        let [ClientMessage::SubmitChange { change, .. }] = &sent[..] else {
            panic!("expected one submission");
        };
        drain(&mut events);

        sync.on_new_change(change.clone()).unwrap();
        assert_eq!(sync.text(), "abc");
        assert_eq!(sync.engine().commit_length(), 1);
        assert!(!sync.has_uncommitted());
        assert!(drain(&mut events).is_empty());
    }

    #[test]
    fn test_pause_queues_remote_changes() {
        let (mut sync, _) = joined(1, Change::empty(0));
        sync.pause();
        sync.on_new_change(insert(2, 0, 0, "remote")).unwrap();
        assert_eq!(sync.text(), "");

        sync.local_edit(vec![Step::insert(0, "x")]).unwrap();
        assert!(sync.resume().unwrap());
        assert_eq!(sync.text(), "remotex");
        assert_eq!(sync.engine().commit_length(), 1);
    }

    #[test]
    fn test_paused_changes_replay_in_arrival_order() {
        let (mut sync, _) = joined(1, Change::empty(0));
        sync.pause();
        sync.on_new_change(insert(2, 0, 0, "abc")).unwrap();
        sync.on_new_change(Change::new(1, vec![Transaction::new(3, vec![Step::delete(0, "abc")])]))
            .unwrap();
        sync.local_edit(vec![Step::insert(0, "x")]).unwrap();
        assert_eq!(sync.text(), "x");

        assert!(sync.resume().unwrap());
        assert_eq!(sync.text(), "x");
        assert_eq!(sync.engine().commit_length(), 2);
        let authors: Vec<AuthorId> = sync.history().transactions().iter().map(|t| t.author).collect();
        assert_eq!(authors, vec![2, 3, 1]);
        assert_eq!(
            sync.history().transactions()[2].steps,
            vec![Step::insert(0, "x")]
        );
    }

    #[test]
    fn test_failed_revert_keeps_history_and_text_together() {
        let (mut sync, _) = joined(1, insert(2, 0, 0, "abc"));
        let wrong = insert(2, 0, 0, "zzz");

        assert!(sync.surface.unapply_change(&wrong).is_err());
        assert_eq!(sync.text(), "abc");
        assert_eq!(sync.history().end(), 1);

        let detached = insert(1, 5, 0, "!");
        assert!(sync.surface.apply_change(&detached).is_err());
        assert_eq!(sync.text(), "abc");
        assert_eq!(sync.history().end(), 1);
    }

    #[test]
    fn test_author_cache_events() {
        let (mut sync, mut events) = joined(1, Change::empty(0));
        drain(&mut events);

        sync.on_author_change(2, author("Ada"));
        sync.on_author_change(2, author("Ada"));
        assert_eq!(drain(&mut events).len(), 1);

        sync.on_author_disconnect(2);
        sync.on_author_disconnect(2);
        assert!(sync.authors().is_empty());
        assert_eq!(drain(&mut events), vec![SurfaceEvent::AuthorsChanged(BTreeMap::new())]);
    }

    #[test]
    fn test_resume_from_commit_watermark_drops_unconfirmed() {
        let (mut sync, _) = joined(1, insert(2, 0, 0, "base "));
        sync.local_edit(vec![Step::insert(5, "mine")]).unwrap();
        sync.submit();

        sync.on_init_doc(insert(2, 1, 0, ">"), BTreeMap::new()).unwrap();
        assert_eq!(sync.text(), ">base ");
        assert_eq!(sync.engine().commit_length(), 2);
        assert!(!sync.has_uncommitted());

        let stale = insert(2, 7, 0, "?");
        assert!(matches!(
            sync.on_init_doc(stale, BTreeMap::new()),
            Err(ClientError::CorruptHistory(_))
        ));
    }

    #[test]
    fn test_server_error_is_surfaced() {
        let (mut sync, _) = joined(1, Change::empty(0));
        let err = sync
            .handle(ServerMessage::error(tandem_protocol::codes::STORAGE, "disk full"))
            .unwrap_err();
        assert!(!err.is_fatal());
    }
}
