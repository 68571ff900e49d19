//! Client-side mirror of the rebase protocol
//!
//! The engine only tracks watermarks. Everything that touches a live document
//! or a transport goes through an [`EngineHost`].

use crate::change::{AuthorId, Change, Selection};
use crate::error::Result;
use crate::rebase::rebase_uncommitted_change;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Document and transport bindings the engine drives
pub trait EngineHost {
    /// Local history from `offset` onward. `mark_as_sent` is set when the
    /// result is about to be submitted.
    fn change_since(&mut self, offset: usize, mark_as_sent: bool) -> Change;

    /// Hand a change to the transport. Failures surface as disconnects.
    fn send_change(&mut self, backtrack: usize, change: Change);

    /// Apply to the live document and append to local history
    fn apply_change(&mut self, change: &Change) -> Result<()>;

    /// Revert on the live document and pop from local history
    fn unapply_change(&mut self, change: &Change) -> Result<()>;

    fn add_to_history(&mut self, change: &Change) -> Result<()>;

    fn remove_from_history(&mut self, change: &Change) -> Result<()>;
}

/// What [`ClientRebaseEngine::accept_change`] did with a confirmed change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepted {
    /// Degenerate change without transactions
    Ignored,
    /// Confirmation of work this client already applied
    Echo,
    /// Foreign change applied and local work rebased over it
    Rebased { rejected: usize },
}

/// Watermarks of one client session: `commit_length <= sent_length <= local history length`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientRebaseEngine {
    author_id: AuthorId,
    commit_length: usize,
    sent_length: usize,
    backtrack: usize,
}

impl ClientRebaseEngine {
    pub fn new(author_id: AuthorId) -> Self {
        Self {
            author_id,
            ..Default::default()
        }
    }

    /// Start over on top of `history_length` confirmed transactions
    pub fn reset(&mut self, author_id: AuthorId, history_length: usize) {
        self.author_id = author_id;
        self.commit_length = history_length;
        self.sent_length = history_length;
        self.backtrack = 0;
    }

    pub fn author_id(&self) -> AuthorId {
        self.author_id
    }

    pub fn commit_length(&self) -> usize {
        self.commit_length
    }

    pub fn sent_length(&self) -> usize {
        self.sent_length
    }

    pub fn backtrack(&self) -> usize {
        self.backtrack
    }

    /// Send everything not yet sent. Returns the number of transactions sent.
    pub fn submit_change<H: EngineHost>(&mut self, host: &mut H) -> usize {
        let change = host.change_since(self.sent_length, true);
        if change.is_empty() {
            return 0;
        }

        let len = change.len();
        debug!(
            author = self.author_id,
            start = change.start(),
            len,
            backtrack = self.backtrack,
            "Submitting change"
        );
        host.send_change(self.backtrack, change);
        self.backtrack = 0;
        self.sent_length += len;
        len
    }

    /// Send a change that carries only `selections`. Refused while any local
    /// work is unsent or unconfirmed, since the selections must be expressed
    /// against committed history.
    pub fn submit_selections<H: EngineHost>(
        &mut self,
        host: &mut H,
        selections: BTreeMap<AuthorId, Selection>,
    ) -> bool {
        if self.sent_length != self.commit_length || !host.change_since(self.sent_length, false).is_empty() {
            return false;
        }

        debug!(author = self.author_id, start = self.sent_length, backtrack = self.backtrack, "Submitting selection");
        host.send_change(self.backtrack, Change::empty(self.sent_length).with_selections(selections));
        self.backtrack = 0;
        true
    }

    /// Apply a server-confirmed change, rebasing local work over it
    pub fn accept_change<H: EngineHost>(&mut self, host: &mut H, change: &Change) -> Result<Accepted> {
        let Some(author_id) = change.first_author_id() else {
            return Ok(Accepted::Ignored);
        };

        if author_id == self.author_id && change.end() <= self.sent_length {
            self.commit_length += change.len();
            return Ok(Accepted::Echo);
        }

        let mut uncommitted = host.change_since(self.commit_length, false);
        let result = rebase_uncommitted_change(change, &uncommitted)?;

        let rejected = result.rejected_len();
        if let Some(rejected_change) = &result.rejected {
            host.unapply_change(rejected_change)?;
            uncommitted = uncommitted.truncate(uncommitted.len() - rejected);
            if rejected_change.start() < self.sent_length {
                self.backtrack += self.sent_length - rejected_change.start();
                self.sent_length = rejected_change.start();
            }
        }

        let transposed = result.transposed_history.without_selection(self.author_id);
        host.apply_change(&transposed)?;

        host.remove_from_history(&transposed)?;
        host.remove_from_history(&uncommitted)?;
        host.add_to_history(change)?;
        host.add_to_history(&result.rebased)?;

        self.sent_length += change.len();
        self.commit_length += change.len();

        if !uncommitted.is_empty() || rejected > 0 {
            info!(
                author = self.author_id,
                from = author_id,
                start = change.start(),
                len = change.len(),
                uncommitted = uncommitted.len(),
                rejected,
                backtrack = self.backtrack,
                commit_length = self.commit_length,
                sent_length = self.sent_length,
                "Rebased local work"
            );
        }

        Ok(Accepted::Rebased { rejected })
    }
}
