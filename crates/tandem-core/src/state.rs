//! Per-document state: committed history and the author registry

use crate::change::{AuthorId, Change, TextDocument};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Author colors, assigned by `author_id % 20`
pub const AUTHOR_COLORS: [&str; 20] = [
    "#e6194b", "#3cb44b", "#ffe119", "#4363d8", "#f58231",
    "#911eb4", "#46f0f0", "#f032e6", "#bcf60c", "#fabebe",
    "#008080", "#e6beff", "#9a6324", "#fffac8", "#800000",
    "#aaffc3", "#808000", "#ffd8b1", "#000075", "#808080",
];

/// Palette color for an author
pub fn author_color(author_id: AuthorId) -> &'static str {
    AUTHOR_COLORS[author_id as usize % AUTHOR_COLORS.len()]
}

/// Public author metadata, as broadcast to every connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorData {
    pub name: String,
    pub color: String,
}

/// Partial update of author metadata; `None` fields are left unchanged
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl AuthorPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.color.is_none()
    }
}

/// Server-side bookkeeping for one author of one document
#[derive(Debug, Clone)]
pub struct AuthorRecord {
    pub name: String,
    pub color: String,
    /// Secret session credential
    pub token: String,
    pub active: bool,
    /// Trailing transactions known to conflict and awaiting local rollback
    pub rejections: usize,
    /// The change this author's next submission is expected to extend
    pub continue_base: Option<Change>,
}

impl AuthorRecord {
    pub fn new(author_id: AuthorId, token: impl Into<String>) -> Self {
        Self {
            name: format!("Author {}", author_id),
            color: author_color(author_id).to_string(),
            token: token.into(),
            active: false,
            rejections: 0,
            continue_base: None,
        }
    }

    pub fn data(&self) -> AuthorData {
        AuthorData {
            name: self.name.clone(),
            color: self.color.clone(),
        }
    }

    /// Apply only the fields present in `patch`
    pub fn apply_patch(&mut self, patch: &AuthorPatch) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(color) = &patch.color {
            self.color = color.clone();
        }
    }

    /// Forget in-flight rebase state, keeping identity
    pub fn reset_continuation(&mut self) {
        self.rejections = 0;
        self.continue_base = None;
    }
}

/// In-memory state of one document
#[derive(Debug, Clone, Default)]
pub struct DocumentState {
    pub history: Change,
    /// Committed text, in step with `history`. `None` when the history does
    /// not start at zero and the text cannot be rebuilt.
    pub text: Option<TextDocument>,
    pub authors: BTreeMap<AuthorId, AuthorRecord>,
    next_author_id: AuthorId,
}

impl DocumentState {
    pub fn new() -> Self {
        Self {
            history: Change::empty(0),
            text: Some(TextDocument::new()),
            authors: BTreeMap::new(),
            next_author_id: 1,
        }
    }

    /// State seeded with already committed history
    pub fn with_history(history: Change) -> Result<Self> {
        let mut state = Self::new();
        state.replace_history(history)?;
        Ok(state)
    }

    /// Swap in `history`, rebuilding the committed text from it
    pub fn replace_history(&mut self, history: Change) -> Result<()> {
        self.text = if history.start() == 0 {
            let mut text = TextDocument::new();
            history.apply_to(&mut text)?;
            Some(text)
        } else {
            None
        };
        self.history = history;
        Ok(())
    }

    /// Append a committed change, provided it applies to the committed text.
    /// Nothing changes on error.
    pub fn commit(&mut self, change: &Change) -> Result<()> {
        let next = match &self.text {
            Some(text) => {
                let mut next = text.clone();
                change.apply_to(&mut next)?;
                Some(next)
            }
            None => None,
        };
        self.history.append(change)?;
        self.text = next;
        Ok(())
    }

    /// Offset just past the last committed transaction
    pub fn history_length(&self) -> usize {
        self.history.end()
    }

    /// Reserve the next author id
    pub fn mint_author_id(&mut self) -> AuthorId {
        let id = self.next_author_id.max(1);
        self.next_author_id = id + 1;
        id
    }

    /// Record for `author_id`, created if missing
    pub fn author_mut(&mut self, author_id: AuthorId) -> &mut AuthorRecord {
        if author_id >= self.next_author_id {
            self.next_author_id = author_id.saturating_add(1);
        }
        self.authors
            .entry(author_id)
            .or_insert_with(|| AuthorRecord::new(author_id, String::new()))
    }

    pub fn active_authors(&self) -> BTreeMap<AuthorId, AuthorData> {
        self.authors
            .iter()
            .filter(|(_, record)| record.active)
            .map(|(id, record)| (*id, record.data()))
            .collect()
    }
}
