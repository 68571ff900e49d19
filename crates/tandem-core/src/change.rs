//! Change primitive: positioned batches of text transactions

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Numeric author identity, unique per document
pub type AuthorId = u32;

/// A single elementary edit over Unicode scalar offsets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    /// Insert `text` before offset `pos`
    Insert { pos: usize, text: String },
    /// Remove `text`, which must currently start at `pos`
    Delete { pos: usize, text: String },
}

impl Step {
    pub fn insert(pos: usize, text: impl Into<String>) -> Self {
        Step::Insert { pos, text: text.into() }
    }

    pub fn delete(pos: usize, text: impl Into<String>) -> Self {
        Step::Delete { pos, text: text.into() }
    }

    pub fn pos(&self) -> usize {
        match self {
            Step::Insert { pos, .. } | Step::Delete { pos, .. } => *pos,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Step::Insert { text, .. } | Step::Delete { text, .. } => text,
        }
    }

    /// Number of scalar values inserted or removed
    pub fn len(&self) -> usize {
        self.text().chars().count()
    }

    /// A step that touches no text
    pub fn is_noop(&self) -> bool {
        self.text().is_empty()
    }

    /// The step that undoes this one
    pub fn invert(&self) -> Step {
        match self {
            Step::Insert { pos, text } => Step::delete(*pos, text.clone()),
            Step::Delete { pos, text } => Step::insert(*pos, text.clone()),
        }
    }

    /// Map a document offset from before this step to after it.
    /// Offsets at an insertion point move past the inserted text.
    pub fn map(&self, offset: usize) -> usize {
        match self {
            Step::Insert { pos, .. } => {
                if offset >= *pos {
                    offset.saturating_add(self.len())
                } else {
                    offset
                }
            }
            Step::Delete { pos, .. } => {
                let end = pos.saturating_add(self.len());
                if offset <= *pos {
                    offset
                } else if offset >= end {
                    offset.saturating_sub(self.len())
                } else {
                    *pos
                }
            }
        }
    }
}

/// One committed unit of editing by a single author
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub author: AuthorId,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Transaction {
    pub fn new(author: AuthorId, steps: Vec<Step>) -> Self {
        Self { author, steps }
    }

    /// The transaction that undoes this one
    pub fn invert(&self) -> Transaction {
        Transaction {
            author: self.author,
            steps: self.steps.iter().rev().map(Step::invert).collect(),
        }
    }
}

/// Cursor or range selection of one author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: usize,
    pub head: usize,
}

impl Selection {
    pub fn new(anchor: usize, head: usize) -> Self {
        Self { anchor, head }
    }

    pub fn caret(pos: usize) -> Self {
        Self { anchor: pos, head: pos }
    }

    /// Translate the selection through a sequence of steps
    pub fn map_through<'a>(self, steps: impl IntoIterator<Item = &'a Step>) -> Self {
        steps.into_iter().fold(self, |sel, step| Selection {
            anchor: step.map(sel.anchor),
            head: step.map(sel.head),
        })
    }
}

/// Serialized shape of a change; stores are normalized to one per transaction
#[derive(Serialize, Deserialize)]
struct ChangeWire {
    start: usize,
    #[serde(default)]
    transactions: Vec<Transaction>,
    #[serde(default)]
    stores: Vec<serde_json::Value>,
    #[serde(default, with = "author_keys")]
    selections: BTreeMap<AuthorId, Selection>,
}

/// Serde adapter writing author-keyed maps with string keys, so they survive
/// buffering inside tagged enums and read back from JSON objects.
pub mod author_keys {
    use super::AuthorId;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S, V>(map: &BTreeMap<AuthorId, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        V: Serialize,
    {
        serializer.collect_map(map.iter().map(|(id, value)| (id.to_string(), value)))
    }

    pub fn deserialize<'de, D, V>(deserializer: D) -> Result<BTreeMap<AuthorId, V>, D::Error>
    where
        D: Deserializer<'de>,
        V: Deserialize<'de>,
    {
        BTreeMap::<String, V>::deserialize(deserializer)?
            .into_iter()
            .map(|(key, value)| {
                key.parse::<AuthorId>()
                    .map(|id| (id, value))
                    .map_err(|_| D::Error::custom(format!("invalid author id: {}", key)))
            })
            .collect()
    }
}

/// A contiguous run of transactions anchored at `start` in a document's history.
///
/// Changes are values: every operation returns a new change and leaves the
/// receiver untouched. `stores` holds one opaque blob per transaction.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "ChangeWire", into = "ChangeWire")]
pub struct Change {
    start: usize,
    transactions: Vec<Transaction>,
    stores: Vec<serde_json::Value>,
    selections: BTreeMap<AuthorId, Selection>,
}

impl From<ChangeWire> for Change {
    fn from(wire: ChangeWire) -> Self {
        Change::new(wire.start, wire.transactions)
            .with_stores(wire.stores)
            .with_selections(wire.selections)
    }
}

impl From<Change> for ChangeWire {
    fn from(change: Change) -> Self {
        ChangeWire {
            start: change.start,
            transactions: change.transactions,
            stores: change.stores,
            selections: change.selections,
        }
    }
}

impl Change {
    pub fn new(start: usize, transactions: Vec<Transaction>) -> Self {
        let stores = vec![serde_json::Value::Null; transactions.len()];
        Self {
            start,
            transactions,
            stores,
            selections: BTreeMap::new(),
        }
    }

    /// An empty change positioned at `start`
    pub fn empty(start: usize) -> Self {
        Self::new(start, Vec::new())
    }

    /// Replace the per-transaction stores, padding or trimming to length
    pub fn with_stores(mut self, mut stores: Vec<serde_json::Value>) -> Self {
        stores.resize(self.transactions.len(), serde_json::Value::Null);
        self.stores = stores;
        self
    }

    pub fn with_selections(mut self, selections: BTreeMap<AuthorId, Selection>) -> Self {
        self.selections = selections;
        self
    }

    pub fn with_selection(mut self, author: AuthorId, selection: Selection) -> Self {
        self.selections.insert(author, selection);
        self
    }

    /// Copy of this change with one author's selection removed
    pub fn without_selection(&self, author: AuthorId) -> Self {
        let mut change = self.clone();
        change.selections.remove(&author);
        change
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    /// Offset just past the last transaction
    pub fn end(&self) -> usize {
        self.start + self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn stores(&self) -> &[serde_json::Value] {
        &self.stores
    }

    pub fn selections(&self) -> &BTreeMap<AuthorId, Selection> {
        &self.selections
    }

    /// All steps in application order
    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.transactions.iter().flat_map(|t| t.steps.iter())
    }

    pub fn first_author_id(&self) -> Option<AuthorId> {
        self.transactions.first().map(|t| t.author)
    }

    /// Keep the first `n` transactions
    pub fn truncate(&self, n: usize) -> Self {
        let n = n.min(self.len());
        Self {
            start: self.start,
            transactions: self.transactions[..n].to_vec(),
            stores: self.stores[..n].to_vec(),
            selections: if n == self.len() {
                self.selections.clone()
            } else {
                BTreeMap::new()
            },
        }
    }

    /// The part of this change from absolute offset `offset` onward
    pub fn most_recent(&self, offset: usize) -> Self {
        if offset <= self.start {
            return self.clone();
        }
        if offset >= self.end() {
            return Self::empty(offset);
        }
        let skip = offset - self.start;
        Self {
            start: offset,
            transactions: self.transactions[skip..].to_vec(),
            stores: self.stores[skip..].to_vec(),
            selections: self.selections.clone(),
        }
    }

    /// `self` followed by `other`, which must start where this change ends
    pub fn concat(&self, other: &Change) -> Result<Self> {
        let mut joined = self.clone();
        joined.append(other)?;
        Ok(joined)
    }

    /// In-place [`Change::concat`], for owners of a growing history
    pub fn append(&mut self, other: &Change) -> Result<()> {
        if self.end() != other.start {
            return Err(Error::Discontiguous {
                left_end: self.end(),
                right_start: other.start,
            });
        }

        for sel in self.selections.values_mut() {
            *sel = sel.map_through(other.steps());
        }
        self.selections
            .extend(other.selections.iter().map(|(a, s)| (*a, *s)));
        self.transactions.extend(other.transactions.iter().cloned());
        self.stores.extend(other.stores.iter().cloned());
        Ok(())
    }

    /// Drop `suffix`, which must end exactly where this change ends
    pub fn strip_suffix(&self, suffix: &Change) -> Result<Self> {
        if suffix.end() != self.end() || suffix.start < self.start {
            return Err(Error::HistoryMismatch {
                expected: suffix.end(),
                actual: self.end(),
            });
        }
        Ok(self.truncate(suffix.start - self.start))
    }

    /// Inverse change: transactions in reverse order with inverted steps
    pub fn reversed(&self) -> Self {
        Self {
            start: self.start,
            transactions: self.transactions.iter().rev().map(Transaction::invert).collect(),
            stores: self.stores.iter().rev().cloned().collect(),
            selections: BTreeMap::new(),
        }
    }

    /// Apply every step to `doc`; on error the document is left untouched
    pub fn apply_to(&self, doc: &mut TextDocument) -> Result<()> {
        let mut next = doc.clone();
        for step in self.steps() {
            next.apply_step(step)?;
        }
        *doc = next;
        Ok(())
    }

    /// Undo this change on `doc`, which must currently end with it applied
    pub fn unapply_from(&self, doc: &mut TextDocument) -> Result<()> {
        self.reversed().apply_to(doc)
    }
}

/// Plain text buffer addressed by Unicode scalar offsets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextDocument {
    text: String,
}

impl TextDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_text(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Length in Unicode scalar values
    pub fn len(&self) -> usize {
        self.text.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    fn byte_offset(&self, pos: usize) -> Result<usize> {
        if pos == 0 {
            return Ok(0);
        }
        match self.text.char_indices().nth(pos) {
            Some((byte, _)) => Ok(byte),
            None if pos == self.len() => Ok(self.text.len()),
            None => Err(Error::OutOfRange { pos, len: self.len() }),
        }
    }

    pub fn apply_step(&mut self, step: &Step) -> Result<()> {
        match step {
            Step::Insert { pos, text } => {
                let at = self.byte_offset(*pos)?;
                self.text.insert_str(at, text);
            }
            Step::Delete { pos, text } => {
                let from = self.byte_offset(*pos)?;
                let end = pos
                    .checked_add(step.len())
                    .ok_or(Error::PositionOverflow(*pos))?;
                let to = self.byte_offset(end)?;
                if &self.text[from..to] != text {
                    return Err(Error::TextMismatch(*pos));
                }
                self.text.replace_range(from..to, "");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn(author: AuthorId, steps: Vec<Step>) -> Transaction {
        Transaction::new(author, steps)
    }

    #[test]
    fn test_slicing_keeps_positions() {
        let change = Change::new(
            3,
            vec![
                txn(1, vec![Step::insert(0, "a")]),
                txn(1, vec![Step::insert(1, "b")]),
                txn(2, vec![Step::insert(2, "c")]),
            ],
        );

        let head = change.truncate(2);
        assert_eq!(head.start(), 3);
        assert_eq!(head.len(), 2);

        let tail = change.most_recent(4);
        assert_eq!(tail.start(), 4);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail.first_author_id(), Some(1));

        assert_eq!(change.most_recent(0), change);
        let past_end = change.most_recent(10);
        assert!(past_end.is_empty());
        assert_eq!(past_end.start(), 10);
    }

    #[test]
    fn test_concat_requires_contiguity() {
        let a = Change::new(0, vec![txn(1, vec![Step::insert(0, "x")])]);
        let b = Change::new(1, vec![txn(2, vec![Step::insert(1, "y")])]);
        let c = Change::new(5, vec![]);

        let joined = a.concat(&b).unwrap();
        assert_eq!(joined.len(), 2);
        assert_eq!(joined.stores().len(), 2);
        assert!(matches!(
            a.concat(&c),
            Err(Error::Discontiguous { left_end: 1, right_start: 5 })
        ));
    }

    #[test]
    fn test_concat_maps_earlier_selections() {
        let a = Change::new(0, vec![txn(1, vec![Step::insert(0, "abc")])])
            .with_selection(1, Selection::caret(3));
        let b = Change::new(1, vec![txn(2, vec![Step::insert(0, "zz")])])
            .with_selection(2, Selection::caret(2));

        let joined = a.concat(&b).unwrap();
        assert_eq!(joined.selections()[&1], Selection::caret(5));
        assert_eq!(joined.selections()[&2], Selection::caret(2));
    }

    #[test]
    fn test_apply_and_unapply() {
        let mut doc = TextDocument::from_text("héllo");
        let change = Change::new(
            0,
            vec![
                txn(1, vec![Step::insert(5, " world")]),
                txn(1, vec![Step::delete(0, "hé")]),
            ],
        );

        change.apply_to(&mut doc).unwrap();
        assert_eq!(doc.text(), "llo world");

        change.unapply_from(&mut doc).unwrap();
        assert_eq!(doc.text(), "héllo");
    }

    #[test]
    fn test_failed_apply_leaves_document_untouched() {
        let mut doc = TextDocument::from_text("abc");
        let change = Change::new(
            0,
            vec![txn(1, vec![Step::insert(0, "x"), Step::delete(2, "zz")])],
        );

        assert!(matches!(change.apply_to(&mut doc), Err(Error::TextMismatch(2))));
        assert_eq!(doc.text(), "abc");

        let far = Change::new(0, vec![txn(1, vec![Step::insert(9, "x")])]);
        assert!(matches!(far.apply_to(&mut doc), Err(Error::OutOfRange { pos: 9, len: 3 })));
    }

    #[test]
    fn test_wire_form_pads_stores() {
        let json = r#"{"start":2,"transactions":[{"author":4,"steps":[{"op":"insert","pos":0,"text":"hi"}]}],"selections":{"4":{"anchor":2,"head":2}}}"#;
        let change: Change = serde_json::from_str(json).unwrap();

        assert_eq!(change.start(), 2);
        assert_eq!(change.stores(), &[serde_json::Value::Null]);
        assert_eq!(change.selections()[&4], Selection::caret(2));

        let back = serde_json::to_value(&change).unwrap();
        assert_eq!(back["stores"], serde_json::json!([null]));
    }

    #[test]
    fn test_selection_mapping() {
        let steps = vec![Step::insert(0, "ab"), Step::delete(4, "cd")];
        let sel = Selection::new(3, 7).map_through(&steps);
        assert_eq!(sel, Selection::new(4, 7));
    }
}
