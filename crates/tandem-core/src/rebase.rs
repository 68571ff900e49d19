//! Rebasing uncommitted work over committed history
//!
//! Both the server coordinator and every client run
//! [`rebase_uncommitted_change`] independently, so the outcome depends only on
//! its inputs. Ties between concurrent inserts go to the committed side.

use crate::change::{Change, Selection, Step, Transaction};
use crate::error::{Error, Result};
use std::collections::BTreeMap;

/// Outcome of rebasing an uncommitted change over a committed base
#[derive(Debug, Clone, PartialEq)]
pub struct RebaseResult {
    /// Accepted uncommitted transactions, transformed to follow the base
    pub rebased: Change,
    /// Suffix of the uncommitted change that could not be reconciled
    pub rejected: Option<Change>,
    /// The base, transformed to follow the accepted uncommitted prefix
    pub transposed_history: Change,
}

impl RebaseResult {
    pub fn rejected_len(&self) -> usize {
        self.rejected.as_ref().map_or(0, Change::len)
    }
}

/// Why a local transaction could not be carried across the base
#[derive(Debug)]
enum Reject {
    /// A local insert landed inside text the base removed
    Conflict,
    /// A position too large to shift; no real document is that long
    Overflow(usize),
}

type Transformed = std::result::Result<(Vec<Step>, Vec<Step>), Reject>;

/// Rebase `uncommitted` over `base`; both must start at the same offset.
pub fn rebase_uncommitted_change(base: &Change, uncommitted: &Change) -> Result<RebaseResult> {
    if base.start() != uncommitted.start() {
        return Err(Error::Misaligned {
            base: base.start(),
            uncommitted: uncommitted.start(),
        });
    }

    let mut transposed: Vec<Transaction> = base.transactions().to_vec();
    let mut rebased: Vec<Transaction> = Vec::with_capacity(uncommitted.len());

    for local in uncommitted.transactions() {
        match transform_transaction(&transposed, local) {
            Ok((next, local)) => {
                transposed = next;
                rebased.push(local);
            }
            Err(Reject::Conflict) => break,
            Err(Reject::Overflow(pos)) => return Err(Error::PositionOverflow(pos)),
        }
    }

    let accepted = rebased.len();
    let split = uncommitted.start() + accepted;
    let rejected = (accepted < uncommitted.len()).then(|| uncommitted.most_recent(split));
    let rebased_steps: Vec<Step> = rebased.iter().flat_map(|t| t.steps.clone()).collect();
    let transposed_steps: Vec<Step> = transposed.iter().flat_map(|t| t.steps.clone()).collect();

    // Uncommitted selections describe the state including any rejected tail.
    let rollback: Vec<Step> = rejected
        .as_ref()
        .map(|r| r.reversed().steps().cloned().collect())
        .unwrap_or_default();
    let local_selections: BTreeMap<_, Selection> = uncommitted
        .selections()
        .iter()
        .map(|(author, sel)| {
            (*author, sel.map_through(rollback.iter().chain(transposed_steps.iter())))
        })
        .collect();
    let base_selections: BTreeMap<_, Selection> = base
        .selections()
        .iter()
        .map(|(author, sel)| (*author, sel.map_through(&rebased_steps)))
        .collect();

    Ok(RebaseResult {
        rebased: Change::new(base.end(), rebased)
            .with_stores(uncommitted.stores()[..accepted].to_vec())
            .with_selections(local_selections),
        rejected,
        transposed_history: Change::new(split, transposed)
            .with_stores(base.stores().to_vec())
            .with_selections(base_selections),
    })
}

/// Transform one local transaction across every base transaction in order.
fn transform_transaction(
    base: &[Transaction],
    local: &Transaction,
) -> std::result::Result<(Vec<Transaction>, Transaction), Reject> {
    let mut local_steps = local.steps.clone();
    let mut next_base = Vec::with_capacity(base.len());

    for txn in base {
        let (base_steps, rest) = transform_steps(&txn.steps, &local_steps)?;
        next_base.push(Transaction::new(txn.author, base_steps));
        local_steps = rest;
    }

    Ok((next_base, Transaction::new(local.author, local_steps)))
}

/// Transform two step sequences sharing a starting state. Returns
/// `(base', local')` where `base'` follows `local` and `local'` follows `base`.
fn transform_steps(base: &[Step], local: &[Step]) -> Transformed {
    match (base, local) {
        ([], _) | (_, []) => Ok((base.to_vec(), local.to_vec())),
        ([b], [l]) => transform_pair(b, l),
        ([first, rest @ ..], _) if !rest.is_empty() => {
            let (mut head, local) = transform_steps(std::slice::from_ref(first), local)?;
            let (tail, local) = transform_steps(rest, &local)?;
            head.extend(tail);
            Ok((head, local))
        }
        (_, [first, rest @ ..]) => {
            let (base, mut head) = transform_steps(base, std::slice::from_ref(first))?;
            let (base, tail) = transform_steps(&base, rest)?;
            head.extend(tail);
            Ok((base, head))
        }
    }
}

fn shift(pos: usize, by: usize) -> std::result::Result<usize, Reject> {
    pos.checked_add(by).ok_or(Reject::Overflow(pos))
}

fn transform_pair(base: &Step, local: &Step) -> Transformed {
    if base.is_noop() || local.is_noop() {
        let keep = |s: &Step| if s.is_noop() { vec![] } else { vec![s.clone()] };
        return Ok((keep(base), keep(local)));
    }

    let (bp, lp) = (base.pos(), local.pos());
    let (blen, llen) = (base.len(), local.len());

    match (base, local) {
        (Step::Insert { text: bt, .. }, Step::Insert { text: lt, .. }) => {
            if bp <= lp {
                Ok((vec![Step::insert(bp, bt.clone())], vec![Step::insert(shift(lp, blen)?, lt.clone())]))
            } else {
                Ok((vec![Step::insert(shift(bp, llen)?, bt.clone())], vec![Step::insert(lp, lt.clone())]))
            }
        }
        (Step::Insert { text: bt, .. }, Step::Delete { text: lt, .. }) => {
            let lend = shift(lp, llen)?;
            if bp <= lp {
                Ok((vec![Step::insert(bp, bt.clone())], vec![Step::delete(shift(lp, blen)?, lt.clone())]))
            } else if bp >= lend {
                Ok((vec![Step::insert(bp - llen, bt.clone())], vec![Step::delete(lp, lt.clone())]))
            } else {
                // Committed text lands inside the local deletion: keep it.
                let (before, after) = split_chars(lt, bp - lp);
                Ok((
                    vec![Step::insert(lp, bt.clone())],
                    vec![Step::delete(lp, before), Step::delete(shift(lp, blen)?, after)],
                ))
            }
        }
        (Step::Delete { text: bt, .. }, Step::Insert { text: lt, .. }) => {
            let bend = shift(bp, blen)?;
            if lp <= bp {
                Ok((vec![Step::delete(shift(bp, llen)?, bt.clone())], vec![Step::insert(lp, lt.clone())]))
            } else if lp >= bend {
                Ok((vec![Step::delete(bp, bt.clone())], vec![Step::insert(lp - blen, lt.clone())]))
            } else {
                Err(Reject::Conflict)
            }
        }
        (Step::Delete { text: bt, .. }, Step::Delete { text: lt, .. }) => Ok((
            shrink_delete(bp, bt, lp, llen)?,
            shrink_delete(lp, lt, bp, blen)?,
        )),
    }
}

/// What remains of deleting `text` at `pos` once `other_len` scalars at
/// `other_pos` are already gone.
fn shrink_delete(
    pos: usize,
    text: &str,
    other_pos: usize,
    other_len: usize,
) -> std::result::Result<Vec<Step>, Reject> {
    let len = text.chars().count();
    let (end, other_end) = (shift(pos, len)?, shift(other_pos, other_len)?);

    if end <= other_pos {
        return Ok(vec![Step::delete(pos, text)]);
    }
    if pos >= other_end {
        return Ok(vec![Step::delete(pos - other_len, text)]);
    }

    let keep_head = other_pos.saturating_sub(pos);
    let keep_tail_from = end.min(other_end) - pos;
    let remaining: String = text
        .chars()
        .enumerate()
        .filter(|(i, _)| *i < keep_head || *i >= keep_tail_from)
        .map(|(_, c)| c)
        .collect();

    if remaining.is_empty() {
        Ok(vec![])
    } else {
        Ok(vec![Step::delete(pos.min(other_pos), remaining)])
    }
}

fn split_chars(text: &str, at: usize) -> (String, String) {
    let before: String = text.chars().take(at).collect();
    let after: String = text.chars().skip(at).collect();
    (before, after)
}
