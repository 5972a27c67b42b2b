//! Minimization of a raw change stream.
//!
//! Changes are walked in mutation order through a trie keyed by path
//! segments. A change whose strict ancestor already carries a change is
//! subsumed; a change at an already-touched path merges with the recorded one
//! (add+delete cancels, delete+add collapses to modify, and so on), except
//! that repeated array inserts at one index are kept apart since each shifts
//! the items after it. The result is ordered by the first touch of each
//! surviving change and replays to the same document as the raw stream.

use std::collections::HashMap;

use super::{Change, ChangeTracker};
use crate::value::{JsonPath, JsonValue, PathSegment};

#[derive(Default)]
struct TrieNode {
    slot: Option<usize>,
    children: HashMap<PathSegment, TrieNode>,
}

impl TrieNode {
    /// Drop every recorded change strictly below this node. A replacement or
    /// deletion of a whole subtree subsumes changes inside it.
    fn clear_descendants(&mut self, slots: &mut [Option<Change>]) {
        for child in self.children.values_mut() {
            if let Some(slot) = child.slot.take() {
                slots[slot] = None;
            }
            child.clear_descendants(slots);
        }
        self.children.clear();
    }
}

/// Collapse `changes` into a minimal equivalent set: consecutive changes at
/// one path merge (array inserts excepted), and no entries survive under a
/// path whose whole subtree was replaced or deleted.
pub fn combine_changes(changes: Vec<Change>) -> Vec<Change> {
    let mut slots: Vec<Option<Change>> = Vec::with_capacity(changes.len());
    let mut root = TrieNode::default();

    'next_change: for change in changes {
        let segments: Vec<PathSegment> = change.path().segments().to_vec();
        let mut node = &mut root;
        for depth in 0..segments.len() {
            if let Some(slot) = node.slot.filter(|slot| slots[*slot].is_some()) {
                // A strict ancestor already carries this whole subtree. The
                // change is folded into the ancestor's recorded value so the
                // surviving change reflects the final state.
                if let Some(ancestor) = slots[slot].as_mut() {
                    fold_into(ancestor, &segments[depth..], change);
                }
                continue 'next_change;
            }
            node = node.children.entry(segments[depth].clone()).or_default();
        }

        match node.slot.and_then(|slot| slots[slot].is_some().then_some(slot)) {
            None => {
                node.clear_descendants(&mut slots);
                node.slot = Some(slots.len());
                slots.push(Some(change));
            }
            Some(slot) => {
                let existing = slots[slot].take().expect("live slot");
                if positional_insert_pair(&existing, &change) {
                    // Two inserts at the same index are distinct shifts, not
                    // a rewrite of one entry. Keep both, in record order, and
                    // track later changes at this path against the newer one.
                    slots[slot] = Some(existing);
                    node.slot = Some(slots.len());
                    slots.push(Some(change));
                } else {
                    match merge(existing, change) {
                        Some(merged) => slots[slot] = Some(merged),
                        None => node.slot = None,
                    }
                }
            }
        }
    }

    slots.into_iter().flatten().collect()
}

/// Apply a subsumed descendant change inside the value its ancestor change
/// carries. `rest` is the descendant's path relative to the ancestor.
fn fold_into(ancestor: &mut Change, rest: &[PathSegment], change: Change) {
    let value = match ancestor {
        Change::Add { value, .. } | Change::Modify { value, .. } => value,
        Change::Delete { .. } => return,
    };
    let Some((last, parents)) = rest.split_last() else {
        return;
    };
    let Some(parent) = descend_mut(value, parents) else {
        return;
    };
    match (change, parent, last) {
        (Change::Add { value, .. } | Change::Modify { value, .. }, JsonValue::Object(map), PathSegment::Key(key)) => {
            map.insert(key.clone(), value);
        }
        (Change::Add { value, .. }, JsonValue::Array(items), PathSegment::Index(index)) => {
            items.insert((*index).min(items.len()), value);
        }
        (Change::Modify { value, .. }, JsonValue::Array(items), PathSegment::Index(index)) => {
            if let Some(slot) = items.get_mut(*index) {
                *slot = value;
            }
        }
        (Change::Delete { .. }, JsonValue::Object(map), PathSegment::Key(key)) => {
            map.shift_remove(key);
        }
        (Change::Delete { .. }, JsonValue::Array(items), PathSegment::Index(index)) => {
            if *index < items.len() {
                items.remove(*index);
            }
        }
        _ => {}
    }
}

fn descend_mut<'a>(value: &'a mut JsonValue, path: &[PathSegment]) -> Option<&'a mut JsonValue> {
    path.iter()
        .try_fold(value, |current, segment| match (current, segment) {
            (JsonValue::Object(map), PathSegment::Key(key)) => map.get_mut(key),
            (JsonValue::Array(items), PathSegment::Index(index)) => items.get_mut(*index),
            _ => None,
        })
}

/// True when both changes are array inserts at the same index. Replaying the
/// pair produces two elements, so neither may absorb the other.
fn positional_insert_pair(first: &Change, second: &Change) -> bool {
    matches!(first, Change::Add { .. })
        && matches!(second, Change::Add { .. })
        && matches!(second.path().last(), Some(PathSegment::Index(_)))
}

/// Merge two consecutive changes at the same path. `None` means the pair
/// cancels out entirely.
fn merge(first: Change, second: Change) -> Option<Change> {
    match (first, second) {
        // Added then deleted: never existed as far as the document knows.
        (Change::Add { .. }, Change::Delete { .. }) => None,
        // Added then modified: a single add with the latest value.
        (Change::Add { path, .. }, Change::Modify { value, .. }) => {
            Some(Change::Add { path, value })
        }
        // Modified twice: keep the original old value, take the latest value.
        (Change::Modify { path, old_value, .. }, Change::Modify { value, .. }) => {
            Some(Change::Modify {
                path,
                value,
                old_value,
            })
        }
        // Deleted then re-added: a net modify from the original value.
        (Change::Delete { path, old_value }, Change::Add { value, .. }) => Some(Change::Modify {
            path,
            value,
            old_value,
        }),
        // Modified then deleted: delete with the original old value, never a
        // stale intermediate one.
        (Change::Modify { path, old_value, .. }, Change::Delete { .. }) => {
            Some(Change::Delete { path, old_value })
        }
        // The draft layer cannot produce the remaining pairings (add over an
        // existing key, modify of an absent one). Keep the latest if it ever
        // happens.
        (_, second) => Some(second),
    }
}

/// A [`ChangeTracker`] whose `close()` runs the combiner.
pub struct CombinedTracker {
    inner: ChangeTracker,
}

impl CombinedTracker {
    pub fn new(original: JsonValue) -> Self {
        Self {
            inner: ChangeTracker::new(original),
        }
    }

    pub fn open(&self) -> super::Draft {
        self.inner.open()
    }

    pub fn value(&self) -> JsonValue {
        self.inner.value()
    }

    /// Close the session and return the minimized change list.
    pub fn close(self) -> Vec<Change> {
        combine_changes(self.inner.close())
    }
}
