//! Change tracking for in-memory configuration mutation.
//!
//! A [`ChangeTracker`] wraps a plain configuration value. Callers open a
//! [`Draft`] view, mutate through explicit `set`/`insert`/`delete` calls (the
//! Rust rendition of mutation interception: every write goes through a method
//! that records a structural [`Change`]), then close the tracker to collect
//! the ordered change list. [`combine_changes`] minimizes that list to an
//! equivalent one that replays to the same final value.
//!
//! Rules enforced on every write:
//! - assigning a structurally equal value is a no-op (no change recorded);
//! - adding takes the value by move, so the caller cannot mutate it afterwards;
//! - arrays reject non-integer selectors and out-of-bounds writes;
//! - a closed tracker revokes all outstanding drafts.

mod combine;

pub use combine::{combine_changes, CombinedTracker};

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::error::{WorkspaceError, WorkspaceResult};
use crate::value::{value_at, value_at_mut, JsonPath, JsonValue, PathSegment};

/// A single structural change at a path within a tracked value.
#[derive(Clone, Debug, PartialEq)]
pub enum Change {
    Add {
        path: JsonPath,
        value: JsonValue,
    },
    Delete {
        path: JsonPath,
        old_value: JsonValue,
    },
    Modify {
        path: JsonPath,
        value: JsonValue,
        old_value: JsonValue,
    },
}

impl Change {
    pub fn path(&self) -> &JsonPath {
        match self {
            Change::Add { path, .. } | Change::Delete { path, .. } | Change::Modify { path, .. } => {
                path
            }
        }
    }

    pub fn path_mut(&mut self) -> &mut JsonPath {
        match self {
            Change::Add { path, .. } | Change::Delete { path, .. } | Change::Modify { path, .. } => {
                path
            }
        }
    }

    /// The value this change writes, if any.
    pub fn new_value(&self) -> Option<&JsonValue> {
        match self {
            Change::Add { value, .. } | Change::Modify { value, .. } => Some(value),
            Change::Delete { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Change::Add { .. } => "add",
            Change::Delete { .. } => "delete",
            Change::Modify { .. } => "modify",
        }
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.path())
    }
}

struct TrackerState {
    root: JsonValue,
    changes: Vec<Change>,
    open: bool,
}

/// Records every mutation of a configuration value as a [`Change`].
pub struct ChangeTracker {
    state: Rc<RefCell<TrackerState>>,
}

impl ChangeTracker {
    pub fn new(original: JsonValue) -> Self {
        Self {
            state: Rc::new(RefCell::new(TrackerState {
                root: original,
                changes: Vec::new(),
                open: true,
            })),
        }
    }

    /// Open a mutable draft view rooted at the tracked value.
    pub fn open(&self) -> Draft {
        Draft {
            state: Rc::clone(&self.state),
            base: JsonPath::new(),
        }
    }

    /// Close the session. All outstanding drafts are revoked; further access
    /// through them fails. Returns the accumulated changes in mutation order.
    pub fn close(self) -> Vec<Change> {
        let mut state = self.state.borrow_mut();
        state.open = false;
        std::mem::take(&mut state.changes)
    }

    /// The current (mutated) value.
    pub fn value(&self) -> JsonValue {
        self.state.borrow().root.clone()
    }
}

/// A live, mutation-observable view into a tracked value.
///
/// Drafts are cheap to clone and may be scoped to a sub-path with [`Draft::at`];
/// all paths passed to accessors are relative to that base.
#[derive(Clone)]
pub struct Draft {
    state: Rc<RefCell<TrackerState>>,
    base: JsonPath,
}

impl Draft {
    /// A sub-view rooted at `base` relative to this draft.
    pub fn at(&self, base: JsonPath) -> Draft {
        Draft {
            state: Rc::clone(&self.state),
            base: self.base.join(&base),
        }
    }

    pub fn base(&self) -> &JsonPath {
        &self.base
    }

    fn full_path(&self, path: &JsonPath) -> JsonPath {
        self.base.join(path)
    }

    fn ensure_open(&self, state: &TrackerState) -> WorkspaceResult<()> {
        if state.open {
            Ok(())
        } else {
            Err(WorkspaceError::unsupported(
                "the change tracker for this view has been closed",
            ))
        }
    }

    /// Clone of the value at `path`, or `None` if absent.
    pub fn get(&self, path: &JsonPath) -> Option<JsonValue> {
        let state = self.state.borrow();
        if !state.open {
            return None;
        }
        value_at(&state.root, &self.full_path(path)).cloned()
    }

    pub fn exists(&self, path: &JsonPath) -> bool {
        let state = self.state.borrow();
        state.open && value_at(&state.root, &self.full_path(path)).is_some()
    }

    /// Clone of the whole value under this draft's base.
    pub fn value(&self) -> Option<JsonValue> {
        self.get(&JsonPath::new())
    }

    /// Assign `value` at `path`.
    ///
    /// Overwriting with a structurally equal value records nothing. Writing a
    /// previously absent object key records an `Add`; writing one past the end
    /// of an array appends. Everything else out of bounds is rejected.
    pub fn set(&self, path: &JsonPath, value: JsonValue) -> WorkspaceResult<()> {
        let full = self.full_path(path);
        let mut state = self.state.borrow_mut();
        self.ensure_open(&state)?;

        let Some(last) = full.last().cloned() else {
            // Replacing the root wholesale.
            let old = state.root.clone();
            if old == value {
                return Ok(());
            }
            state.root = value.clone();
            state.changes.push(Change::Modify {
                path: full,
                value,
                old_value: old,
            });
            return Ok(());
        };
        let parent_path = full.parent().expect("non-empty path has a parent");
        let Some(parent) = value_at_mut(&mut state.root, &parent_path) else {
            return Err(WorkspaceError::unsupported(format!(
                "cannot set {full}: parent path does not exist"
            )));
        };

        let change = match (parent, &last) {
            (JsonValue::Object(map), PathSegment::Key(key)) => match map.get(key) {
                Some(old) if *old == value => return Ok(()),
                Some(old) => {
                    let old_value = old.clone();
                    map.insert(key.clone(), value.clone());
                    Change::Modify {
                        path: full,
                        value,
                        old_value,
                    }
                }
                None => {
                    map.insert(key.clone(), value.clone());
                    Change::Add { path: full, value }
                }
            },
            (JsonValue::Array(items), PathSegment::Index(index)) => {
                if *index < items.len() {
                    if items[*index] == value {
                        return Ok(());
                    }
                    let old_value = items[*index].clone();
                    items[*index] = value.clone();
                    Change::Modify {
                        path: full,
                        value,
                        old_value,
                    }
                } else if *index == items.len() {
                    items.push(value.clone());
                    Change::Add { path: full, value }
                } else {
                    return Err(WorkspaceError::unsupported(format!(
                        "cannot set {full}: index {index} is past the end of the array"
                    )));
                }
            }
            (JsonValue::Array(_), PathSegment::Key(_)) => {
                return Err(WorkspaceError::unsupported(format!(
                    "cannot set {full}: arrays only accept integer indices"
                )))
            }
            (JsonValue::Object(_), PathSegment::Index(_)) => {
                return Err(WorkspaceError::unsupported(format!(
                    "cannot set {full}: objects only accept string keys"
                )))
            }
            _ => {
                return Err(WorkspaceError::unsupported(format!(
                    "cannot set {full}: parent is not an object or array"
                )))
            }
        };
        state.changes.push(change);
        Ok(())
    }

    /// Insert `value` into the array at `path`'s parent, shifting later items.
    pub fn insert(&self, path: &JsonPath, value: JsonValue) -> WorkspaceResult<()> {
        let full = self.full_path(path);
        let mut state = self.state.borrow_mut();
        self.ensure_open(&state)?;

        let (Some(PathSegment::Index(index)), Some(parent_path)) = (full.last().cloned(), full.parent())
        else {
            return Err(WorkspaceError::unsupported(format!(
                "cannot insert at {full}: insertion requires an array index"
            )));
        };
        let Some(JsonValue::Array(items)) = value_at_mut(&mut state.root, &parent_path) else {
            return Err(WorkspaceError::unsupported(format!(
                "cannot insert at {full}: parent is not an array"
            )));
        };
        if index > items.len() {
            return Err(WorkspaceError::unsupported(format!(
                "cannot insert at {full}: index {index} is past the end of the array"
            )));
        }
        items.insert(index, value.clone());
        state.changes.push(Change::Add { path: full, value });
        Ok(())
    }

    /// Delete the entry at `path`. Deleting an absent entry is a no-op.
    pub fn delete(&self, path: &JsonPath) -> WorkspaceResult<()> {
        let full = self.full_path(path);
        let mut state = self.state.borrow_mut();
        self.ensure_open(&state)?;

        let Some(last) = full.last().cloned() else {
            return Err(WorkspaceError::unsupported(
                "cannot delete the tracked root",
            ));
        };
        let parent_path = full.parent().expect("non-empty path has a parent");
        let Some(parent) = value_at_mut(&mut state.root, &parent_path) else {
            return Ok(());
        };

        let removed = match (parent, &last) {
            (JsonValue::Object(map), PathSegment::Key(key)) => map.shift_remove(key),
            (JsonValue::Array(items), PathSegment::Index(index)) => {
                if *index < items.len() {
                    Some(items.remove(*index))
                } else {
                    None
                }
            }
            (JsonValue::Array(_), PathSegment::Key(_)) => {
                return Err(WorkspaceError::unsupported(format!(
                    "cannot delete {full}: arrays only accept integer indices"
                )))
            }
            _ => None,
        };
        if let Some(old_value) = removed {
            state.changes.push(Change::Delete {
                path: full,
                old_value,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json_path;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn records_add_modify_delete_in_order() {
        let tracker = ChangeTracker::new(json!({"a": 1}));
        let draft = tracker.open();
        draft.set(&json_path!("b"), json!(2)).unwrap();
        draft.set(&json_path!("a"), json!(3)).unwrap();
        draft.delete(&json_path!("a")).unwrap();

        let changes = tracker.close();
        assert_eq!(
            changes,
            vec![
                Change::Add {
                    path: json_path!("b"),
                    value: json!(2)
                },
                Change::Modify {
                    path: json_path!("a"),
                    value: json!(3),
                    old_value: json!(1)
                },
                Change::Delete {
                    path: json_path!("a"),
                    old_value: json!(3)
                },
            ]
        );
    }

    #[test]
    fn structurally_equal_assignment_is_a_noop() {
        let tracker = ChangeTracker::new(json!({"opts": {"x": 1, "y": [1, 2]}}));
        let draft = tracker.open();
        // Different identity, different key order, same structure.
        draft
            .set(&json_path!("opts"), json!({"y": [1, 2], "x": 1}))
            .unwrap();
        assert_eq!(tracker.close(), vec![]);
    }

    #[test]
    fn array_rules() {
        let tracker = ChangeTracker::new(json!({"items": [1, 2]}));
        let draft = tracker.open();

        // Non-integer selector on an array is rejected.
        assert!(draft.set(&json_path!("items", "x"), json!(1)).is_err());
        // Out-of-bounds (past end + 1) is rejected.
        assert!(draft.set(&json_path!("items", 5), json!(1)).is_err());
        // Appending exactly at the end is an Add.
        draft.set(&json_path!("items", 2), json!(3)).unwrap();
        // Insertion shifts.
        draft.insert(&json_path!("items", 0), json!(0)).unwrap();
        assert_eq!(draft.get(&json_path!("items")), Some(json!([0, 1, 2, 3])));
    }

    #[test]
    fn delete_of_absent_key_is_noop() {
        let tracker = ChangeTracker::new(json!({"a": 1}));
        let draft = tracker.open();
        draft.delete(&json_path!("missing")).unwrap();
        draft.delete(&json_path!("a", "deep", "missing")).unwrap();
        assert_eq!(tracker.close(), vec![]);
    }

    #[test]
    fn close_revokes_outstanding_drafts() {
        let tracker = ChangeTracker::new(json!({"a": 1}));
        let draft = tracker.open();
        tracker.close();
        assert!(draft.set(&json_path!("a"), json!(2)).is_err());
        assert_eq!(draft.get(&json_path!("a")), None);
    }

    #[test]
    fn sub_drafts_share_state_with_rebased_paths() {
        let tracker = ChangeTracker::new(json!({"projects": {"app": {"root": ""}}}));
        let draft = tracker.open();
        let project = draft.at(json_path!("projects", "app"));
        project.set(&json_path!("prefix"), json!("app")).unwrap();

        let changes = tracker.close();
        assert_eq!(changes.len(), 1);
        assert_eq!(
            changes[0].path(),
            &json_path!("projects", "app", "prefix")
        );
    }

    #[test]
    fn set_parent_must_exist() {
        let tracker = ChangeTracker::new(json!({}));
        let draft = tracker.open();
        assert!(draft.set(&json_path!("a", "b"), json!(1)).is_err());
    }
}
