//! Field-level diff and merge for session documents.
//!
//! A writer's intent is recovered by diffing the snapshot it read against the
//! document it wants to write. Only that change list is replayed onto the
//! document currently on disk, so fields the writer never touched keep
//! whatever another writer stored in the meantime.
//!
//! Objects are diffed key by key, recursively. Every other value, arrays
//! included, is compared whole and replaced whole.

use serde_json::{Map, Value};

/// One field operation, addressed by its key path from the document root.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Set the field at `path` to `value`, creating parent objects as needed.
    Set { path: Vec<String>, value: Value },
    /// Remove the field at `path` if present.
    Remove { path: Vec<String> },
}

/// Compute the changes that turn `original` into `proposed`.
///
/// Removals come first within each object, then additions and updates in
/// `proposed` key order.
pub fn diff(original: &Map<String, Value>, proposed: &Map<String, Value>) -> Vec<Change> {
    let mut changes = Vec::new();
    let mut path = Vec::new();
    diff_into(original, proposed, &mut path, &mut changes);
    changes
}

fn diff_into(
    original: &Map<String, Value>,
    proposed: &Map<String, Value>,
    path: &mut Vec<String>,
    changes: &mut Vec<Change>,
) {
    for key in original.keys() {
        if !proposed.contains_key(key) {
            changes.push(Change::Remove {
                path: child(path, key),
            });
        }
    }

    for (key, new) in proposed {
        match (original.get(key), new) {
            (Some(Value::Object(old)), Value::Object(new)) => {
                path.push(key.clone());
                diff_into(old, new, path, changes);
                path.pop();
            }
            (Some(old), new) if old == new => {}
            _ => changes.push(Change::Set {
                path: child(path, key),
                value: new.clone(),
            }),
        }
    }
}

fn child(path: &[String], key: &str) -> Vec<String> {
    let mut p = path.to_vec();
    p.push(key.to_string());
    p
}

/// Replay `changes` onto `target`.
///
/// A `Set` whose parent is missing or not an object replaces the parent with
/// an object. A `Remove` of a missing field is a no-op.
pub fn apply(target: &mut Map<String, Value>, changes: &[Change]) {
    for change in changes {
        match change {
            Change::Set { path, value } => set_path(target, path, value.clone()),
            Change::Remove { path } => remove_path(target, path),
        }
    }
}

fn set_path(target: &mut Map<String, Value>, path: &[String], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut current = target;
    for key in parents {
        let slot = current
            .entry(key.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        current = match slot {
            Value::Object(map) => map,
            _ => return,
        };
    }
    current.insert(last.clone(), value);
}

fn remove_path(target: &mut Map<String, Value>, path: &[String]) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut current = target;
    for key in parents {
        current = match current.get_mut(key) {
            Some(Value::Object(map)) => map,
            _ => return,
        };
    }
    current.remove(last);
}

/// Diff `original` against `proposed` and replay the result onto `current`.
pub fn merge(
    original: &Map<String, Value>,
    proposed: &Map<String, Value>,
    mut current: Map<String, Value>,
) -> Map<String, Value> {
    apply(&mut current, &diff(original, proposed));
    current
}
