//! Change application onto YAML source text.
//!
//! Each change becomes a single text splice at the deepest point where the
//! document still has local structure for the change's path. Everything
//! below that point is synthesized in flow style. Aliases are never edited
//! in place: the alias position is replaced by a merge-keyed map shadowing
//! only the touched property, so the anchored original and every other
//! consumer of the anchor stay untouched.

use super::ast::{YamlKind, YamlNode, YamlTree};
use super::{merge_sources, render_flow, scalar_string};
use crate::error::{WorkspaceError, WorkspaceResult};
use crate::files::{line_indent, TextEdit};
use crate::tracker::Change;
use crate::value::{JsonValue, PathSegment};

pub(crate) fn edit_for_change(
    text: &str,
    tree: &YamlTree,
    change: &Change,
) -> WorkspaceResult<TextEdit> {
    let segments = change.path().segments();
    if segments.is_empty() {
        let Some(JsonValue::Object(map)) = change.new_value() else {
            return Err(WorkspaceError::consistency(
                change.path().clone(),
                "the document root can only be replaced by an object",
            ));
        };
        return Ok(TextEdit::replace(0..text.len(), super::emit_document(map)));
    }

    let mut current = &tree.root;
    for (depth, segment) in segments.iter().enumerate() {
        let terminal = depth + 1 == segments.len();

        if let YamlKind::Alias { name } = &current.kind {
            let body = shadowed_alias(text, tree, name, &segments[depth..], change)?;
            return Ok(TextEdit::replace(current.span.clone(), body));
        }

        match (&current.kind, segment) {
            (YamlKind::Map { entries, flow }, PathSegment::Key(key)) => {
                match current.entry_index(key) {
                    Some(index) => {
                        if terminal {
                            return map_terminal(text, current, entries, *flow, index, change);
                        }
                        current = &entries[index].1;
                    }
                    None => {
                        let inherited = lookup_in(current, key, tree)?;
                        return match (terminal, change, inherited) {
                            (true, Change::Add { value, .. }, None) => insert_map_entry(
                                text,
                                current,
                                entries,
                                *flow,
                                key,
                                &render_flow(value),
                            ),
                            // Shadow an inherited value with a local entry.
                            (true, Change::Modify { value, .. }, Some(_)) => insert_map_entry(
                                text,
                                current,
                                entries,
                                *flow,
                                key,
                                &render_flow(value),
                            ),
                            // Merge keys cannot remove a key; an explicit
                            // null shadow is the closest the format allows.
                            (true, Change::Delete { .. }, Some(_)) => {
                                insert_map_entry(text, current, entries, *flow, key, "null")
                            }
                            (false, _, Some(node)) => {
                                let body = render_patched(
                                    text,
                                    tree,
                                    node,
                                    &segments[depth + 1..],
                                    change,
                                )?;
                                insert_map_entry(text, current, entries, *flow, key, &body)
                            }
                            (true, Change::Add { .. }, Some(_)) => Err(WorkspaceError::consistency(
                                change.path().clone(),
                                "value already exists at add path",
                            )),
                            _ => Err(WorkspaceError::consistency(
                                change.path().clone(),
                                "path not found in document",
                            )),
                        };
                    }
                }
            }
            (YamlKind::Seq { items, flow }, PathSegment::Index(index)) => {
                if terminal {
                    return seq_terminal(text, current, items, *flow, *index, change);
                }
                current = items.get(*index).ok_or_else(|| {
                    WorkspaceError::consistency(change.path().clone(), "index out of bounds")
                })?;
            }
            _ => {
                return Err(WorkspaceError::consistency(
                    change.path().clone(),
                    "expected a container along the change path",
                ))
            }
        }
    }

    Err(WorkspaceError::consistency(
        change.path().clone(),
        "change path did not terminate",
    ))
}

// ---------------------------------------------------------------------------
// Synthesis below the splice point
// ---------------------------------------------------------------------------

/// Flow text for a merge-keyed map shadowing one property of the anchored
/// target: `{<<: *name, key: <patched>}`.
fn shadowed_alias(
    text: &str,
    tree: &YamlTree,
    name: &str,
    remaining: &[PathSegment],
    change: &Change,
) -> WorkspaceResult<String> {
    let target = tree
        .anchored(name)
        .ok_or_else(|| WorkspaceError::invalid(format!("unknown alias *{name}")))?;
    let PathSegment::Key(key) = &remaining[0] else {
        return Err(WorkspaceError::consistency(
            change.path().clone(),
            "cannot edit through an alias at a sequence position",
        ));
    };
    let sub = lookup_in(target, key, tree)?;
    let body = if remaining.len() == 1 {
        match (change, sub) {
            (Change::Add { value, .. }, None) => render_flow(value),
            (Change::Add { .. }, Some(_)) => {
                return Err(WorkspaceError::consistency(
                    change.path().clone(),
                    "value already exists at add path",
                ))
            }
            (Change::Modify { value, .. }, Some(_)) => render_flow(value),
            (Change::Delete { .. }, Some(_)) => "null".to_string(),
            _ => {
                return Err(WorkspaceError::consistency(
                    change.path().clone(),
                    "path not found in document",
                ))
            }
        }
    } else {
        let sub = sub.ok_or_else(|| {
            WorkspaceError::consistency(change.path().clone(), "path not found in document")
        })?;
        render_patched(text, tree, sub, &remaining[1..], change)?
    };
    Ok(format!("{{<<: *{name}, {}: {body}}}", scalar_string(key)))
}

/// Flow text for a clone of `node` with the change applied at `remaining`.
/// Nodes carrying an anchor are not duplicated; the clone aliases back to
/// them (with a merge-key shadow when the change lands inside).
fn render_patched(
    text: &str,
    tree: &YamlTree,
    node: &YamlNode,
    remaining: &[PathSegment],
    change: &Change,
) -> WorkspaceResult<String> {
    if remaining.is_empty() {
        return match change.new_value() {
            Some(value) => Ok(render_flow(value)),
            None => Err(WorkspaceError::consistency(
                change.path().clone(),
                "cannot delete below a synthesized value",
            )),
        };
    }
    if let YamlKind::Alias { name } = &node.kind {
        return shadowed_alias(text, tree, name, remaining, change);
    }
    if let Some(anchor) = &node.anchor {
        if matches!(node.kind, YamlKind::Map { .. }) {
            return shadowed_alias(text, tree, anchor, remaining, change);
        }
    }

    match (&node.kind, &remaining[0]) {
        (YamlKind::Map { entries, .. }, PathSegment::Key(key)) => {
            let mut parts: Vec<String> = Vec::new();
            let mut touched = false;
            for (key_node, value_node) in entries {
                if key_node.is_merge_key() {
                    parts.push(format!("<<: {}", render_clone_ref(text, value_node)));
                    continue;
                }
                let Some(key_text) = key_node.scalar_value() else {
                    return Err(WorkspaceError::invalid("mapping keys must be scalars"));
                };
                if key_text == key {
                    touched = true;
                    if remaining.len() == 1 {
                        match change {
                            Change::Delete { .. } => {} // drop the entry
                            Change::Modify { value, .. } => parts.push(format!(
                                "{}: {}",
                                scalar_string(key),
                                render_flow(value)
                            )),
                            Change::Add { .. } => {
                                return Err(WorkspaceError::consistency(
                                    change.path().clone(),
                                    "value already exists at add path",
                                ))
                            }
                        }
                    } else {
                        parts.push(format!(
                            "{}: {}",
                            scalar_string(key),
                            render_patched(text, tree, value_node, &remaining[1..], change)?
                        ));
                    }
                } else {
                    parts.push(format!(
                        "{}: {}",
                        &text[key_node.span.clone()],
                        render_clone_ref(text, value_node)
                    ));
                }
            }
            if !touched {
                match (remaining.len() == 1, change, lookup_in(node, key, tree)?) {
                    (true, Change::Add { value, .. }, None) => {
                        parts.push(format!("{}: {}", scalar_string(key), render_flow(value)))
                    }
                    (true, Change::Add { .. }, Some(_)) => {
                        return Err(WorkspaceError::consistency(
                            change.path().clone(),
                            "value already exists at add path",
                        ))
                    }
                    (true, Change::Modify { value, .. }, Some(_)) => {
                        parts.push(format!("{}: {}", scalar_string(key), render_flow(value)))
                    }
                    (true, Change::Delete { .. }, Some(_)) => {
                        parts.push(format!("{}: null", scalar_string(key)))
                    }
                    (false, _, Some(sub)) => parts.push(format!(
                        "{}: {}",
                        scalar_string(key),
                        render_patched(text, tree, sub, &remaining[1..], change)?
                    )),
                    _ => {
                        return Err(WorkspaceError::consistency(
                            change.path().clone(),
                            "path not found in document",
                        ))
                    }
                }
            }
            Ok(format!("{{{}}}", parts.join(", ")))
        }
        (YamlKind::Seq { items, .. }, PathSegment::Index(index)) => {
            let mut parts: Vec<String> =
                items.iter().map(|item| render_clone_ref(text, item)).collect();
            if remaining.len() == 1 {
                match change {
                    Change::Add { value, .. } => {
                        if *index > parts.len() {
                            return Err(WorkspaceError::consistency(
                                change.path().clone(),
                                "index out of bounds",
                            ));
                        }
                        parts.insert(*index, render_flow(value));
                    }
                    Change::Modify { value, .. } => {
                        let slot = parts.get_mut(*index).ok_or_else(|| {
                            WorkspaceError::consistency(
                                change.path().clone(),
                                "index out of bounds",
                            )
                        })?;
                        *slot = render_flow(value);
                    }
                    Change::Delete { .. } => {
                        if *index >= parts.len() {
                            return Err(WorkspaceError::consistency(
                                change.path().clone(),
                                "index out of bounds",
                            ));
                        }
                        parts.remove(*index);
                    }
                }
            } else {
                let item = items.get(*index).ok_or_else(|| {
                    WorkspaceError::consistency(change.path().clone(), "index out of bounds")
                })?;
                parts[*index] = render_patched(text, tree, item, &remaining[1..], change)?;
            }
            Ok(format!("[{}]", parts.join(", ")))
        }
        _ => Err(WorkspaceError::consistency(
            change.path().clone(),
            "expected a container along the change path",
        )),
    }
}

/// Clone a node as flow text, keeping aliases and merge keys written as
/// they were. The clone root drops its own anchor.
fn render_clone(text: &str, node: &YamlNode) -> String {
    match &node.kind {
        YamlKind::Alias { name } => format!("*{name}"),
        YamlKind::Scalar { .. } => text[node.span.clone()].to_string(),
        YamlKind::Map { entries, .. } => {
            if entries.is_empty() {
                return "{}".to_string();
            }
            let parts: Vec<String> = entries
                .iter()
                .map(|(key, value)| {
                    let key_text = if key.is_merge_key() {
                        "<<".to_string()
                    } else {
                        text[key.span.clone()].to_string()
                    };
                    format!("{key_text}: {}", render_clone_ref(text, value))
                })
                .collect();
            format!("{{{}}}", parts.join(", "))
        }
        YamlKind::Seq { items, .. } => {
            let parts: Vec<String> = items.iter().map(|item| render_clone_ref(text, item)).collect();
            format!("[{}]", parts.join(", "))
        }
    }
}

/// Nested positions alias back to anchored originals instead of duplicating
/// their content.
fn render_clone_ref(text: &str, node: &YamlNode) -> String {
    if let Some(anchor) = &node.anchor {
        return format!("*{anchor}");
    }
    render_clone(text, node)
}

// ---------------------------------------------------------------------------
// Lookup through aliases and merge keys
// ---------------------------------------------------------------------------

fn deref<'t>(node: &'t YamlNode, tree: &'t YamlTree) -> WorkspaceResult<&'t YamlNode> {
    let mut current = node;
    let mut hops = 0;
    while let YamlKind::Alias { name } = &current.kind {
        current = tree
            .anchored(name)
            .ok_or_else(|| WorkspaceError::invalid(format!("unknown alias *{name}")))?;
        hops += 1;
        if hops > 64 {
            return Err(WorkspaceError::invalid("alias chain too deep"));
        }
    }
    Ok(current)
}

/// The value node for `key` in a mapping: local entries first, then `<<`
/// merge sources in order.
fn lookup_in<'t>(
    node: &'t YamlNode,
    key: &str,
    tree: &'t YamlTree,
) -> WorkspaceResult<Option<&'t YamlNode>> {
    let node = deref(node, tree)?;
    let YamlKind::Map { entries, .. } = &node.kind else {
        return Ok(None);
    };
    if let Some(index) = node.entry_index(key) {
        return Ok(Some(&entries[index].1));
    }
    for (entry_key, entry_value) in entries {
        if entry_key.is_merge_key() {
            for source in merge_sources(entry_value) {
                if let Some(found) = lookup_in(source, key, tree)? {
                    return Ok(Some(found));
                }
            }
        }
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// Terminal splices
// ---------------------------------------------------------------------------

fn map_terminal(
    text: &str,
    map: &YamlNode,
    entries: &[(YamlNode, YamlNode)],
    flow: bool,
    index: usize,
    change: &Change,
) -> WorkspaceResult<TextEdit> {
    match change {
        Change::Modify { value, .. } => Ok(TextEdit::replace(
            entries[index].1.span.clone(),
            render_flow(value),
        )),
        Change::Add { .. } => Err(WorkspaceError::consistency(
            change.path().clone(),
            "value already exists at add path",
        )),
        Change::Delete { .. } => delete_map_entry(text, map, entries, flow, index),
    }
}

fn delete_map_entry(
    text: &str,
    map: &YamlNode,
    entries: &[(YamlNode, YamlNode)],
    flow: bool,
    index: usize,
) -> WorkspaceResult<TextEdit> {
    if entries.len() == 1 {
        return Ok(TextEdit::replace(map.span.clone(), "{}"));
    }
    let (key, value) = &entries[index];
    if flow {
        let range = if index + 1 < entries.len() {
            key.span.start..entries[index + 1].0.span.start
        } else {
            entries[index - 1].1.span.end..value.span.end
        };
        Ok(TextEdit::replace(range, ""))
    } else {
        let start = line_start(text, key.span.start);
        let end = end_of_line(text, value.span.end);
        Ok(TextEdit::replace(start..end, ""))
    }
}

fn insert_map_entry(
    text: &str,
    map: &YamlNode,
    entries: &[(YamlNode, YamlNode)],
    flow: bool,
    key: &str,
    body: &str,
) -> WorkspaceResult<TextEdit> {
    let entry = format!("{}: {body}", scalar_string(key));
    if flow {
        if entries.is_empty() {
            return Ok(TextEdit::insert(map.span.start + 1, entry));
        }
        let at = entries
            .last()
            .map(|(_, v)| v.span.end)
            .unwrap_or(map.span.start + 1);
        return Ok(TextEdit::insert(at, format!(", {entry}")));
    }
    // A block map always has at least one entry.
    let indent = line_indent(text, entries[0].0.span.start);
    let last_end = entries.last().map(|(_, v)| v.span.end).unwrap_or(0);
    match text[last_end..].find('\n') {
        Some(offset) => Ok(TextEdit::insert(
            last_end + offset + 1,
            format!("{indent}{entry}\n"),
        )),
        None => Ok(TextEdit::insert(text.len(), format!("\n{indent}{entry}"))),
    }
}

fn seq_terminal(
    text: &str,
    seq: &YamlNode,
    items: &[YamlNode],
    flow: bool,
    index: usize,
    change: &Change,
) -> WorkspaceResult<TextEdit> {
    match change {
        Change::Modify { value, .. } => {
            let item = items.get(index).ok_or_else(|| {
                WorkspaceError::consistency(change.path().clone(), "index out of bounds")
            })?;
            Ok(TextEdit::replace(item.span.clone(), render_flow(value)))
        }
        Change::Add { value, .. } => {
            if index > items.len() {
                return Err(WorkspaceError::consistency(
                    change.path().clone(),
                    "index out of bounds",
                ));
            }
            insert_seq_item(text, seq, items, flow, index, &render_flow(value))
        }
        Change::Delete { .. } => {
            if index >= items.len() {
                return Err(WorkspaceError::consistency(
                    change.path().clone(),
                    "index out of bounds",
                ));
            }
            delete_seq_item(text, seq, items, flow, index)
        }
    }
}

fn insert_seq_item(
    text: &str,
    seq: &YamlNode,
    items: &[YamlNode],
    flow: bool,
    index: usize,
    body: &str,
) -> WorkspaceResult<TextEdit> {
    if flow {
        if items.is_empty() {
            return Ok(TextEdit::insert(seq.span.start + 1, body.to_string()));
        }
        if index == items.len() {
            let at = items.last().map(|n| n.span.end).unwrap_or(seq.span.start + 1);
            return Ok(TextEdit::insert(at, format!(", {body}")));
        }
        return Ok(TextEdit::insert(
            items[index].span.start,
            format!("{body}, "),
        ));
    }
    // A block sequence always has at least one item; empty ones parse as
    // flow `[]`.
    let indent = line_indent(text, items[0].span.start);
    if index == items.len() {
        let last_end = items.last().map(|n| n.span.end).unwrap_or(0);
        return match text[last_end..].find('\n') {
            Some(offset) => Ok(TextEdit::insert(
                last_end + offset + 1,
                format!("{indent}- {body}\n"),
            )),
            None => Ok(TextEdit::insert(text.len(), format!("\n{indent}- {body}"))),
        };
    }
    let at = line_start(text, items[index].span.start);
    Ok(TextEdit::insert(at, format!("{indent}- {body}\n")))
}

fn delete_seq_item(
    text: &str,
    seq: &YamlNode,
    items: &[YamlNode],
    flow: bool,
    index: usize,
) -> WorkspaceResult<TextEdit> {
    if items.len() == 1 {
        return Ok(TextEdit::replace(seq.span.clone(), "[]"));
    }
    let item = &items[index];
    if flow {
        let range = if index + 1 < items.len() {
            item.span.start..items[index + 1].span.start
        } else {
            items[index - 1].span.end..item.span.end
        };
        Ok(TextEdit::replace(range, ""))
    } else {
        let start = line_start(text, item.span.start);
        let end = end_of_line(text, item.span.end);
        Ok(TextEdit::replace(start..end, ""))
    }
}

fn line_start(text: &str, at: usize) -> usize {
    text[..at].rfind('\n').map(|i| i + 1).unwrap_or(0)
}

/// One past the newline ending the line that contains `at`.
fn end_of_line(text: &str, at: usize) -> usize {
    text[at..]
        .find('\n')
        .map(|i| at + i + 1)
        .unwrap_or(text.len())
}
