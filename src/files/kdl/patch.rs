//! Change application onto a KDL document set.
//!
//! Every change is routed to the node that owns the affected value. When a
//! value only exists through the `extends` chain, the owning parent node is
//! never mutated: the change materializes a local shadow instead, either a
//! minimal plain node that keeps merging with the base, or an `(overwrite)`
//! annotated node when the base must be severed (whole-value replacement and
//! deletions). Array edits try incremental argument and child-node splices
//! first and fall back to inlining the effective array, which also removes
//! any `super` splice marker.

use kdl::{KdlDocument, KdlEntry, KdlNode};

use super::jik::{
    self, has_tag, is_primitive, item_node, json_to_kdl, merged_node_value, node_value,
    value_node, OVERWRITE_TAG, PROJECT_RELATIVE_TAG, SUPER_NAME,
};
use super::{
    effective_project, is_named_deletion_marker, node_name_arg, project_index, property,
    DocumentSet, ProjectRef, CONFIGURATION_NODE, EXTENDS_PROP, IMPORT_NODE, PROJECT_NODE,
    TARGET_NODE, VERSION_NODE,
};
use crate::error::{WorkspaceError, WorkspaceResult};
use crate::tracker::Change;
use crate::value::{JsonObject, JsonValue, PathSegment};

pub(crate) fn apply_change(set: &mut DocumentSet, change: &Change) -> WorkspaceResult<()> {
    let segments = change.path().segments().to_vec();
    match segments.split_first() {
        None => replace_root(set, change),
        Some((PathSegment::Key(key), rest)) if key == "projects" => {
            projects_change(set, rest, change)
        }
        Some((PathSegment::Key(key), rest)) => top_level_change(set, key, rest, change),
        Some((PathSegment::Index(_), _)) => Err(consistency(change, "document root is an object")),
    }
}

fn consistency(change: &Change, message: &str) -> WorkspaceError {
    WorkspaceError::consistency(change.path().clone(), message)
}

/// Serialize a full raw object as a fresh document: `version`, then project
/// nodes, then any remaining top-level keys.
pub(crate) fn build_document(object: &JsonObject) -> WorkspaceResult<KdlDocument> {
    let mut doc = KdlDocument::new();
    if let Some(version) = object.get(VERSION_NODE) {
        let mut node = KdlNode::new(VERSION_NODE);
        if let Some(literal) = json_to_kdl(version) {
            node.entries_mut().push(KdlEntry::new(literal));
        }
        doc.nodes_mut().push(node);
    }
    for (key, value) in object {
        if key == VERSION_NODE {
            continue;
        }
        if key == "projects" {
            let projects = value.as_object().ok_or_else(|| {
                WorkspaceError::invalid("projects must be an object keyed by name")
            })?;
            for (name, project) in projects {
                let body = project.as_object().ok_or_else(|| {
                    WorkspaceError::invalid(format!("project {name:?} must be an object"))
                })?;
                doc.nodes_mut().push(project_node_from(name, body)?);
            }
        } else {
            doc.nodes_mut().push(value_node(key, value));
        }
    }
    Ok(doc)
}

fn replace_root(set: &mut DocumentSet, change: &Change) -> WorkspaceResult<()> {
    let Some(JsonValue::Object(map)) = change.new_value() else {
        return Err(consistency(
            change,
            "the document root can only be replaced by an object",
        ));
    };
    let mut fresh = build_document(map)?;
    // Imports stay; their project nodes are superseded below.
    let imports: Vec<KdlNode> = set.docs[0]
        .document
        .nodes()
        .iter()
        .filter(|n| n.name().value() == IMPORT_NODE)
        .cloned()
        .collect();
    for import in imports.into_iter().rev() {
        fresh.nodes_mut().insert(0, import);
    }
    set.docs[0].document = fresh;
    set.docs[0].dirty = true;
    for source in set.docs.iter_mut().skip(1) {
        let before = source.document.nodes().len();
        source
            .document
            .nodes_mut()
            .retain(|n| n.name().value() != PROJECT_NODE);
        if source.document.nodes().len() != before {
            source.dirty = true;
        }
    }
    Ok(())
}

/// A change to a top-level key other than `projects`, applied to the entry
/// document.
fn top_level_change(
    set: &mut DocumentSet,
    key: &str,
    rest: &[PathSegment],
    change: &Change,
) -> WorkspaceResult<()> {
    let doc = &mut set.docs[0].document;
    let position = doc
        .nodes()
        .iter()
        .position(|n| n.name().value() == key);
    if rest.is_empty() {
        match (change, position) {
            (Change::Add { value, .. }, None) => doc.nodes_mut().push(value_node(key, value)),
            (Change::Add { .. }, Some(_)) => {
                return Err(consistency(change, "value already exists at add path"))
            }
            (Change::Modify { value, .. }, Some(index)) => {
                jik::set_node_value(&mut doc.nodes_mut()[index], value)
            }
            (Change::Delete { .. }, Some(index)) => {
                doc.nodes_mut().remove(index);
            }
            _ => return Err(consistency(change, "path not found in document")),
        }
    } else {
        let index = position.ok_or_else(|| consistency(change, "path not found in document"))?;
        apply_value_change(&mut doc.nodes_mut()[index], rest, change, None, None)?;
    }
    set.docs[0].dirty = true;
    Ok(())
}

fn projects_change(
    set: &mut DocumentSet,
    rest: &[PathSegment],
    change: &Change,
) -> WorkspaceResult<()> {
    if rest.is_empty() {
        let map = match change.new_value() {
            Some(JsonValue::Object(map)) => map.clone(),
            Some(_) => return Err(consistency(change, "projects must be an object")),
            None => JsonObject::new(),
        };
        for source in set.docs.iter_mut() {
            let before = source.document.nodes().len();
            source
                .document
                .nodes_mut()
                .retain(|n| n.name().value() != PROJECT_NODE);
            if source.document.nodes().len() != before {
                source.dirty = true;
            }
        }
        for (name, value) in &map {
            let body = value
                .as_object()
                .ok_or_else(|| consistency(change, "project must be an object"))?;
            set.docs[0]
                .document
                .nodes_mut()
                .push(project_node_from(name, body)?);
        }
        set.docs[0].dirty = true;
        return Ok(());
    }
    let Some((PathSegment::Key(name), rest)) = rest.split_first() else {
        return Err(consistency(change, "projects are keyed by name"));
    };
    project_change(set, name, rest, change)
}

fn project_change(
    set: &mut DocumentSet,
    name: &str,
    rest: &[PathSegment],
    change: &Change,
) -> WorkspaceResult<()> {
    let projects = project_index(set)?;
    let existing = projects
        .iter()
        .find(|(candidate, _)| candidate == name)
        .map(|(_, r)| *r);

    if rest.is_empty() {
        return match (change, existing) {
            (Change::Add { value, .. }, None) => {
                let body = value
                    .as_object()
                    .ok_or_else(|| consistency(change, "project must be an object"))?;
                set.docs[0]
                    .document
                    .nodes_mut()
                    .push(project_node_from(name, body)?);
                set.docs[0].dirty = true;
                Ok(())
            }
            (Change::Add { .. }, Some(_)) => {
                Err(consistency(change, "value already exists at add path"))
            }
            (Change::Modify { value, .. }, Some(r)) => {
                let body = value
                    .as_object()
                    .ok_or_else(|| consistency(change, "project must be an object"))?;
                let fresh = project_node_from(name, body)?;
                replace_preserving_trivia(
                    &mut set.docs[r.doc].document.nodes_mut()[r.index],
                    fresh,
                );
                set.docs[r.doc].dirty = true;
                Ok(())
            }
            (Change::Delete { .. }, Some(r)) => {
                set.docs[r.doc].document.nodes_mut().remove(r.index);
                set.docs[r.doc].dirty = true;
                Ok(())
            }
            _ => Err(consistency(change, "project not found in document")),
        };
    }

    let r: ProjectRef =
        existing.ok_or_else(|| consistency(change, "project not found in document"))?;

    // The flattened view of the parent chain, captured before any mutation.
    let node = super::project_node(set, r);
    let parent = property(node, EXTENDS_PROP)
        .and_then(|e| e.value().as_string())
        .map(str::to_string);
    let base = match parent {
        Some(parent) => {
            let mut chain = vec![name.to_string()];
            Some(effective_project(set, &projects, &parent, &mut chain)?)
        }
        None => None,
    };
    let own_root = property(node, "root")
        .and_then(|e| e.value().as_string())
        .map(str::to_string);
    let root = own_root.or_else(|| {
        base.as_ref()
            .and_then(|b| b.get("root"))
            .and_then(JsonValue::as_str)
            .map(str::to_string)
    });

    let node = &mut set.docs[r.doc].document.nodes_mut()[r.index];
    apply_project_change(node, rest, change, base.as_ref(), root.as_deref())?;
    set.docs[r.doc].dirty = true;
    Ok(())
}

fn apply_project_change(
    node: &mut KdlNode,
    rest: &[PathSegment],
    change: &Change,
    base: Option<&JsonValue>,
    root: Option<&str>,
) -> WorkspaceResult<()> {
    let base_object = base.and_then(JsonValue::as_object);
    match rest.split_first() {
        Some((PathSegment::Key(key), tail)) if key == "targets" => {
            let base_targets = base_object
                .and_then(|o| o.get("targets"))
                .and_then(JsonValue::as_object);
            if tail.is_empty() {
                return replace_named_children(
                    node,
                    TARGET_NODE,
                    change,
                    base_targets,
                    target_node_from,
                );
            }
            let Some((PathSegment::Key(target), tail)) = tail.split_first() else {
                return Err(consistency(change, "targets are keyed by name"));
            };
            named_child_change(
                node,
                TARGET_NODE,
                target,
                tail,
                change,
                base_targets,
                root,
                target_node_from,
                apply_target_change,
            )
        }
        Some(_) => apply_value_change(node, rest, change, base, root),
        None => Err(consistency(change, "change path did not terminate")),
    }
}

fn apply_target_change(
    node: &mut KdlNode,
    rest: &[PathSegment],
    change: &Change,
    base: Option<&JsonValue>,
    root: Option<&str>,
) -> WorkspaceResult<()> {
    let base_object = base.and_then(JsonValue::as_object);
    match rest.split_first() {
        Some((PathSegment::Key(key), tail)) if key == "configurations" => {
            let base_configurations = base_object
                .and_then(|o| o.get("configurations"))
                .and_then(JsonValue::as_object);
            if tail.is_empty() {
                return replace_named_children(
                    node,
                    CONFIGURATION_NODE,
                    change,
                    base_configurations,
                    configuration_node_from,
                );
            }
            let Some((PathSegment::Key(configuration), tail)) = tail.split_first() else {
                return Err(consistency(change, "configurations are keyed by name"));
            };
            named_child_change(
                node,
                CONFIGURATION_NODE,
                configuration,
                tail,
                change,
                base_configurations,
                root,
                configuration_node_from,
                |node, rest, change, base, root| apply_value_change(node, rest, change, base, root),
            )
        }
        Some(_) => apply_value_change(node, rest, change, base, root),
        None => Err(consistency(change, "change path did not terminate")),
    }
}

/// Replace the whole set of named children of one kind (`target` or
/// `configuration`). Entries inherited from the base that are not part of
/// the new value get deletion markers.
fn replace_named_children(
    node: &mut KdlNode,
    kind: &str,
    change: &Change,
    base: Option<&JsonObject>,
    build: fn(&str, &JsonObject) -> WorkspaceResult<KdlNode>,
) -> WorkspaceResult<()> {
    let map = match change.new_value() {
        Some(JsonValue::Object(map)) => map.clone(),
        Some(_) => return Err(consistency(change, "expected an object value")),
        None => JsonObject::new(),
    };
    if let Some(children) = node.children_mut() {
        children.nodes_mut().retain(|c| c.name().value() != kind);
    }
    for (name, value) in &map {
        let body = value
            .as_object()
            .ok_or_else(|| consistency(change, "expected an object value"))?;
        let mut fresh = build(name, body)?;
        if base.map_or(false, |b| b.contains_key(name)) {
            fresh.set_ty(OVERWRITE_TAG);
        }
        node.ensure_children().nodes_mut().push(fresh);
    }
    if let Some(base) = base {
        for name in base.keys() {
            if !map.contains_key(name) {
                node.ensure_children()
                    .nodes_mut()
                    .push(named_marker(kind, name));
            }
        }
    }
    Ok(())
}

/// A change addressed at (or below) one named child, e.g.
/// `targets.build...` or `configurations.production...`.
#[allow(clippy::too_many_arguments)]
fn named_child_change(
    node: &mut KdlNode,
    kind: &str,
    name: &str,
    tail: &[PathSegment],
    change: &Change,
    base: Option<&JsonObject>,
    root: Option<&str>,
    build: fn(&str, &JsonObject) -> WorkspaceResult<KdlNode>,
    descend: impl Fn(
        &mut KdlNode,
        &[PathSegment],
        &Change,
        Option<&JsonValue>,
        Option<&str>,
    ) -> WorkspaceResult<()>,
) -> WorkspaceResult<()> {
    let base_entry = base.and_then(|b| b.get(name));
    let local = jik::child_nodes(node).iter().position(|c| {
        c.name().value() == kind
            && node_name_arg(c) == Some(name)
            && !is_named_deletion_marker(c)
    });

    if tail.is_empty() {
        return match (change, local) {
            (Change::Add { value, .. }, None) => {
                if base_entry.is_some() {
                    return Err(consistency(change, "value already exists at add path"));
                }
                let body = value
                    .as_object()
                    .ok_or_else(|| consistency(change, "expected an object value"))?;
                node.ensure_children().nodes_mut().push(build(name, body)?);
                Ok(())
            }
            (Change::Add { .. }, Some(_)) => {
                Err(consistency(change, "value already exists at add path"))
            }
            (Change::Modify { value, .. }, Some(index)) => {
                let body = value
                    .as_object()
                    .ok_or_else(|| consistency(change, "expected an object value"))?;
                let mut fresh = build(name, body)?;
                if base_entry.is_some() {
                    fresh.set_ty(OVERWRITE_TAG);
                }
                replace_preserving_trivia(&mut node.ensure_children().nodes_mut()[index], fresh);
                Ok(())
            }
            (Change::Modify { value, .. }, None) => {
                // Inherited only: append a synthetic overwrite node so the
                // parent definition stays untouched.
                if base_entry.is_none() {
                    return Err(consistency(change, "path not found in document"));
                }
                let body = value
                    .as_object()
                    .ok_or_else(|| consistency(change, "expected an object value"))?;
                let mut fresh = build(name, body)?;
                fresh.set_ty(OVERWRITE_TAG);
                node.ensure_children().nodes_mut().push(fresh);
                Ok(())
            }
            (Change::Delete { .. }, Some(index)) => {
                node.ensure_children().nodes_mut().remove(index);
                if base_entry.is_some() {
                    node.ensure_children()
                        .nodes_mut()
                        .push(named_marker(kind, name));
                }
                Ok(())
            }
            (Change::Delete { .. }, None) => {
                if base_entry.is_none() {
                    return Err(consistency(change, "path not found in document"));
                }
                node.ensure_children()
                    .nodes_mut()
                    .push(named_marker(kind, name));
                Ok(())
            }
        };
    }

    // Descending below the named child: make sure a local node exists. A
    // plain (untagged) local node keeps merging with the inherited one.
    let index = match local {
        Some(index) => index,
        None => {
            if base_entry.is_none() {
                return Err(consistency(change, "path not found in document"));
            }
            let mut shadow = KdlNode::new(kind);
            shadow
                .entries_mut()
                .push(KdlEntry::new(name.to_string()));
            node.ensure_children().nodes_mut().push(shadow);
            node.ensure_children().nodes().len() - 1
        }
    };
    descend(
        &mut node.ensure_children().nodes_mut()[index],
        tail,
        change,
        base_entry,
        root,
    )
}

// ---------------------------------------------------------------------------
// Generic value patching
// ---------------------------------------------------------------------------

/// Apply a change whose remaining path starts inside `node`'s object value.
/// `base` is the inherited value for the node itself.
fn apply_value_change(
    node: &mut KdlNode,
    rest: &[PathSegment],
    change: &Change,
    base: Option<&JsonValue>,
    root: Option<&str>,
) -> WorkspaceResult<()> {
    let base = if has_tag(node, OVERWRITE_TAG) {
        None
    } else {
        base
    };
    let Some((segment, tail)) = rest.split_first() else {
        return Err(consistency(change, "change path did not terminate"));
    };
    match segment {
        PathSegment::Index(index) => apply_index_change(node, *index, tail, change, base, root),
        PathSegment::Key(key) => {
            let base_object = base.and_then(JsonValue::as_object);
            let base_member = base_object.and_then(|o| o.get(key.as_str()));

            // A property entry?
            let entry_position = node
                .entries()
                .iter()
                .position(|e| e.name().map(|n| n.value()) == Some(key.as_str()));
            if let Some(position) = entry_position {
                if !tail.is_empty() {
                    return Err(consistency(
                        change,
                        "expected a container along the change path",
                    ));
                }
                return match change {
                    Change::Modify { value, .. } => {
                        replace_property(node, position, key, value, root);
                        Ok(())
                    }
                    Change::Delete { .. } => {
                        node.entries_mut().remove(position);
                        if base_member.is_some() {
                            push_deletion_marker(node, key);
                        }
                        Ok(())
                    }
                    Change::Add { .. } => {
                        Err(consistency(change, "value already exists at add path"))
                    }
                };
            }

            // A child node?
            let child_position = jik::child_nodes(node)
                .iter()
                .position(|c| c.name().value() == key.as_str() && !jik::is_deletion_marker(c));
            if let Some(position) = child_position {
                if tail.is_empty() {
                    return match change {
                        Change::Modify { value, .. } => {
                            let child = &mut node.ensure_children().nodes_mut()[position];
                            jik::set_node_value(child, value);
                            if base_member.map_or(false, JsonValue::is_object)
                                && value.is_object()
                            {
                                child.set_ty(OVERWRITE_TAG);
                            }
                            Ok(())
                        }
                        Change::Delete { .. } => {
                            node.ensure_children().nodes_mut().remove(position);
                            if base_member.is_some() {
                                push_deletion_marker(node, key);
                            }
                            Ok(())
                        }
                        Change::Add { .. } => {
                            Err(consistency(change, "value already exists at add path"))
                        }
                    };
                }
                return apply_value_change(
                    &mut node.ensure_children().nodes_mut()[position],
                    tail,
                    change,
                    base_member,
                    root,
                );
            }

            // Nothing local. An existing deletion marker means the key was
            // removed from the inherited view; a fresh add replaces it.
            let marker_position = jik::child_nodes(node)
                .iter()
                .position(|c| c.name().value() == key.as_str() && jik::is_deletion_marker(c));
            if tail.is_empty() {
                return match (change, base_member) {
                    (Change::Add { value, .. }, _) if marker_position.is_some() => {
                        if let Some(position) = marker_position {
                            node.ensure_children().nodes_mut().remove(position);
                        }
                        push_member(node, key, value);
                        Ok(())
                    }
                    (Change::Add { value, .. }, None) => {
                        push_member(node, key, value);
                        Ok(())
                    }
                    (Change::Add { .. }, Some(_)) => {
                        Err(consistency(change, "value already exists at add path"))
                    }
                    (Change::Modify { value, .. }, Some(inherited)) => {
                        if is_primitive(value) {
                            push_member(node, key, value);
                        } else {
                            let mut fresh = value_node(key, value);
                            if value.is_object() && inherited.is_object() {
                                fresh.set_ty(OVERWRITE_TAG);
                            }
                            node.ensure_children().nodes_mut().push(fresh);
                        }
                        Ok(())
                    }
                    (Change::Delete { .. }, Some(_)) => {
                        push_deletion_marker(node, key);
                        Ok(())
                    }
                    _ => Err(consistency(change, "path not found in document")),
                };
            }
            let inherited =
                base_member.ok_or_else(|| consistency(change, "path not found in document"))?;
            // Minimal local shadow; it fills in and merges with the base as
            // the recursion adds content to it.
            node.ensure_children()
                .nodes_mut()
                .push(KdlNode::new(key.as_str()));
            let position = node.ensure_children().nodes().len() - 1;
            apply_value_change(
                &mut node.ensure_children().nodes_mut()[position],
                tail,
                change,
                Some(inherited),
                root,
            )
        }
    }
}

/// An indexed change where `node` itself holds the array.
fn apply_index_change(
    node: &mut KdlNode,
    index: usize,
    tail: &[PathSegment],
    change: &Change,
    base: Option<&JsonValue>,
    root: Option<&str>,
) -> WorkspaceResult<()> {
    let base_items = base.and_then(JsonValue::as_array);

    // A bare local node shadowing an inherited array starts as a `super`
    // splice so the inherited items stay referenced, not copied.
    if base_items.is_some()
        && node.entries().is_empty()
        && jik::child_nodes(node).is_empty()
        && node.ty().is_none()
    {
        node.ensure_children()
            .nodes_mut()
            .push(KdlNode::new(SUPER_NAME));
    }

    let has_super = jik::child_nodes(node)
        .iter()
        .any(|c| c.name().value() == SUPER_NAME);
    if has_super {
        // Index positions are not stable across a splice; inline the
        // effective array and retry against the now fully local value.
        let merged = merged_node_value(node, base, root)?;
        jik::set_node_value(node, &merged);
        return apply_index_change(node, index, tail, change, None, root);
    }

    let arg_positions: Vec<usize> = node
        .entries()
        .iter()
        .enumerate()
        .filter_map(|(i, e)| e.name().is_none().then_some(i))
        .collect();
    let item_positions: Vec<usize> = jik::child_nodes(node)
        .iter()
        .enumerate()
        .filter_map(|(i, c)| (c.name().value() == jik::ITEM_NAME).then_some(i))
        .collect();
    let arg_count = arg_positions.len();
    let total = arg_count + item_positions.len();

    if !tail.is_empty() {
        if index < arg_count {
            return Err(consistency(
                change,
                "expected a container along the change path",
            ));
        }
        let position = item_positions
            .get(index - arg_count)
            .copied()
            .ok_or_else(|| consistency(change, "index out of bounds"))?;
        return apply_value_change(
            &mut node.ensure_children().nodes_mut()[position],
            tail,
            change,
            None,
            root,
        );
    }

    match change {
        Change::Modify { value, .. } => {
            if index < arg_count {
                if json_to_kdl(value).is_some() {
                    replace_argument(node, arg_positions[index], value, root);
                    return Ok(());
                }
                // A container value cannot live in an argument slot.
                return rewrite_array(node, change, |items| {
                    items[index] = value.clone();
                    Ok(())
                });
            }
            let position = item_positions
                .get(index - arg_count)
                .copied()
                .ok_or_else(|| consistency(change, "index out of bounds"))?;
            jik::set_node_value(&mut node.ensure_children().nodes_mut()[position], value);
            Ok(())
        }
        Change::Add { value, .. } => {
            if index > total {
                return Err(consistency(change, "index out of bounds"));
            }
            if index >= arg_count {
                let child_index = item_positions
                    .get(index - arg_count)
                    .copied()
                    .unwrap_or_else(|| jik::child_nodes(node).len());
                node.ensure_children()
                    .nodes_mut()
                    .insert(child_index, item_node(value));
                return Ok(());
            }
            if let Some(literal) = json_to_kdl(value) {
                node.entries_mut()
                    .insert(arg_positions[index], KdlEntry::new(literal));
                return Ok(());
            }
            rewrite_array(node, change, |items| {
                items.insert(index, value.clone());
                Ok(())
            })
        }
        Change::Delete { .. } => {
            if index < arg_count {
                node.entries_mut().remove(arg_positions[index]);
                return Ok(());
            }
            let position = item_positions
                .get(index - arg_count)
                .copied()
                .ok_or_else(|| consistency(change, "index out of bounds"))?;
            node.ensure_children().nodes_mut().remove(position);
            Ok(())
        }
    }
}

/// Fallback for array shapes the incremental strategies cannot express:
/// materialize the current value, mutate it, and rewrite the node as a
/// fully local array.
fn rewrite_array(
    node: &mut KdlNode,
    change: &Change,
    mutate: impl FnOnce(&mut Vec<JsonValue>) -> WorkspaceResult<()>,
) -> WorkspaceResult<()> {
    let JsonValue::Array(mut items) = node_value(node)? else {
        return Err(consistency(change, "expected an array value"));
    };
    mutate(&mut items)?;
    jik::set_node_value(node, &JsonValue::Array(items));
    Ok(())
}

// ---------------------------------------------------------------------------
// Entry and node construction
// ---------------------------------------------------------------------------

/// Replace a property value, keeping a `(project-relative)` annotation when
/// the new string still points inside the project.
fn replace_property(
    node: &mut KdlNode,
    position: usize,
    key: &str,
    value: &JsonValue,
    root: Option<&str>,
) {
    let relative = node.entries()[position].ty().map(|t| t.value()) == Some(PROJECT_RELATIVE_TAG);
    let Some(_) = json_to_kdl(value) else {
        // The property becomes a container; move it to a child node.
        node.entries_mut().remove(position);
        let fresh = value_node(key, value);
        node.ensure_children().nodes_mut().push(fresh);
        return;
    };
    node.entries_mut()[position] = literal_entry(Some(key), value, relative, root);
}

fn replace_argument(node: &mut KdlNode, position: usize, value: &JsonValue, root: Option<&str>) {
    let relative = node.entries()[position].ty().map(|t| t.value()) == Some(PROJECT_RELATIVE_TAG);
    node.entries_mut()[position] = literal_entry(None, value, relative, root);
}

fn literal_entry(
    key: Option<&str>,
    value: &JsonValue,
    relative: bool,
    root: Option<&str>,
) -> KdlEntry {
    if relative {
        if let (JsonValue::String(path), Some(root)) = (value, root) {
            let prefix = format!("{}/", root.trim_end_matches('/'));
            if let Some(stripped) = path.strip_prefix(&prefix) {
                let mut entry = match key {
                    Some(key) => KdlEntry::new_prop(key, stripped.to_string()),
                    None => KdlEntry::new(stripped.to_string()),
                };
                entry.set_ty(PROJECT_RELATIVE_TAG);
                return entry;
            }
        }
    }
    let literal = json_to_kdl(value).unwrap_or(kdl::KdlValue::Null);
    match key {
        Some(key) => KdlEntry::new_prop(key, literal),
        None => KdlEntry::new(literal),
    }
}

fn push_member(node: &mut KdlNode, key: &str, value: &JsonValue) {
    if let Some(literal) = json_to_kdl(value) {
        node.entries_mut().push(KdlEntry::new_prop(key, literal));
    } else {
        node.ensure_children().nodes_mut().push(value_node(key, value));
    }
}

fn push_deletion_marker(node: &mut KdlNode, key: &str) {
    let mut marker = KdlNode::new(key);
    marker.set_ty(OVERWRITE_TAG);
    node.ensure_children().nodes_mut().push(marker);
}

fn named_marker(kind: &str, name: &str) -> KdlNode {
    let mut marker = KdlNode::new(kind);
    marker.entries_mut().push(KdlEntry::new(name.to_string()));
    marker.set_ty(OVERWRITE_TAG);
    marker
}

fn replace_preserving_trivia(slot: &mut KdlNode, mut fresh: KdlNode) {
    if let Some(leading) = slot.leading() {
        fresh.set_leading(leading.to_string());
    }
    if let Some(trailing) = slot.trailing() {
        fresh.set_trailing(trailing.to_string());
    }
    *slot = fresh;
}

fn project_node_from(name: &str, body: &JsonObject) -> WorkspaceResult<KdlNode> {
    let mut node = KdlNode::new(PROJECT_NODE);
    node.entries_mut().push(KdlEntry::new(name.to_string()));
    for (key, value) in body {
        if key == "targets" {
            let targets = value
                .as_object()
                .ok_or_else(|| WorkspaceError::invalid("targets must be an object"))?;
            for (target, target_value) in targets {
                let target_body = target_value.as_object().ok_or_else(|| {
                    WorkspaceError::invalid(format!("target {target:?} must be an object"))
                })?;
                node.ensure_children()
                    .nodes_mut()
                    .push(target_node_from(target, target_body)?);
            }
        } else {
            push_member(&mut node, key, value);
        }
    }
    Ok(node)
}

fn target_node_from(name: &str, body: &JsonObject) -> WorkspaceResult<KdlNode> {
    let mut node = KdlNode::new(TARGET_NODE);
    node.entries_mut().push(KdlEntry::new(name.to_string()));
    for (key, value) in body {
        if key == "configurations" {
            let configurations = value
                .as_object()
                .ok_or_else(|| WorkspaceError::invalid("configurations must be an object"))?;
            for (configuration, configuration_value) in configurations {
                let configuration_body = configuration_value.as_object().ok_or_else(|| {
                    WorkspaceError::invalid(format!(
                        "configuration {configuration:?} must be an object"
                    ))
                })?;
                node.ensure_children()
                    .nodes_mut()
                    .push(configuration_node_from(configuration, configuration_body)?);
            }
        } else {
            push_member(&mut node, key, value);
        }
    }
    Ok(node)
}

fn configuration_node_from(name: &str, body: &JsonObject) -> WorkspaceResult<KdlNode> {
    let mut node = KdlNode::new(CONFIGURATION_NODE);
    node.entries_mut().push(KdlEntry::new(name.to_string()));
    for (key, value) in body {
        push_member(&mut node, key, value);
    }
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::super::{materialize, DocumentSet, SourceDocument};
    use super::*;
    use crate::json_path;
    use crate::value::JsonPath;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn set_from(text: &str) -> DocumentSet {
        DocumentSet {
            docs: vec![SourceDocument {
                path: "snuggery.kdl".into(),
                document: text.parse().expect("valid KDL"),
                dirty: false,
            }],
        }
    }

    fn apply(text: &str, change: Change) -> (String, JsonValue) {
        let mut set = set_from(text);
        apply_change(&mut set, &change).expect("change applies");
        let serialized = set.docs[0].document.to_string();
        let reparsed = set_from(&serialized);
        let value = materialize(&reparsed).expect("valid after patch");
        (serialized, value)
    }

    fn add(path: JsonPath, value: JsonValue) -> Change {
        Change::Add { path, value }
    }

    fn modify(path: JsonPath, old_value: JsonValue, value: JsonValue) -> Change {
        Change::Modify {
            path,
            value,
            old_value,
        }
    }

    fn delete(path: JsonPath, old_value: JsonValue) -> Change {
        Change::Delete { path, old_value }
    }

    const INHERITED: &str = r#"version 0
(abstract)project "base" {
    target "build" builder="tsc" {
        options {
            verbose false
            cache true
        }
    }
}
project "child" extends="base" root="apps/child"
"#;

    #[test]
    fn local_values_are_modified_in_place() {
        let text = "version 0\nproject \"app\" root=\"apps/app\" {\n    target \"build\" builder=\"tsc\"\n}\n";
        let (serialized, value) = apply(
            text,
            modify(
                json_path!("projects", "app", "targets", "build", "builder"),
                json!("tsc"),
                json!("swc"),
            ),
        );
        assert!(serialized.contains("builder=\"swc\""));
        assert_eq!(
            value["projects"]["app"]["targets"]["build"]["builder"],
            json!("swc")
        );
    }

    #[test]
    fn inherited_override_leaves_the_parent_untouched() {
        let (serialized, value) = apply(
            INHERITED,
            modify(
                json_path!("projects", "child", "targets", "build", "options", "verbose"),
                json!(false),
                json!(true),
            ),
        );
        // The base definition still reads `verbose false`.
        assert!(serialized.contains("verbose false"));
        assert_eq!(
            value["projects"]["child"]["targets"]["build"]["options"],
            json!({"verbose": true, "cache": true})
        );
        assert_eq!(
            value["projects"]["base"], JsonValue::Null,
            "abstract base stays out of the project set"
        );
    }

    #[test]
    fn deleting_an_inherited_target_appends_a_marker() {
        let (serialized, value) = apply(
            INHERITED,
            delete(
                json_path!("projects", "child", "targets", "build"),
                json!({"builder": "tsc", "options": {"verbose": false, "cache": true}}),
            ),
        );
        assert!(serialized.contains("(overwrite)target \"build\""));
        assert_eq!(
            value["projects"]["child"]["targets"],
            json!({}),
            "the inherited target no longer materializes"
        );
    }

    #[test]
    fn replacing_an_inherited_target_synthesizes_an_overwrite_node() {
        let (serialized, value) = apply(
            INHERITED,
            modify(
                json_path!("projects", "child", "targets", "build"),
                json!({"builder": "tsc", "options": {"verbose": false, "cache": true}}),
                json!({"builder": "swc"}),
            ),
        );
        assert!(serialized.contains("(overwrite)target \"build\""));
        assert_eq!(
            value["projects"]["child"]["targets"]["build"],
            json!({"builder": "swc"})
        );
    }

    #[test]
    fn deleting_an_inherited_nested_key_uses_a_deletion_marker() {
        let (serialized, value) = apply(
            INHERITED,
            delete(
                json_path!("projects", "child", "targets", "build", "options", "cache"),
                json!(true),
            ),
        );
        assert!(serialized.contains("(overwrite)cache"));
        assert_eq!(
            value["projects"]["child"]["targets"]["build"]["options"],
            json!({"verbose": false})
        );
    }

    const SUPER_SPLICE: &str = r#"version 0
(abstract)project "base" {
    target "build" builder="tsc" {
        options {
            tags "base-item"
        }
    }
}
project "child" extends="base" root="c" {
    target "build" {
        options {
            tags {
                super
                - "own-item"
            }
        }
    }
}
"#;

    #[test]
    fn incompatible_array_insert_inlines_the_super_splice() {
        let (serialized, value) = apply(
            SUPER_SPLICE,
            add(
                json_path!("projects", "child", "targets", "build", "options", "tags", 2),
                json!("inserted-item"),
            ),
        );
        assert!(!serialized.contains("super"), "the splice marker is severed");
        assert_eq!(
            value["projects"]["child"]["targets"]["build"]["options"]["tags"],
            json!(["base-item", "own-item", "inserted-item"])
        );
    }

    #[test]
    fn argument_arrays_are_edited_incrementally() {
        let text = "version 0\nproject \"app\" root=\"a\" {\n    target \"build\" builder=\"b\" {\n        options {\n            tags \"x\" \"y\"\n        }\n    }\n}\n";
        let (_, value) = apply(
            text,
            add(
                json_path!("projects", "app", "targets", "build", "options", "tags", 1),
                json!("mid"),
            ),
        );
        assert_eq!(
            value["projects"]["app"]["targets"]["build"]["options"]["tags"],
            json!(["x", "mid", "y"])
        );
        let (_, value) = apply(
            text,
            delete(
                json_path!("projects", "app", "targets", "build", "options", "tags", 0),
                json!("x"),
            ),
        );
        assert_eq!(
            value["projects"]["app"]["targets"]["build"]["options"]["tags"],
            json!(["y"])
        );
    }

    #[test]
    fn adding_a_project_appends_to_the_entry_document() {
        let text = "version 0\nproject \"app\" root=\"apps/app\"\n";
        let (serialized, value) = apply(
            text,
            add(
                json_path!("projects", "lib"),
                json!({"root": "libs/lib", "targets": {"build": {"builder": "tsc"}}}),
            ),
        );
        assert!(serialized.contains("project \"lib\""));
        assert_eq!(
            value["projects"]["lib"],
            json!({"root": "libs/lib", "targets": {"build": {"builder": "tsc"}}})
        );
    }

    #[test]
    fn version_can_be_modified() {
        let text = "version 0\n";
        let (serialized, value) = apply(text, modify(json_path!("version"), json!(0), json!(1)));
        assert!(serialized.contains("version 1"));
        assert_eq!(value["version"], json!(1));
    }

    #[test]
    fn project_relative_annotations_survive_modification() {
        let text = "version 0\nproject \"app\" root=\"apps/app\" {\n    target \"build\" builder=\"b\" {\n        options main=(project-relative)\"src/main.ts\"\n    }\n}\n";
        let (serialized, value) = apply(
            text,
            modify(
                json_path!("projects", "app", "targets", "build", "options", "main"),
                json!("apps/app/src/main.ts"),
                json!("apps/app/src/other.ts"),
            ),
        );
        assert!(serialized.contains("project-relative"));
        assert!(serialized.contains("\"src/other.ts\""));
        assert_eq!(
            value["projects"]["app"]["targets"]["build"]["options"]["main"],
            json!("apps/app/src/other.ts")
        );
    }

    #[test]
    fn adding_a_configuration_to_an_inherited_target_shadows_minimally() {
        let (serialized, value) = apply(
            INHERITED,
            add(
                json_path!(
                    "projects",
                    "child",
                    "targets",
                    "build",
                    "configurations",
                    "production"
                ),
                json!({"optimize": true}),
            ),
        );
        // The local shadow merges; the builder still comes from the base.
        assert!(!serialized.contains("(overwrite)target"));
        assert_eq!(
            value["projects"]["child"]["targets"]["build"]["builder"],
            json!("tsc")
        );
        assert_eq!(
            value["projects"]["child"]["targets"]["build"]["configurations"]["production"],
            json!({"optimize": true})
        );
    }

    #[test]
    fn missing_paths_are_consistency_failures() {
        let mut set = set_from("version 0\nproject \"app\" root=\"a\"\n");
        let err = apply_change(
            &mut set,
            &modify(
                json_path!("projects", "ghost", "root"),
                json!("x"),
                json!("y"),
            ),
        )
        .unwrap_err();
        assert!(matches!(err, WorkspaceError::PatchConsistency { .. }));
    }
}
