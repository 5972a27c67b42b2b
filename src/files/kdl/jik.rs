//! JSON-in-KDL: the bidirectional mapping between KDL nodes and the JSON
//! value model.
//!
//! A node with only positional arguments is a primitive (one argument) or an
//! array of primitives (several). Properties and named children make an
//! object; children named `-` are array items. The `(array)` and `(object)`
//! type annotations disambiguate the empty and singleton cases. Inside an
//! array, a child named `super` splices in the inherited array's items, and
//! an `(overwrite)` annotation severs inheritance for the annotated subtree.

use kdl::{KdlEntry, KdlNode, KdlValue};

use crate::error::{InvalidConfigurationError, WorkspaceError, WorkspaceResult};
use crate::value::{JsonObject, JsonValue};

pub(crate) const ARRAY_TAG: &str = "array";
pub(crate) const OBJECT_TAG: &str = "object";
pub(crate) const OVERWRITE_TAG: &str = "overwrite";
pub(crate) const ABSTRACT_TAG: &str = "abstract";
pub(crate) const PROJECT_RELATIVE_TAG: &str = "project-relative";

pub(crate) const ITEM_NAME: &str = "-";
pub(crate) const SUPER_NAME: &str = "super";

pub(crate) fn node_tag(node: &KdlNode) -> Option<&str> {
    node.ty().map(|t| t.value())
}

pub(crate) fn has_tag(node: &KdlNode, tag: &str) -> bool {
    node_tag(node) == Some(tag)
}

/// Leaf conversion of a KDL literal. A `(project-relative)` annotation on a
/// string resolves it against the owning project's root.
pub(crate) fn entry_json(entry: &KdlEntry, project_root: Option<&str>) -> JsonValue {
    let value = kdl_to_json(entry.value());
    if entry.ty().map(|t| t.value()) == Some(PROJECT_RELATIVE_TAG) {
        if let (JsonValue::String(path), Some(root)) = (&value, project_root) {
            return JsonValue::String(join_project_path(root, path));
        }
    }
    value
}

pub(crate) fn join_project_path(root: &str, path: &str) -> String {
    if root.is_empty() {
        path.to_string()
    } else {
        format!("{}/{path}", root.trim_end_matches('/'))
    }
}

pub(crate) fn kdl_to_json(value: &KdlValue) -> JsonValue {
    if value.is_null() {
        JsonValue::Null
    } else if let Some(b) = value.as_bool() {
        JsonValue::Bool(b)
    } else if let Some(s) = value.as_string() {
        JsonValue::String(s.to_string())
    } else if let Some(i) = value.as_i64() {
        JsonValue::Number(i.into())
    } else if let Some(f) = value.as_f64() {
        serde_json::Number::from_f64(f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null)
    } else {
        JsonValue::Null
    }
}

/// KDL literal for a primitive JSON value. Containers have no literal form;
/// callers route them through [`set_node_value`].
pub(crate) fn json_to_kdl(value: &JsonValue) -> Option<KdlValue> {
    match value {
        JsonValue::Null => Some(KdlValue::Null),
        JsonValue::Bool(b) => Some((*b).into()),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.into())
            } else {
                n.as_f64().map(KdlValue::from)
            }
        }
        JsonValue::String(s) => Some(s.clone().into()),
        JsonValue::Array(_) | JsonValue::Object(_) => None,
    }
}

pub(crate) fn is_primitive(value: &JsonValue) -> bool {
    !matches!(value, JsonValue::Array(_) | JsonValue::Object(_))
}

fn positional_entries(node: &KdlNode) -> impl Iterator<Item = &KdlEntry> {
    node.entries().iter().filter(|e| e.name().is_none())
}

fn property_entries(node: &KdlNode) -> impl Iterator<Item = (&str, &KdlEntry)> {
    node.entries()
        .iter()
        .filter_map(|e| e.name().map(|n| (n.value(), e)))
}

pub(crate) fn child_nodes(node: &KdlNode) -> &[KdlNode] {
    node.children().map(|d| d.nodes()).unwrap_or(&[])
}

fn is_array_shaped(node: &KdlNode) -> bool {
    if has_tag(node, ARRAY_TAG) {
        return true;
    }
    let children = child_nodes(node);
    let has_items = children
        .iter()
        .any(|c| matches!(c.name().value(), ITEM_NAME | SUPER_NAME));
    if has_items {
        return children
            .iter()
            .all(|c| matches!(c.name().value(), ITEM_NAME | SUPER_NAME))
            && property_entries(node).next().is_none();
    }
    // Several positional arguments with nothing else is a primitive array.
    property_entries(node).next().is_none()
        && children.is_empty()
        && positional_entries(node).count() > 1
}

/// Convert a node's value, merging against the inherited `base` for the same
/// key. Objects merge per key, arrays honor `super` splices, primitives
/// shadow. An `(overwrite)` annotation drops `base` entirely; an empty
/// overwrite node is a deletion marker and callers treat its key as absent.
pub(crate) fn merged_node_value(
    node: &KdlNode,
    base: Option<&JsonValue>,
    root: Option<&str>,
) -> WorkspaceResult<JsonValue> {
    let base = if has_tag(node, OVERWRITE_TAG) {
        None
    } else {
        base
    };

    if is_array_shaped(node) {
        let base_items = base.and_then(JsonValue::as_array).map(|a| a.as_slice());
        return array_value(node, base_items, root);
    }

    let children = child_nodes(node);
    let has_props = property_entries(node).next().is_some();
    let has_named_children = children.iter().any(|c| c.name().value() != ITEM_NAME);

    if has_tag(node, OBJECT_TAG) || has_props || has_named_children {
        let mut object = JsonObject::new();
        for (key, entry) in property_entries(node) {
            if object
                .insert(key.to_string(), entry_json(entry, root))
                .is_some()
            {
                return Err(duplicate_key(key));
            }
        }
        let base_object = base.and_then(JsonValue::as_object);
        for child in children {
            let key = child.name().value();
            let child_base = base_object.and_then(|o| o.get(key));
            if is_deletion_marker(child) {
                continue;
            }
            let value = merged_node_value(child, child_base, root)?;
            if object.insert(key.to_string(), value).is_some() {
                return Err(duplicate_key(key));
            }
        }
        if let Some(base_object) = base_object {
            for (key, value) in base_object {
                if !object.contains_key(key) && !is_deleted_key(node, key) {
                    object.insert(key.clone(), value.clone());
                }
            }
        }
        return Ok(JsonValue::Object(object));
    }

    // Only positional arguments (or nothing at all).
    let args: Vec<JsonValue> = positional_entries(node)
        .map(|e| entry_json(e, root))
        .collect();
    match args.len() {
        0 => Ok(JsonValue::Null),
        1 => Ok(args.into_iter().next().unwrap_or(JsonValue::Null)),
        _ => Ok(JsonValue::Array(args)),
    }
}

/// An `(overwrite)` node with no content marks an inherited key as removed.
pub(crate) fn is_deletion_marker(node: &KdlNode) -> bool {
    has_tag(node, OVERWRITE_TAG) && node.entries().is_empty() && child_nodes(node).is_empty()
}

fn is_deleted_key(parent: &KdlNode, key: &str) -> bool {
    child_nodes(parent)
        .iter()
        .any(|c| c.name().value() == key && is_deletion_marker(c))
}

fn array_value(
    node: &KdlNode,
    base: Option<&[JsonValue]>,
    root: Option<&str>,
) -> WorkspaceResult<JsonValue> {
    let mut items: Vec<JsonValue> = positional_entries(node)
        .map(|e| entry_json(e, root))
        .collect();
    for child in child_nodes(node) {
        match child.name().value() {
            SUPER_NAME => {
                let Some(base) = base else {
                    return Err(WorkspaceError::invalid(
                        "`super` used in an array with nothing to inherit",
                    ));
                };
                items.extend(base.iter().cloned());
            }
            ITEM_NAME => items.push(merged_node_value(child, None, root)?),
            other => {
                return Err(WorkspaceError::invalid(format!(
                    "unexpected node {other:?} inside an array value"
                )))
            }
        }
    }
    Ok(JsonValue::Array(items))
}

/// Convert with no inheritance in scope.
pub(crate) fn node_value(node: &KdlNode) -> WorkspaceResult<JsonValue> {
    merged_node_value(node, None, None)
}

fn duplicate_key(key: &str) -> WorkspaceError {
    WorkspaceError::InvalidConfiguration(InvalidConfigurationError::new(format!(
        "duplicate key {key:?}"
    )))
}

// ---------------------------------------------------------------------------
// Synthesis
// ---------------------------------------------------------------------------

/// Rewrite `node` so that it represents `value`. The node's name and
/// surrounding trivia survive; entries, children and any type annotation are
/// rebuilt from scratch.
pub(crate) fn set_node_value(node: &mut KdlNode, value: &JsonValue) {
    let mut fresh = KdlNode::new(node.name().clone());
    // Keep positioning trivia from parsed nodes; fresh nodes stay without
    // trivia so the serializer applies its defaults.
    if let Some(leading) = node.leading() {
        fresh.set_leading(leading.to_string());
    }
    if let Some(trailing) = node.trailing() {
        fresh.set_trailing(trailing.to_string());
    }
    *node = fresh;

    match value {
        JsonValue::Array(items) => {
            if items.len() <= 1 {
                node.set_ty(ARRAY_TAG);
            }
            if items.iter().all(is_primitive) && !items.is_empty() {
                for item in items {
                    if let Some(literal) = json_to_kdl(item) {
                        node.entries_mut().push(KdlEntry::new(literal));
                    }
                }
            } else {
                for item in items {
                    node.ensure_children().nodes_mut().push(item_node(item));
                }
            }
        }
        JsonValue::Object(map) => {
            if map.is_empty() {
                node.set_ty(OBJECT_TAG);
            }
            for (key, member) in map {
                if let Some(literal) = json_to_kdl(member) {
                    node.entries_mut().push(KdlEntry::new_prop(key.clone(), literal));
                } else {
                    let mut child = KdlNode::new(key.clone());
                    set_node_value(&mut child, member);
                    node.ensure_children().nodes_mut().push(child);
                }
            }
        }
        primitive => {
            if let Some(literal) = json_to_kdl(primitive) {
                node.entries_mut().push(KdlEntry::new(literal));
            }
        }
    }
}

/// A `-` child representing one array item.
pub(crate) fn item_node(value: &JsonValue) -> KdlNode {
    let mut node = KdlNode::new(ITEM_NAME);
    set_node_value(&mut node, value);
    node
}

/// A fresh named child carrying `value`.
pub(crate) fn value_node(name: &str, value: &JsonValue) -> KdlNode {
    let mut node = KdlNode::new(name);
    set_node_value(&mut node, value);
    node
}
