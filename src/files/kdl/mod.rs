//! KDL workspace files.
//!
//! The on-disk shape is node based: a `version 0` marker, `project "name"`
//! nodes carrying `target "name"` nodes, which in turn carry `options` and
//! `configuration "name"` blocks. Projects may `extends` one another;
//! reading materializes the effective view by walking the chain (cycles are
//! detected by name), while `(abstract)` projects exist only to be extended.
//! Documents may `import` sibling files; the set is expanded up front and
//! every change is routed back to the document that owns the affected node.

pub(crate) mod jik;
mod patch;

use async_trait::async_trait;
use kdl::{KdlDocument, KdlEntry, KdlNode};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use super::FileHandle;
use crate::error::{WorkspaceError, WorkspaceResult};
use crate::host::WorkspaceHost;
use crate::tracker::Change;
use crate::value::{JsonObject, JsonValue};

use jik::{
    child_nodes, entry_json, has_tag, merged_node_value, ABSTRACT_TAG, OVERWRITE_TAG,
};

pub(crate) const PROJECT_NODE: &str = "project";
pub(crate) const TARGET_NODE: &str = "target";
pub(crate) const CONFIGURATION_NODE: &str = "configuration";
pub(crate) const IMPORT_NODE: &str = "import";
pub(crate) const VERSION_NODE: &str = "version";
pub(crate) const EXTENDS_PROP: &str = "extends";

/// Handle for a KDL configuration document (plus its imports).
pub struct KdlFileHandle {
    host: Arc<dyn WorkspaceHost>,
    path: PathBuf,
}

impl KdlFileHandle {
    pub fn new(host: Arc<dyn WorkspaceHost>, path: impl Into<PathBuf>) -> Self {
        Self {
            host,
            path: path.into(),
        }
    }

    async fn load(&self) -> WorkspaceResult<DocumentSet> {
        let mut docs = Vec::new();
        let mut queue = VecDeque::new();
        let mut seen = HashSet::new();
        queue.push_back(self.path.clone());
        while let Some(path) = queue.pop_front() {
            if !seen.insert(path.clone()) {
                continue;
            }
            let text = self.host.read(&path).await?;
            let document: KdlDocument = text.parse().map_err(|e: kdl::KdlError| {
                WorkspaceError::invalid(format!("KDL parse error: {e}")).with_file(&path)
            })?;
            let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
            for node in document.nodes() {
                if node.name().value() != IMPORT_NODE {
                    continue;
                }
                let target = node
                    .entries()
                    .iter()
                    .find(|e| e.name().is_none())
                    .and_then(|e| e.value().as_string())
                    .ok_or_else(|| {
                        WorkspaceError::invalid("import requires a file path argument")
                            .with_file(&path)
                    })?;
                queue.push_back(base.join(target));
            }
            docs.push(SourceDocument {
                path,
                document,
                dirty: false,
            });
        }
        Ok(DocumentSet { docs })
    }
}

#[async_trait]
impl FileHandle for KdlFileHandle {
    async fn read(&self) -> WorkspaceResult<JsonValue> {
        let set = self.load().await?;
        materialize(&set).map_err(|e| e.with_file(&self.path))
    }

    async fn write(&self, value: &JsonValue) -> WorkspaceResult<()> {
        let Some(object) = value.as_object() else {
            return Err(WorkspaceError::invalid("Configuration must be an object"));
        };
        let document = patch::build_document(object)?;
        let mut text = document.to_string();
        if !text.ends_with('\n') {
            text.push('\n');
        }
        self.host.write(&self.path, &text).await
    }

    async fn apply_changes(&self, changes: &[Change]) -> WorkspaceResult<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut set = self.load().await?;
        for change in changes {
            debug!(path = %change.path(), kind = change.kind(), "applying change to {}", self.path.display());
            patch::apply_change(&mut set, change)?;
        }
        for doc in &set.docs {
            if !doc.dirty {
                continue;
            }
            let mut text = doc.document.to_string();
            if !text.ends_with('\n') {
                text.push('\n');
            }
            self.host.write(&doc.path, &text).await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Document set
// ---------------------------------------------------------------------------

pub(crate) struct SourceDocument {
    pub path: PathBuf,
    pub document: KdlDocument,
    pub dirty: bool,
}

pub(crate) struct DocumentSet {
    /// The entry document first, imports after it in discovery order.
    pub docs: Vec<SourceDocument>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProjectRef {
    pub doc: usize,
    pub index: usize,
}

pub(crate) fn node_name_arg(node: &KdlNode) -> Option<&str> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
}

pub(crate) fn property<'a>(node: &'a KdlNode, key: &str) -> Option<&'a KdlEntry> {
    node.entries()
        .iter()
        .find(|e| e.name().map(|n| n.value()) == Some(key))
}

/// Every project node across the document set, keyed by name, in document
/// order.
pub(crate) fn project_index(set: &DocumentSet) -> WorkspaceResult<Vec<(String, ProjectRef)>> {
    let mut projects: Vec<(String, ProjectRef)> = Vec::new();
    for (doc, source) in set.docs.iter().enumerate() {
        for (index, node) in source.document.nodes().iter().enumerate() {
            if node.name().value() != PROJECT_NODE {
                continue;
            }
            let name = node_name_arg(node).ok_or_else(|| {
                WorkspaceError::invalid("project node requires a name argument")
            })?;
            if projects.iter().any(|(existing, _)| existing == name) {
                return Err(WorkspaceError::invalid(format!(
                    "duplicate project {name:?}"
                )));
            }
            projects.push((name.to_string(), ProjectRef { doc, index }));
        }
    }
    Ok(projects)
}

pub(crate) fn project_node<'a>(set: &'a DocumentSet, r: ProjectRef) -> &'a KdlNode {
    &set.docs[r.doc].document.nodes()[r.index]
}

// ---------------------------------------------------------------------------
// Materialization
// ---------------------------------------------------------------------------

/// The effective JSON view of the whole document set: the version marker and
/// every concrete (non-abstract) project, flattened along its `extends`
/// chain.
pub(crate) fn materialize(set: &DocumentSet) -> WorkspaceResult<JsonValue> {
    let projects = project_index(set)?;
    let mut root = JsonObject::new();
    if let Some(version) = set.docs[0].document.get(VERSION_NODE) {
        if let Some(entry) = version.entries().iter().find(|e| e.name().is_none()) {
            root.insert(VERSION_NODE.to_string(), entry_json(entry, None));
        }
    }
    let mut out = JsonObject::new();
    for (name, r) in &projects {
        let node = project_node(set, *r);
        if has_tag(node, ABSTRACT_TAG) {
            continue;
        }
        let mut chain = Vec::new();
        out.insert(
            name.clone(),
            effective_project(set, &projects, name, &mut chain)?,
        );
    }
    root.insert("projects".to_string(), JsonValue::Object(out));
    Ok(JsonValue::Object(root))
}

/// Flattened value of one project, recursing through `extends`. `chain`
/// carries the names already being resolved; revisiting one is a cycle.
pub(crate) fn effective_project(
    set: &DocumentSet,
    projects: &[(String, ProjectRef)],
    name: &str,
    chain: &mut Vec<String>,
) -> WorkspaceResult<JsonValue> {
    if chain.iter().any(|seen| seen == name) {
        chain.push(name.to_string());
        return Err(WorkspaceError::invalid(format!(
            "cyclic project inheritance: {}",
            chain.join(" -> ")
        )));
    }
    chain.push(name.to_string());

    let r = projects
        .iter()
        .find(|(candidate, _)| candidate == name)
        .map(|(_, r)| *r)
        .ok_or_else(|| WorkspaceError::invalid(format!("unknown project {name:?}")))?;
    let node = project_node(set, r);

    let base = match property(node, EXTENDS_PROP).and_then(|e| e.value().as_string()) {
        Some(parent) => Some(effective_project(set, projects, parent, chain)?),
        None => None,
    };
    let value = project_value(node, base.as_ref())?;
    chain.pop();
    Ok(value)
}

fn project_value(node: &KdlNode, base: Option<&JsonValue>) -> WorkspaceResult<JsonValue> {
    let base_object = if has_tag(node, OVERWRITE_TAG) {
        None
    } else {
        base.and_then(JsonValue::as_object)
    };

    let own_root = property(node, "root").and_then(|e| e.value().as_string());
    let root = own_root.or_else(|| {
        base_object
            .and_then(|o| o.get("root"))
            .and_then(JsonValue::as_str)
    });

    let mut object = JsonObject::new();
    for entry in node.entries() {
        let Some(key) = entry.name().map(|n| n.value()) else {
            continue; // the name argument
        };
        if key == EXTENDS_PROP {
            continue;
        }
        object.insert(key.to_string(), entry_json(entry, root));
    }

    let mut targets = JsonObject::new();
    let base_targets = base_object
        .and_then(|o| o.get("targets"))
        .and_then(JsonValue::as_object);
    for child in child_nodes(node) {
        match child.name().value() {
            TARGET_NODE => {
                let target = node_name_arg(child).ok_or_else(|| {
                    WorkspaceError::invalid("target node requires a name argument")
                })?;
                if is_named_deletion_marker(child) {
                    continue;
                }
                let base_target = base_targets.and_then(|t| t.get(target));
                targets.insert(target.to_string(), target_value(child, base_target, root)?);
            }
            key => {
                if jik::is_deletion_marker(child) {
                    continue;
                }
                let child_base = base_object.and_then(|o| o.get(key));
                object.insert(
                    key.to_string(),
                    merged_node_value(child, child_base, root)?,
                );
            }
        }
    }
    if let Some(base_targets) = base_targets {
        for (name, value) in base_targets {
            if !targets.contains_key(name) && !is_deleted_named(node, TARGET_NODE, name) {
                targets.insert(name.clone(), value.clone());
            }
        }
    }
    if !targets.is_empty() || base_targets.is_some() {
        object.insert("targets".to_string(), JsonValue::Object(targets));
    }

    if let Some(base_object) = base_object {
        for (key, value) in base_object {
            if key == "targets" || object.contains_key(key) || is_deleted_generic(node, key) {
                continue;
            }
            object.insert(key.clone(), value.clone());
        }
    }
    Ok(JsonValue::Object(object))
}

fn target_value(
    node: &KdlNode,
    base: Option<&JsonValue>,
    root: Option<&str>,
) -> WorkspaceResult<JsonValue> {
    let base_object = if has_tag(node, OVERWRITE_TAG) {
        None
    } else {
        base.and_then(JsonValue::as_object)
    };

    let mut object = JsonObject::new();
    for entry in node.entries() {
        let Some(key) = entry.name().map(|n| n.value()) else {
            continue;
        };
        object.insert(key.to_string(), entry_json(entry, root));
    }

    let mut configurations = JsonObject::new();
    let base_configurations = base_object
        .and_then(|o| o.get("configurations"))
        .and_then(JsonValue::as_object);
    for child in child_nodes(node) {
        match child.name().value() {
            CONFIGURATION_NODE => {
                let configuration = node_name_arg(child).ok_or_else(|| {
                    WorkspaceError::invalid("configuration node requires a name argument")
                })?;
                if is_named_deletion_marker(child) {
                    continue;
                }
                let base_configuration = base_configurations.and_then(|c| c.get(configuration));
                configurations.insert(
                    configuration.to_string(),
                    named_body_value(child, base_configuration, root)?,
                );
            }
            key => {
                if jik::is_deletion_marker(child) {
                    continue;
                }
                let child_base = base_object.and_then(|o| o.get(key));
                object.insert(
                    key.to_string(),
                    merged_node_value(child, child_base, root)?,
                );
            }
        }
    }
    if let Some(base_configurations) = base_configurations {
        for (name, value) in base_configurations {
            if !configurations.contains_key(name)
                && !is_deleted_named(node, CONFIGURATION_NODE, name)
            {
                configurations.insert(name.clone(), value.clone());
            }
        }
    }
    if !configurations.is_empty() || base_configurations.is_some() {
        object.insert("configurations".to_string(), JsonValue::Object(configurations));
    }

    if let Some(base_object) = base_object {
        for (key, value) in base_object {
            if key == "configurations" || object.contains_key(key) || is_deleted_generic(node, key)
            {
                continue;
            }
            object.insert(key.clone(), value.clone());
        }
    }
    Ok(JsonValue::Object(object))
}

/// Value of a named block (a `configuration` node): its content minus the
/// name argument, read as an object.
fn named_body_value(
    node: &KdlNode,
    base: Option<&JsonValue>,
    root: Option<&str>,
) -> WorkspaceResult<JsonValue> {
    let base_object = if has_tag(node, OVERWRITE_TAG) {
        None
    } else {
        base.and_then(JsonValue::as_object)
    };
    let mut object = JsonObject::new();
    for entry in node.entries() {
        let Some(key) = entry.name().map(|n| n.value()) else {
            continue;
        };
        object.insert(key.to_string(), entry_json(entry, root));
    }
    for child in child_nodes(node) {
        if jik::is_deletion_marker(child) {
            continue;
        }
        let key = child.name().value();
        let child_base = base_object.and_then(|o| o.get(key));
        object.insert(key.to_string(), merged_node_value(child, child_base, root)?);
    }
    if let Some(base_object) = base_object {
        for (key, value) in base_object {
            if !object.contains_key(key) && !is_deleted_generic(node, key) {
                object.insert(key.clone(), value.clone());
            }
        }
    }
    Ok(JsonValue::Object(object))
}

/// An `(overwrite)` node with just its name argument marks an inherited
/// named entry (target, configuration) as removed.
pub(crate) fn is_named_deletion_marker(node: &KdlNode) -> bool {
    has_tag(node, OVERWRITE_TAG)
        && node.entries().iter().filter(|e| e.name().is_some()).count() == 0
        && node.entries().len() == 1
        && child_nodes(node).is_empty()
}

fn is_deleted_named(parent: &KdlNode, kind: &str, name: &str) -> bool {
    child_nodes(parent).iter().any(|c| {
        c.name().value() == kind && node_name_arg(c) == Some(name) && is_named_deletion_marker(c)
    })
}

fn is_deleted_generic(parent: &KdlNode, key: &str) -> bool {
    child_nodes(parent)
        .iter()
        .any(|c| c.name().value() == key && jik::is_deletion_marker(c))
}
