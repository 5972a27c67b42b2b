//! YAML workspace files.
//!
//! Reading resolves aliases and `<<` merge keys into the JSON value model.
//! Change application goes through the span-preserving tree in [`ast`]: each
//! change rewrites only the byte range it implicates, so comments, anchors
//! and hand formatting survive. Editing through an alias never rewrites the
//! anchored original; the alias position is replaced by a merge-keyed map
//! that shadows just the touched properties.

pub(crate) mod ast;
mod patch;

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;
use yaml_rust2::scanner::TScalarStyle;

use super::FileHandle;
use crate::error::{WorkspaceError, WorkspaceResult};
use crate::host::WorkspaceHost;
use crate::tracker::Change;
use crate::value::{JsonObject, JsonValue};

use ast::{YamlKind, YamlNode, YamlTree};

/// Handle for a YAML configuration document.
pub struct YamlFileHandle {
    host: Arc<dyn WorkspaceHost>,
    path: PathBuf,
}

impl YamlFileHandle {
    pub fn new(host: Arc<dyn WorkspaceHost>, path: impl Into<PathBuf>) -> Self {
        Self {
            host,
            path: path.into(),
        }
    }
}

#[async_trait]
impl FileHandle for YamlFileHandle {
    async fn read(&self) -> WorkspaceResult<JsonValue> {
        let text = self.host.read(&self.path).await?;
        let tree = ast::parse_tree(&text)
            .map_err(|e| e.with_file(&self.path))?
            .ok_or_else(|| WorkspaceError::invalid("Configuration must be an object"))?;
        let value = resolve(&tree.root, &tree).map_err(|e| e.with_file(&self.path))?;
        if !value.is_object() {
            return Err(WorkspaceError::invalid("Configuration must be an object"));
        }
        Ok(value)
    }

    async fn write(&self, value: &JsonValue) -> WorkspaceResult<()> {
        let Some(object) = value.as_object() else {
            return Err(WorkspaceError::invalid("Configuration must be an object"));
        };
        self.host.write(&self.path, &emit_document(object)).await
    }

    async fn apply_changes(&self, changes: &[Change]) -> WorkspaceResult<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut text = self.host.read(&self.path).await?;
        for change in changes {
            debug!(path = %change.path(), kind = change.kind(), "applying change to {}", self.path.display());
            let tree = ast::parse_tree(&text)
                .map_err(|e| e.with_file(&self.path))?
                .ok_or_else(|| WorkspaceError::invalid("Configuration must be an object"))?;
            let edit = patch::edit_for_change(&text, &tree, change)?;
            text = edit.apply(&text);
        }
        self.host.write(&self.path, &text).await
    }
}

// ---------------------------------------------------------------------------
// Resolution into the JSON value model
// ---------------------------------------------------------------------------

/// Resolve a node to a JSON value, following aliases and applying `<<`
/// merge-key semantics (local keys win, earlier merge sources win over later
/// ones).
pub(crate) fn resolve(
    node: &YamlNode,
    tree: &YamlTree,
) -> Result<JsonValue, crate::error::InvalidConfigurationError> {
    use crate::error::InvalidConfigurationError;

    match &node.kind {
        YamlKind::Scalar { value, style } => Ok(scalar_to_json(value, *style)),
        YamlKind::Alias { name } => {
            let target = tree
                .anchored(name)
                .ok_or_else(|| InvalidConfigurationError::new(format!("unknown alias *{name}")))?;
            resolve(target, tree)
        }
        YamlKind::Seq { items, .. } => {
            let mut array = Vec::with_capacity(items.len());
            for item in items {
                array.push(resolve(item, tree)?);
            }
            Ok(JsonValue::Array(array))
        }
        YamlKind::Map { entries, .. } => {
            let mut merged = JsonObject::new();
            let mut local = JsonObject::new();
            for (key, value) in entries {
                if key.is_merge_key() {
                    for source in merge_sources(value) {
                        let JsonValue::Object(map) = resolve(source, tree)? else {
                            return Err(InvalidConfigurationError::new(
                                "merge key value must resolve to a mapping",
                            ));
                        };
                        for (k, v) in map {
                            // Earlier merge sources take precedence.
                            merged.entry(k).or_insert(v);
                        }
                    }
                    continue;
                }
                let Some(key) = key.scalar_value() else {
                    return Err(InvalidConfigurationError::new(
                        "mapping keys must be scalars",
                    ));
                };
                if local.insert(key.to_string(), resolve(value, tree)?).is_some() {
                    return Err(InvalidConfigurationError::new(format!(
                        "duplicate key {key:?}"
                    )));
                }
            }
            for (k, v) in local {
                merged.insert(k, v);
            }
            Ok(JsonValue::Object(merged))
        }
    }
}

/// The mapping nodes contributed by a merge key value: a single node, or
/// each element of a sequence in order.
pub(crate) fn merge_sources(value: &YamlNode) -> Vec<&YamlNode> {
    match &value.kind {
        YamlKind::Seq { items, .. } => items.iter().collect(),
        _ => vec![value],
    }
}

fn scalar_to_json(value: &str, style: TScalarStyle) -> JsonValue {
    if style != TScalarStyle::Plain {
        return JsonValue::String(value.to_string());
    }
    match value {
        "" | "~" | "null" | "Null" | "NULL" => return JsonValue::Null,
        "true" | "True" | "TRUE" => return JsonValue::Bool(true),
        "false" | "False" | "FALSE" => return JsonValue::Bool(false),
        _ => {}
    }
    if let Ok(i) = value.parse::<i64>() {
        return JsonValue::Number(i.into());
    }
    if looks_numeric(value) {
        if let Ok(f) = value.parse::<f64>() {
            if let Some(n) = serde_json::Number::from_f64(f) {
                return JsonValue::Number(n);
            }
        }
    }
    JsonValue::String(value.to_string())
}

/// Guards the float fallback: `parse::<f64>` accepts forms like `inf` that
/// YAML plain scalars should keep as strings.
fn looks_numeric(value: &str) -> bool {
    value
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'))
        && value.chars().any(|c| c.is_ascii_digit())
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

/// Serialize a full document in block style.
pub(crate) fn emit_document(object: &JsonObject) -> String {
    let mut out = String::new();
    emit_map(object, 0, &mut out);
    if out.is_empty() {
        out.push_str("{}\n");
    }
    out
}

fn emit_map(object: &JsonObject, indent: usize, out: &mut String) {
    let pad = " ".repeat(indent);
    for (key, value) in object {
        out.push_str(&pad);
        out.push_str(&scalar_string(key));
        out.push(':');
        match value {
            JsonValue::Object(map) if !map.is_empty() => {
                out.push('\n');
                emit_map(map, indent + 2, out);
            }
            JsonValue::Array(items) if !items.is_empty() => {
                out.push('\n');
                let item_pad = " ".repeat(indent + 2);
                for item in items {
                    out.push_str(&item_pad);
                    out.push_str("- ");
                    out.push_str(&render_flow(item));
                    out.push('\n');
                }
            }
            other => {
                out.push(' ');
                out.push_str(&render_flow(other));
                out.push('\n');
            }
        }
    }
}

/// Flow-style rendering, used for values synthesized by the patcher and for
/// leaf positions of the block emitter.
pub(crate) fn render_flow(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => "null".to_string(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::String(s) => scalar_string(s),
        JsonValue::Array(items) => {
            let rendered: Vec<String> = items.iter().map(render_flow).collect();
            format!("[{}]", rendered.join(", "))
        }
        JsonValue::Object(map) => {
            if map.is_empty() {
                return "{}".to_string();
            }
            let rendered: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", scalar_string(k), render_flow(v)))
                .collect();
            format!("{{{}}}", rendered.join(", "))
        }
    }
}

/// A string scalar, plain when safe, double-quoted otherwise.
pub(crate) fn scalar_string(s: &str) -> String {
    if is_plain_safe(s) {
        s.to_string()
    } else {
        // YAML double-quoted scalars accept JSON string escapes.
        serde_json::to_string(s).unwrap_or_else(|_| format!("{s:?}"))
    }
}

fn is_plain_safe(s: &str) -> bool {
    if s.is_empty() {
        return false;
    }
    if matches!(
        s,
        "null" | "Null" | "NULL" | "~" | "true" | "True" | "TRUE" | "false" | "False" | "FALSE"
    ) {
        return false;
    }
    if s.parse::<f64>().is_ok() {
        return false;
    }
    let mut chars = s.chars();
    let first = chars.next().unwrap_or(' ');
    if !(first.is_alphanumeric() || matches!(first, '_' | '/' | '.')) {
        return false;
    }
    s.chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '_' | '/' | '.' | '-' | ' '))
        && !s.ends_with(' ')
        && !s.contains("  ")
}
