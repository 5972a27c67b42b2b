//! Schema adapters between on-disk documents and the uniform model.
//!
//! The uniform model is the Angular-flavoured shape: projects carry a
//! `targets` map, targets carry a `builder`, tooling defaults live under
//! `schematics`, and the `version` discriminator is stripped. Each adapter
//! validates its version on read, converts the raw document into the uniform
//! shape, and maps recorded change paths (plus any embedded values) back onto
//! the raw document on write.

use crate::error::{WorkspaceError, WorkspaceResult};
use crate::tracker::Change;
use crate::value::{JsonObject, JsonPath, JsonValue, PathSegment};

pub(crate) trait SchemaAdapter: Send + Sync {
    /// The uniform view of a parsed raw document.
    fn to_uniform(&self, raw: &JsonObject) -> WorkspaceResult<JsonObject>;

    /// A raw document carrying the given uniform value, for from-scratch
    /// writes and cross-format conversion.
    fn to_raw(&self, uniform: &JsonObject) -> WorkspaceResult<JsonObject>;

    /// Rewrite a change recorded against the uniform view so that it
    /// addresses the raw document.
    fn map_change(&self, change: Change, raw: &JsonObject) -> WorkspaceResult<Change>;
}

fn expect_version(raw: &JsonObject, expected: u64) -> WorkspaceResult<()> {
    match raw.get("version").and_then(JsonValue::as_u64) {
        Some(found) if found == expected => Ok(()),
        Some(found) => Err(WorkspaceError::invalid(format!(
            "expected configuration version {expected}, found {found}"
        ))),
        None => Err(WorkspaceError::invalid(format!(
            "expected configuration version {expected}"
        ))),
    }
}

fn projects_of(raw: &JsonObject) -> WorkspaceResult<Option<&JsonObject>> {
    match raw.get("projects") {
        None => Ok(None),
        Some(JsonValue::Object(projects)) => Ok(Some(projects)),
        Some(_) => Err(WorkspaceError::invalid("projects must be an object")),
    }
}

fn require_project_object<'a>(
    name: &str,
    project: &'a JsonValue,
) -> WorkspaceResult<&'a JsonObject> {
    let object = project
        .as_object()
        .ok_or_else(|| WorkspaceError::invalid(format!("project {name:?} must be an object")))?;
    if !object.get("root").map_or(false, JsonValue::is_string) {
        return Err(WorkspaceError::invalid(format!(
            "project {name:?} requires a string root"
        )));
    }
    Ok(object)
}

/// Copy `source` with one key renamed. The value keeps its position.
fn rename_key(source: &JsonObject, from: &str, to: &str) -> JsonObject {
    source
        .iter()
        .map(|(key, value)| {
            let key = if key == from { to.to_string() } else { key.clone() };
            (key, value.clone())
        })
        .collect()
}

fn rename_path_segment(path: &JsonPath, index: usize, to: &str) -> JsonPath {
    path.iter()
        .enumerate()
        .map(|(i, segment)| {
            if i == index {
                PathSegment::Key(to.to_string())
            } else {
                segment.clone()
            }
        })
        .collect()
}

fn segment_key(path: &JsonPath, index: usize) -> Option<&str> {
    path.segments().get(index).and_then(PathSegment::as_key)
}

/// Replace the value an `Add`/`Modify` carries. Deletes pass through.
fn map_new_value(
    change: &mut Change,
    convert: impl FnOnce(&JsonValue) -> WorkspaceResult<JsonValue>,
) -> WorkspaceResult<()> {
    match change {
        Change::Add { value, .. } | Change::Modify { value, .. } => {
            *value = convert(value)?;
            Ok(())
        }
        Change::Delete { .. } => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Angular v1
// ---------------------------------------------------------------------------

/// `angular.json`, `snuggery.json` and their YAML siblings.
///
/// Raw and uniform are nearly identical; the only quirk is that older
/// documents call the target map `architect`. Reads normalize that to
/// `targets`, writes route changes back to whichever key the document uses.
pub(crate) struct AngularV1;

fn angular_project_uses_architect(raw: &JsonObject, name: &str) -> bool {
    raw.get("projects")
        .and_then(JsonValue::as_object)
        .and_then(|projects| projects.get(name))
        .and_then(JsonValue::as_object)
        .map_or(false, |project| {
            project.contains_key("architect") && !project.contains_key("targets")
        })
}

impl SchemaAdapter for AngularV1 {
    fn to_uniform(&self, raw: &JsonObject) -> WorkspaceResult<JsonObject> {
        expect_version(raw, 1)?;
        let mut uniform = JsonObject::new();
        for (key, value) in raw {
            if key == "version" {
                continue;
            }
            if key != "projects" {
                uniform.insert(key.clone(), value.clone());
                continue;
            }
            let projects = projects_of(raw)?.cloned().unwrap_or_default();
            let mut converted = JsonObject::new();
            for (name, project) in &projects {
                let project = require_project_object(name, project)?;
                if project.contains_key("architect") && project.contains_key("targets") {
                    return Err(WorkspaceError::invalid(format!(
                        "project {name:?} declares both architect and targets"
                    )));
                }
                converted.insert(
                    name.clone(),
                    JsonValue::Object(rename_key(project, "architect", "targets")),
                );
            }
            uniform.insert("projects".to_string(), JsonValue::Object(converted));
        }
        Ok(uniform)
    }

    fn to_raw(&self, uniform: &JsonObject) -> WorkspaceResult<JsonObject> {
        let mut raw = JsonObject::new();
        raw.insert("version".to_string(), JsonValue::from(1));
        for (key, value) in uniform {
            raw.insert(key.clone(), value.clone());
        }
        Ok(raw)
    }

    fn map_change(&self, mut change: Change, raw: &JsonObject) -> WorkspaceResult<Change> {
        if segment_key(change.path(), 0) == Some("projects")
            && segment_key(change.path(), 2) == Some("targets")
        {
            if let Some(name) = segment_key(change.path(), 1) {
                if angular_project_uses_architect(raw, name) {
                    *change.path_mut() = rename_path_segment(change.path(), 2, "architect");
                }
            }
        }
        Ok(change)
    }
}

// ---------------------------------------------------------------------------
// Nx v2
// ---------------------------------------------------------------------------

/// `workspace.json` in its native version 2 shape: targets use `executor`
/// instead of `builder` and tooling defaults live under `generators` instead
/// of `schematics`, at both workspace and project level.
pub(crate) struct NxV2;

fn nx_target_to_uniform(target: &JsonValue, name: &str) -> WorkspaceResult<JsonValue> {
    let target = target
        .as_object()
        .ok_or_else(|| WorkspaceError::invalid(format!("target {name:?} must be an object")))?;
    Ok(JsonValue::Object(rename_key(target, "executor", "builder")))
}

fn nx_target_to_raw(target: &JsonValue) -> WorkspaceResult<JsonValue> {
    let target = target
        .as_object()
        .ok_or_else(|| WorkspaceError::invalid("a target must be an object"))?;
    Ok(JsonValue::Object(rename_key(target, "builder", "executor")))
}

fn nx_project_to_uniform(name: &str, project: &JsonValue) -> WorkspaceResult<JsonValue> {
    let project = require_project_object(name, project)?;
    let mut converted = rename_key(project, "generators", "schematics");
    if let Some(JsonValue::Object(targets)) = project.get("targets") {
        let mut mapped = JsonObject::new();
        for (target_name, target) in targets {
            mapped.insert(
                target_name.clone(),
                nx_target_to_uniform(target, target_name)?,
            );
        }
        converted.insert("targets".to_string(), JsonValue::Object(mapped));
    }
    Ok(JsonValue::Object(converted))
}

fn nx_project_to_raw(project: &JsonValue) -> WorkspaceResult<JsonValue> {
    let project = project
        .as_object()
        .ok_or_else(|| WorkspaceError::invalid("a project must be an object"))?;
    let mut converted = rename_key(project, "schematics", "generators");
    if let Some(JsonValue::Object(targets)) = project.get("targets") {
        let mut mapped = JsonObject::new();
        for (target_name, target) in targets {
            mapped.insert(target_name.clone(), nx_target_to_raw(target)?);
        }
        converted.insert("targets".to_string(), JsonValue::Object(mapped));
    }
    Ok(JsonValue::Object(converted))
}

fn nx_projects_to_raw(projects: &JsonValue) -> WorkspaceResult<JsonValue> {
    let projects = projects
        .as_object()
        .ok_or_else(|| WorkspaceError::invalid("projects must be an object"))?;
    let mut mapped = JsonObject::new();
    for (name, project) in projects {
        mapped.insert(name.clone(), nx_project_to_raw(project)?);
    }
    Ok(JsonValue::Object(mapped))
}

impl SchemaAdapter for NxV2 {
    fn to_uniform(&self, raw: &JsonObject) -> WorkspaceResult<JsonObject> {
        expect_version(raw, 2)?;
        let mut uniform = JsonObject::new();
        for (key, value) in raw {
            match key.as_str() {
                "version" => {}
                "generators" => {
                    uniform.insert("schematics".to_string(), value.clone());
                }
                "projects" => {
                    let projects = projects_of(raw)?.cloned().unwrap_or_default();
                    let mut converted = JsonObject::new();
                    for (name, project) in &projects {
                        converted.insert(name.clone(), nx_project_to_uniform(name, project)?);
                    }
                    uniform.insert("projects".to_string(), JsonValue::Object(converted));
                }
                _ => {
                    uniform.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(uniform)
    }

    fn to_raw(&self, uniform: &JsonObject) -> WorkspaceResult<JsonObject> {
        let mut raw = JsonObject::new();
        raw.insert("version".to_string(), JsonValue::from(2));
        for (key, value) in uniform {
            match key.as_str() {
                "schematics" => {
                    raw.insert("generators".to_string(), value.clone());
                }
                "projects" => {
                    raw.insert("projects".to_string(), nx_projects_to_raw(value)?);
                }
                _ => {
                    raw.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(raw)
    }

    fn map_change(&self, mut change: Change, _raw: &JsonObject) -> WorkspaceResult<Change> {
        let path = change.path().clone();
        let in_projects = segment_key(&path, 0) == Some("projects");

        // Values that embed renamed keys are converted before the path is.
        if path.is_empty() {
            map_new_value(&mut change, |value| {
                let uniform = value
                    .as_object()
                    .ok_or_else(|| WorkspaceError::invalid("the document root must be an object"))?;
                Ok(JsonValue::Object(self.to_raw(uniform)?))
            })?;
        } else if in_projects {
            match (path.len(), segment_key(&path, 2)) {
                (1, _) => map_new_value(&mut change, nx_projects_to_raw)?,
                (2, _) => {
                    map_new_value(&mut change, nx_project_to_raw)?;
                }
                (3, Some("targets")) => map_new_value(&mut change, |value| {
                    let targets = value
                        .as_object()
                        .ok_or_else(|| WorkspaceError::invalid("targets must be an object"))?;
                    let mut mapped = JsonObject::new();
                    for (name, target) in targets {
                        mapped.insert(name.clone(), nx_target_to_raw(target)?);
                    }
                    Ok(JsonValue::Object(mapped))
                })?,
                (4, Some("targets")) => map_new_value(&mut change, nx_target_to_raw)?,
                _ => {}
            }
        }

        // Path renames, outermost first.
        if segment_key(&path, 0) == Some("schematics") {
            *change.path_mut() = rename_path_segment(change.path(), 0, "generators");
        } else if in_projects {
            if segment_key(&path, 2) == Some("schematics") {
                *change.path_mut() = rename_path_segment(change.path(), 2, "generators");
            } else if segment_key(&path, 2) == Some("targets")
                && segment_key(&path, 4) == Some("builder")
            {
                *change.path_mut() = rename_path_segment(change.path(), 4, "executor");
            }
        }
        Ok(change)
    }
}

// ---------------------------------------------------------------------------
// KDL v0
// ---------------------------------------------------------------------------

/// `snuggery.kdl`. The materialized document already uses the uniform key
/// names; the adapter only checks the version marker and strips it.
pub(crate) struct KdlV0;

impl SchemaAdapter for KdlV0 {
    fn to_uniform(&self, raw: &JsonObject) -> WorkspaceResult<JsonObject> {
        expect_version(raw, 0)?;
        let mut uniform = JsonObject::new();
        for (key, value) in raw {
            if key == "version" {
                continue;
            }
            if key == "projects" {
                let projects = projects_of(raw)?.cloned().unwrap_or_default();
                for (name, project) in &projects {
                    require_project_object(name, project)?;
                }
            }
            uniform.insert(key.clone(), value.clone());
        }
        Ok(uniform)
    }

    fn to_raw(&self, uniform: &JsonObject) -> WorkspaceResult<JsonObject> {
        let mut raw = JsonObject::new();
        raw.insert("version".to_string(), JsonValue::from(0));
        for (key, value) in uniform {
            raw.insert(key.clone(), value.clone());
        }
        Ok(raw)
    }

    fn map_change(&self, change: Change, _raw: &JsonObject) -> WorkspaceResult<Change> {
        Ok(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json_path;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn object(value: JsonValue) -> JsonObject {
        value.as_object().cloned().expect("object literal")
    }

    #[test]
    fn angular_normalizes_architect_to_targets() {
        let raw = object(json!({
            "version": 1,
            "projects": {
                "app": {
                    "root": "apps/app",
                    "architect": {"build": {"builder": "@angular:browser"}}
                }
            }
        }));
        let uniform = AngularV1.to_uniform(&raw).unwrap();
        assert_eq!(
            JsonValue::Object(uniform),
            json!({
                "projects": {
                    "app": {
                        "root": "apps/app",
                        "targets": {"build": {"builder": "@angular:browser"}}
                    }
                }
            })
        );
    }

    #[test]
    fn angular_rejects_wrong_version_and_missing_root() {
        let raw = object(json!({"version": 2, "projects": {}}));
        assert!(AngularV1.to_uniform(&raw).is_err());

        let raw = object(json!({"version": 1, "projects": {"app": {}}}));
        let err = AngularV1.to_uniform(&raw).unwrap_err();
        assert!(err.to_string().contains("string root"));
    }

    #[test]
    fn angular_routes_target_changes_to_architect() {
        let raw = object(json!({
            "version": 1,
            "projects": {"app": {"root": "", "architect": {}}}
        }));
        let change = Change::Add {
            path: json_path!("projects", "app", "targets", "build"),
            value: json!({"builder": "b"}),
        };
        let mapped = AngularV1.map_change(change, &raw).unwrap();
        assert_eq!(
            mapped.path(),
            &json_path!("projects", "app", "architect", "build")
        );
    }

    #[test]
    fn nx_renames_both_ways() {
        let raw = object(json!({
            "version": 2,
            "generators": {"@nx/js": {}},
            "projects": {
                "all": {
                    "root": "",
                    "generators": {"@nx/js:library": {}},
                    "targets": {"build": {"executor": "@x:glob", "options": {"include": "*"}}}
                }
            }
        }));
        let uniform = NxV2.to_uniform(&raw).unwrap();
        assert_eq!(
            JsonValue::Object(uniform.clone()),
            json!({
                "schematics": {"@nx/js": {}},
                "projects": {
                    "all": {
                        "root": "",
                        "schematics": {"@nx/js:library": {}},
                        "targets": {"build": {"builder": "@x:glob", "options": {"include": "*"}}}
                    }
                }
            })
        );
        let round_tripped = NxV2.to_raw(&uniform).unwrap();
        assert_eq!(JsonValue::Object(round_tripped), JsonValue::Object(raw));
    }

    #[test]
    fn nx_maps_builder_path_to_executor() {
        let raw = object(json!({"version": 2, "projects": {}}));
        let change = Change::Modify {
            path: json_path!("projects", "all", "targets", "build", "builder"),
            value: json!("@x:other"),
            old_value: json!("@x:glob"),
        };
        let mapped = NxV2.map_change(change, &raw).unwrap();
        assert_eq!(
            mapped.path(),
            &json_path!("projects", "all", "targets", "build", "executor")
        );
    }

    #[test]
    fn nx_converts_embedded_target_values() {
        let raw = object(json!({"version": 2, "projects": {}}));
        let change = Change::Add {
            path: json_path!("projects", "all", "targets", "test"),
            value: json!({"builder": "@x:test", "options": {}}),
        };
        let mapped = NxV2.map_change(change, &raw).unwrap();
        assert_eq!(
            mapped.new_value(),
            Some(&json!({"executor": "@x:test", "options": {}}))
        );
    }

    #[test]
    fn nx_converts_embedded_project_values() {
        let raw = object(json!({"version": 2, "projects": {}}));
        let change = Change::Add {
            path: json_path!("projects", "lib"),
            value: json!({
                "root": "libs/lib",
                "schematics": {},
                "targets": {"build": {"builder": "@x:tsc"}}
            }),
        };
        let mapped = NxV2.map_change(change, &raw).unwrap();
        assert_eq!(
            mapped.new_value(),
            Some(&json!({
                "root": "libs/lib",
                "generators": {},
                "targets": {"build": {"executor": "@x:tsc"}}
            }))
        );
    }

    #[test]
    fn kdl_strips_and_restores_the_version() {
        let raw = object(json!({"version": 0, "projects": {"app": {"root": "a"}}}));
        let uniform = KdlV0.to_uniform(&raw).unwrap();
        assert_eq!(
            JsonValue::Object(uniform.clone()),
            json!({"projects": {"app": {"root": "a"}}})
        );
        assert_eq!(JsonValue::Object(KdlV0.to_raw(&uniform).unwrap()), JsonValue::Object(raw));
    }
}
