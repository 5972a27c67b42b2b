//! Typed views over a tracked workspace value.
//!
//! Every view is a thin wrapper around a [`Draft`] scoped to a sub-path, so
//! all reads and writes flow through the change tracker. Values handed to
//! `add`/`set` are taken by move and cloned into the tracked tree; mutating
//! the caller's copy afterwards never reaches the collection.

use crate::error::{WorkspaceError, WorkspaceResult};
use crate::json_path;
use crate::tracker::Draft;
use crate::value::{JsonObject, JsonValue};

/// Keys of a project that have dedicated accessors; everything else is an
/// extension.
const PROJECT_KEYS: &[&str] = &["root", "prefix", "sourceRoot", "targets"];

/// Keys of a target that have dedicated accessors.
const TARGET_KEYS: &[&str] = &["builder", "options", "configurations", "defaultConfiguration"];

/// The uniform workspace: tooling extensions plus a project collection.
pub struct WorkspaceDefinition {
    draft: Draft,
}

impl WorkspaceDefinition {
    pub(crate) fn new(draft: Draft) -> Self {
        Self { draft }
    }

    /// Top-level keys other than `projects`.
    pub fn extensions(&self) -> JsonObject {
        match self.draft.value() {
            Some(JsonValue::Object(map)) => {
                map.into_iter().filter(|(key, _)| key != "projects").collect()
            }
            _ => JsonObject::new(),
        }
    }

    pub fn extension(&self, key: &str) -> Option<JsonValue> {
        if key == "projects" {
            return None;
        }
        self.draft.get(&json_path!(key))
    }

    pub fn set_extension(&self, key: &str, value: JsonValue) -> WorkspaceResult<()> {
        if key == "projects" {
            return Err(WorkspaceError::unsupported(
                "projects is not an extension; use the project collection",
            ));
        }
        self.draft.set(&json_path!(key), value)
    }

    pub fn delete_extension(&self, key: &str) -> WorkspaceResult<()> {
        if key == "projects" {
            return Err(WorkspaceError::unsupported(
                "projects is not an extension; use the project collection",
            ));
        }
        self.draft.delete(&json_path!(key))
    }

    pub fn projects(&self) -> ProjectDefinitionCollection {
        ProjectDefinitionCollection {
            draft: self.draft.clone(),
        }
    }
}

/// The named projects of a workspace.
pub struct ProjectDefinitionCollection {
    /// Rooted at the workspace, not at `projects`: adding the first project
    /// must be able to create the `projects` object itself.
    draft: Draft,
}

impl ProjectDefinitionCollection {
    pub fn names(&self) -> Vec<String> {
        match self.draft.get(&json_path!("projects")) {
            Some(JsonValue::Object(map)) => map.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.draft.exists(&json_path!("projects", name))
    }

    pub fn get(&self, name: &str) -> Option<ProjectDefinition> {
        self.has(name).then(|| ProjectDefinition {
            draft: self.draft.at(json_path!("projects", name)),
        })
    }

    /// Add a project. The value must be an object with a string `root`.
    pub fn add(&self, name: &str, project: JsonValue) -> WorkspaceResult<ProjectDefinition> {
        let valid = project
            .as_object()
            .and_then(|object| object.get("root"))
            .map_or(false, JsonValue::is_string);
        if !valid {
            return Err(WorkspaceError::invalid(format!(
                "project {name:?} requires a string root"
            )));
        }
        if self.has(name) {
            return Err(WorkspaceError::unsupported(format!(
                "project {name:?} already exists"
            )));
        }
        if self.draft.exists(&json_path!("projects")) {
            self.draft.set(&json_path!("projects", name), project)?;
        } else {
            // First project: the containing object is written in one piece so
            // a single change carries it.
            let mut projects = JsonObject::new();
            projects.insert(name.to_string(), project);
            self.draft
                .set(&json_path!("projects"), JsonValue::Object(projects))?;
        }
        Ok(ProjectDefinition {
            draft: self.draft.at(json_path!("projects", name)),
        })
    }

    pub fn delete(&self, name: &str) -> WorkspaceResult<()> {
        self.draft.delete(&json_path!("projects", name))
    }
}

/// One project: a root directory, optional prefix and source root, targets,
/// and arbitrary extensions.
pub struct ProjectDefinition {
    draft: Draft,
}

impl ProjectDefinition {
    pub fn root(&self) -> Option<String> {
        self.string_at("root")
    }

    pub fn set_root(&self, root: impl Into<String>) -> WorkspaceResult<()> {
        self.draft
            .set(&json_path!("root"), JsonValue::String(root.into()))
    }

    pub fn prefix(&self) -> Option<String> {
        self.string_at("prefix")
    }

    pub fn set_prefix(&self, prefix: impl Into<String>) -> WorkspaceResult<()> {
        self.draft
            .set(&json_path!("prefix"), JsonValue::String(prefix.into()))
    }

    pub fn source_root(&self) -> Option<String> {
        self.string_at("sourceRoot")
    }

    pub fn set_source_root(&self, source_root: impl Into<String>) -> WorkspaceResult<()> {
        self.draft.set(
            &json_path!("sourceRoot"),
            JsonValue::String(source_root.into()),
        )
    }

    pub fn extensions(&self) -> JsonObject {
        match self.draft.value() {
            Some(JsonValue::Object(map)) => map
                .into_iter()
                .filter(|(key, _)| !PROJECT_KEYS.contains(&key.as_str()))
                .collect(),
            _ => JsonObject::new(),
        }
    }

    pub fn extension(&self, key: &str) -> Option<JsonValue> {
        if PROJECT_KEYS.contains(&key) {
            return None;
        }
        self.draft.get(&json_path!(key))
    }

    pub fn set_extension(&self, key: &str, value: JsonValue) -> WorkspaceResult<()> {
        if PROJECT_KEYS.contains(&key) {
            return Err(WorkspaceError::unsupported(format!(
                "{key} has a dedicated accessor and is not an extension"
            )));
        }
        self.draft.set(&json_path!(key), value)
    }

    pub fn targets(&self) -> TargetDefinitionCollection {
        TargetDefinitionCollection {
            draft: self.draft.clone(),
        }
    }

    fn string_at(&self, key: &str) -> Option<String> {
        match self.draft.get(&json_path!(key)) {
            Some(JsonValue::String(value)) => Some(value),
            _ => None,
        }
    }
}

/// The named targets of a project.
pub struct TargetDefinitionCollection {
    /// Rooted at the project so the `targets` object can be created lazily.
    draft: Draft,
}

impl TargetDefinitionCollection {
    pub fn names(&self) -> Vec<String> {
        match self.draft.get(&json_path!("targets")) {
            Some(JsonValue::Object(map)) => map.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.draft.exists(&json_path!("targets", name))
    }

    pub fn get(&self, name: &str) -> Option<TargetDefinition> {
        self.has(name).then(|| TargetDefinition {
            draft: self.draft.at(json_path!("targets", name)),
        })
    }

    /// Add a target. The value must be an object with a string `builder`.
    pub fn add(&self, name: &str, target: JsonValue) -> WorkspaceResult<TargetDefinition> {
        let valid = target
            .as_object()
            .and_then(|object| object.get("builder"))
            .map_or(false, JsonValue::is_string);
        if !valid {
            return Err(WorkspaceError::invalid(format!(
                "target {name:?} requires a string builder"
            )));
        }
        if self.has(name) {
            return Err(WorkspaceError::unsupported(format!(
                "target {name:?} already exists"
            )));
        }
        if self.draft.exists(&json_path!("targets")) {
            self.draft.set(&json_path!("targets", name), target)?;
        } else {
            let mut targets = JsonObject::new();
            targets.insert(name.to_string(), target);
            self.draft
                .set(&json_path!("targets"), JsonValue::Object(targets))?;
        }
        Ok(TargetDefinition {
            draft: self.draft.at(json_path!("targets", name)),
        })
    }

    pub fn delete(&self, name: &str) -> WorkspaceResult<()> {
        self.draft.delete(&json_path!("targets", name))
    }
}

/// One target: a builder plus its options and named configurations.
pub struct TargetDefinition {
    draft: Draft,
}

impl TargetDefinition {
    pub fn builder(&self) -> Option<String> {
        match self.draft.get(&json_path!("builder")) {
            Some(JsonValue::String(value)) => Some(value),
            _ => None,
        }
    }

    pub fn set_builder(&self, builder: impl Into<String>) -> WorkspaceResult<()> {
        self.draft
            .set(&json_path!("builder"), JsonValue::String(builder.into()))
    }

    pub fn options(&self) -> Option<JsonObject> {
        match self.draft.get(&json_path!("options")) {
            Some(JsonValue::Object(map)) => Some(map),
            _ => None,
        }
    }

    /// Set a single option, creating the `options` object on first use.
    pub fn set_option(&self, key: &str, value: JsonValue) -> WorkspaceResult<()> {
        if self.draft.exists(&json_path!("options")) {
            self.draft.set(&json_path!("options", key), value)
        } else {
            let mut options = JsonObject::new();
            options.insert(key.to_string(), value);
            self.draft
                .set(&json_path!("options"), JsonValue::Object(options))
        }
    }

    pub fn delete_option(&self, key: &str) -> WorkspaceResult<()> {
        self.draft.delete(&json_path!("options", key))
    }

    pub fn configuration(&self, name: &str) -> Option<JsonObject> {
        match self.draft.get(&json_path!("configurations", name)) {
            Some(JsonValue::Object(map)) => Some(map),
            _ => None,
        }
    }

    pub fn set_configuration(&self, name: &str, value: JsonObject) -> WorkspaceResult<()> {
        if self.draft.exists(&json_path!("configurations")) {
            self.draft
                .set(&json_path!("configurations", name), JsonValue::Object(value))
        } else {
            let mut configurations = JsonObject::new();
            configurations.insert(name.to_string(), JsonValue::Object(value));
            self.draft.set(
                &json_path!("configurations"),
                JsonValue::Object(configurations),
            )
        }
    }

    pub fn default_configuration(&self) -> Option<String> {
        match self.draft.get(&json_path!("defaultConfiguration")) {
            Some(JsonValue::String(value)) => Some(value),
            _ => None,
        }
    }

    pub fn set_default_configuration(&self, name: impl Into<String>) -> WorkspaceResult<()> {
        self.draft.set(
            &json_path!("defaultConfiguration"),
            JsonValue::String(name.into()),
        )
    }

    pub fn extensions(&self) -> JsonObject {
        match self.draft.value() {
            Some(JsonValue::Object(map)) => map
                .into_iter()
                .filter(|(key, _)| !TARGET_KEYS.contains(&key.as_str()))
                .collect(),
            _ => JsonObject::new(),
        }
    }

    pub fn extension(&self, key: &str) -> Option<JsonValue> {
        if TARGET_KEYS.contains(&key) {
            return None;
        }
        self.draft.get(&json_path!(key))
    }

    pub fn set_extension(&self, key: &str, value: JsonValue) -> WorkspaceResult<()> {
        if TARGET_KEYS.contains(&key) {
            return Err(WorkspaceError::unsupported(format!(
                "{key} has a dedicated accessor and is not an extension"
            )));
        }
        self.draft.set(&json_path!(key), value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json_path;
    use crate::tracker::{Change, CombinedTracker};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn workspace(value: JsonValue) -> (CombinedTracker, WorkspaceDefinition) {
        let tracker = CombinedTracker::new(value);
        let definition = WorkspaceDefinition::new(tracker.open());
        (tracker, definition)
    }

    #[test]
    fn typed_accessors_read_through() {
        let (_tracker, workspace) = workspace(json!({
            "schematics": {"@snuggery/schematic": {"dry": true}},
            "projects": {
                "app": {
                    "root": "apps/app",
                    "sourceRoot": "apps/app/src",
                    "targets": {
                        "build": {
                            "builder": "@snuggery:build",
                            "options": {"verbose": false},
                            "configurations": {"production": {"optimize": true}},
                            "defaultConfiguration": "production"
                        }
                    }
                }
            }
        }));
        assert_eq!(workspace.projects().names(), vec!["app".to_string()]);
        let project = workspace.projects().get("app").unwrap();
        assert_eq!(project.root().as_deref(), Some("apps/app"));
        assert_eq!(project.source_root().as_deref(), Some("apps/app/src"));
        assert_eq!(project.prefix(), None);

        let target = project.targets().get("build").unwrap();
        assert_eq!(target.builder().as_deref(), Some("@snuggery:build"));
        assert_eq!(target.options().unwrap()["verbose"], json!(false));
        assert_eq!(
            target.configuration("production").unwrap()["optimize"],
            json!(true)
        );
        assert_eq!(target.default_configuration().as_deref(), Some("production"));
        assert_eq!(
            workspace.extension("schematics"),
            Some(json!({"@snuggery/schematic": {"dry": true}}))
        );
    }

    #[test]
    fn mutations_record_minimal_changes() {
        let (tracker, workspace) = workspace(json!({
            "projects": {
                "app": {
                    "root": "",
                    "targets": {"build": {"builder": "b", "options": {"include": "*"}}}
                }
            }
        }));
        let target = workspace
            .projects()
            .get("app")
            .unwrap()
            .targets()
            .get("build")
            .unwrap();
        target.set_option("include", json!(["*"])).unwrap();

        let changes = tracker.close();
        assert_eq!(
            changes,
            vec![Change::Modify {
                path: json_path!("projects", "app", "targets", "build", "options", "include"),
                value: json!(["*"]),
                old_value: json!("*"),
            }]
        );
    }

    #[test]
    fn add_clones_by_move_and_validates() {
        let (tracker, workspace) = workspace(json!({"projects": {}}));
        let projects = workspace.projects();
        assert!(projects.add("app", json!({"prefix": "x"})).is_err());

        let project = projects.add("app", json!({"root": "apps/app"})).unwrap();
        project
            .targets()
            .add("build", json!({"builder": "@snuggery:build"}))
            .unwrap();
        assert!(projects.add("app", json!({"root": "twice"})).is_err());

        let changes = tracker.close();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path(), &json_path!("projects", "app"));
        assert_eq!(
            changes[0].new_value(),
            Some(&json!({
                "root": "apps/app",
                "targets": {"build": {"builder": "@snuggery:build"}}
            }))
        );
    }

    #[test]
    fn first_project_creates_the_containing_object() {
        let (tracker, workspace) = workspace(json!({}));
        workspace
            .projects()
            .add("lib", json!({"root": "libs/lib"}))
            .unwrap();
        let changes = tracker.close();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path(), &json_path!("projects"));
    }

    #[test]
    fn reserved_keys_are_not_extensions() {
        let (_tracker, workspace) = workspace(json!({
            "projects": {"app": {"root": "", "targets": {}, "custom": 1}}
        }));
        let project = workspace.projects().get("app").unwrap();
        assert_eq!(project.extension("custom"), Some(json!(1)));
        assert_eq!(project.extension("root"), None);
        assert!(project.set_extension("targets", json!({})).is_err());
        assert!(workspace.set_extension("projects", json!({})).is_err());
    }
}
