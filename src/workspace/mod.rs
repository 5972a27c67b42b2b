//! The top-level workspace API.
//!
//! A [`WorkspaceHandle`] ties together format detection, the per-format file
//! handles, schema adaptation and change tracking. `read` returns the uniform
//! view, `update` opens a tracked [`WorkspaceDefinition`] over it, and the
//! combined change list is mapped back through the schema adapter onto the
//! physical document so untouched formatting survives.

mod definition;
mod schema;

pub use definition::{
    ProjectDefinition, ProjectDefinitionCollection, TargetDefinition, TargetDefinitionCollection,
    WorkspaceDefinition,
};

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{WorkspaceError, WorkspaceResult};
use crate::files::json::JsonFileHandle;
use crate::files::kdl::KdlFileHandle;
use crate::files::yaml::YamlFileHandle;
use crate::files::FileHandle;
use crate::host::{NativeHost, WorkspaceHost};
use crate::tracker::CombinedTracker;
use crate::value::{JsonObject, JsonValue};

use schema::SchemaAdapter;

/// The workspace flavour a file name implies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkspaceFormat {
    /// `angular.json`, `snuggery.json` and the YAML variants (version 1).
    Angular,
    /// `workspace.json`; resolves to Angular when the document says version 1.
    Nx,
    /// `snuggery.kdl` (version 0).
    Kdl,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FileKind {
    Json,
    Yaml,
    Kdl,
}

static KNOWN_FILES: Lazy<HashMap<&'static str, (FileKind, WorkspaceFormat)>> = Lazy::new(|| {
    let mut files = HashMap::new();
    for name in ["snuggery.kdl", ".snuggery.kdl"] {
        files.insert(name, (FileKind::Kdl, WorkspaceFormat::Kdl));
    }
    for name in ["snuggery.json", ".snuggery.json", "angular.json", ".angular.json"] {
        files.insert(name, (FileKind::Json, WorkspaceFormat::Angular));
    }
    for name in ["snuggery.yaml", ".snuggery.yaml"] {
        files.insert(name, (FileKind::Yaml, WorkspaceFormat::Angular));
    }
    for name in ["workspace.json", ".workspace.json"] {
        files.insert(name, (FileKind::Json, WorkspaceFormat::Nx));
    }
    files
});

/// Recognized workspace file names, in lookup priority order.
pub fn workspace_filenames() -> &'static [&'static str] {
    &[
        "snuggery.kdl",
        ".snuggery.kdl",
        "snuggery.json",
        ".snuggery.json",
        "snuggery.yaml",
        ".snuggery.yaml",
        "workspace.json",
        ".workspace.json",
        "angular.json",
        ".angular.json",
    ]
}

/// Locate the workspace file governing `start`: the directory itself first,
/// then each ancestor, with file names tried in priority order.
pub async fn find_workspace(host: &dyn WorkspaceHost, start: &Path) -> Option<PathBuf> {
    let mut directory = Some(start);
    while let Some(current) = directory {
        for name in workspace_filenames() {
            let candidate = current.join(name);
            if host.is_file(&candidate).await {
                return Some(candidate);
            }
        }
        directory = current.parent();
    }
    None
}

/// Handle on one workspace configuration file.
pub struct WorkspaceHandle {
    path: PathBuf,
    format: WorkspaceFormat,
    file: Box<dyn FileHandle>,
    /// Single-flight guard: a second `update` fails fast while one is
    /// pending. Reads and writes do not touch this lock.
    update_pending: Mutex<()>,
    /// Serializes document access so `read` and `write` never observe a
    /// half-applied document. A pending update waits for readers here
    /// instead of failing.
    io_lock: Mutex<()>,
}

impl fmt::Debug for WorkspaceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkspaceHandle")
            .field("path", &self.path)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

impl WorkspaceHandle {
    pub fn new(host: Arc<dyn WorkspaceHost>, path: impl Into<PathBuf>) -> WorkspaceResult<Self> {
        let path = path.into();
        let filename = path
            .file_name()
            .and_then(OsStr::to_str)
            .unwrap_or_default();
        let (kind, format) =
            KNOWN_FILES
                .get(filename)
                .copied()
                .ok_or_else(|| WorkspaceError::UnknownFormat {
                    filename: filename.to_string(),
                })?;
        let file: Box<dyn FileHandle> = match kind {
            FileKind::Json => Box::new(JsonFileHandle::new(host, path.clone())),
            FileKind::Yaml => Box::new(YamlFileHandle::new(host, path.clone())),
            FileKind::Kdl => Box::new(KdlFileHandle::new(host, path.clone())),
        };
        Ok(Self {
            path,
            format,
            file,
            update_pending: Mutex::new(()),
            io_lock: Mutex::new(()),
        })
    }

    /// Handle backed by the real file system.
    pub fn native(path: impl Into<PathBuf>) -> WorkspaceResult<Self> {
        Self::new(Arc::new(NativeHost), path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> WorkspaceFormat {
        self.format
    }

    /// The uniform view of the workspace document.
    pub async fn read(&self) -> WorkspaceResult<JsonObject> {
        let _guard = self.io_lock.lock().await;
        let (_, uniform, _) = self.load().await?;
        Ok(uniform)
    }

    /// Serialize `uniform` from scratch in this handle's canonical schema,
    /// replacing the whole document.
    pub async fn write(&self, uniform: &JsonObject) -> WorkspaceResult<()> {
        let _guard = self.io_lock.lock().await;
        let adapter = self.canonical_adapter();
        let raw = adapter.to_raw(uniform)?;
        self.file.write(&JsonValue::Object(raw)).await
    }

    /// Open a tracked view of the uniform workspace, run `updater` on it, and
    /// apply the minimized change list to the original document.
    ///
    /// Fails immediately with [`WorkspaceError::UpdateInProgress`] when
    /// another update on this handle has not finished. When the updater makes
    /// no net change, nothing is written.
    pub async fn update<F>(&self, updater: F) -> WorkspaceResult<()>
    where
        F: FnOnce(&WorkspaceDefinition) -> WorkspaceResult<()>,
    {
        let _pending =
            self.update_pending
                .try_lock()
                .map_err(|_| WorkspaceError::UpdateInProgress {
                    path: self.path.clone(),
                })?;
        let _guard = self.io_lock.lock().await;
        let (raw, uniform, adapter) = self.load().await?;

        let tracker = CombinedTracker::new(JsonValue::Object(uniform));
        let workspace = WorkspaceDefinition::new(tracker.open());
        updater(&workspace)?;
        drop(workspace);
        let changes = tracker.close();
        if changes.is_empty() {
            debug!("no changes recorded for {}", self.path.display());
            return Ok(());
        }

        let mut mapped = Vec::with_capacity(changes.len());
        for change in changes {
            mapped.push(adapter.map_change(change, &raw)?);
        }
        debug!(
            count = mapped.len(),
            "applying changes to {}",
            self.path.display()
        );
        self.file.apply_changes(&mapped).await
    }

    async fn load(&self) -> WorkspaceResult<(JsonObject, JsonObject, Box<dyn SchemaAdapter>)> {
        let value = self.file.read().await?;
        let raw = match value {
            JsonValue::Object(raw) => raw,
            _ => {
                return Err(
                    WorkspaceError::invalid("the document root must be an object")
                        .with_file(&self.path),
                )
            }
        };
        let adapter = self.adapter_for(&raw);
        let uniform = adapter
            .to_uniform(&raw)
            .map_err(|e| e.with_file(&self.path))?;
        Ok((raw, uniform, adapter))
    }

    /// The adapter for an existing document. `workspace.json` dispatches on
    /// the document's own version field.
    fn adapter_for(&self, raw: &JsonObject) -> Box<dyn SchemaAdapter> {
        match self.format {
            WorkspaceFormat::Angular => Box::new(schema::AngularV1),
            WorkspaceFormat::Kdl => Box::new(schema::KdlV0),
            WorkspaceFormat::Nx => match raw.get("version").and_then(JsonValue::as_u64) {
                Some(1) => Box::new(schema::AngularV1),
                _ => Box::new(schema::NxV2),
            },
        }
    }

    fn canonical_adapter(&self) -> Box<dyn SchemaAdapter> {
        match self.format {
            WorkspaceFormat::Angular => Box::new(schema::AngularV1),
            WorkspaceFormat::Nx => Box::new(schema::NxV2),
            WorkspaceFormat::Kdl => Box::new(schema::KdlV0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryHost;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn handle(host: Arc<MemoryHost>, path: &str) -> WorkspaceHandle {
        WorkspaceHandle::new(host, path).unwrap()
    }

    #[test]
    fn unknown_file_names_are_rejected() {
        let err = WorkspaceHandle::new(Arc::new(MemoryHost::new()), "project.toml").unwrap_err();
        assert!(matches!(err, WorkspaceError::UnknownFormat { .. }));
    }

    #[tokio::test]
    async fn workspace_json_dispatches_on_version() {
        let host = Arc::new(
            MemoryHost::new().with_file(
                "workspace.json",
                r#"{"version": 2, "projects": {"all": {"root": "", "targets": {"build": {"executor": "@x:glob"}}}}}"#,
            ),
        );
        let uniform = handle(Arc::clone(&host), "workspace.json").read().await.unwrap();
        assert_eq!(
            uniform["projects"]["all"]["targets"]["build"]["builder"],
            json!("@x:glob")
        );

        host.insert(
            "workspace.json",
            r#"{"version": 1, "projects": {"all": {"root": "", "architect": {"build": {"builder": "@x:glob"}}}}}"#,
        );
        let uniform = handle(host, "workspace.json").read().await.unwrap();
        assert_eq!(
            uniform["projects"]["all"]["targets"]["build"]["builder"],
            json!("@x:glob")
        );
    }

    #[tokio::test]
    async fn update_without_changes_writes_nothing() {
        let original = r#"{
    "version": 1,
    "projects": {}
}"#;
        let host = Arc::new(MemoryHost::new().with_file("angular.json", original));
        handle(Arc::clone(&host), "angular.json")
            .update(|_| Ok(()))
            .await
            .unwrap();
        assert_eq!(
            host.contents(Path::new("angular.json")).unwrap(),
            original
        );
    }

    #[tokio::test]
    async fn concurrent_update_is_rejected() {
        let host = Arc::new(
            MemoryHost::new().with_file("snuggery.json", r#"{"version": 1, "projects": {}}"#),
        );
        let handle = handle(host, "snuggery.json");
        let guard = handle.update_pending.try_lock().unwrap();
        let err = handle.update(|_| Ok(())).await.unwrap_err();
        assert!(matches!(err, WorkspaceError::UpdateInProgress { .. }));
        drop(guard);
        handle.update(|_| Ok(())).await.unwrap();
    }

    #[tokio::test]
    async fn updates_wait_for_readers_instead_of_failing() {
        let host = Arc::new(
            MemoryHost::new().with_file("snuggery.json", r#"{"version": 1, "projects": {}}"#),
        );
        let handle = handle(host, "snuggery.json");

        let reader = handle.io_lock.lock().await;
        let waiting = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            handle.update(|_| Ok(())),
        )
        .await;
        // Still waiting on the reader, not rejected.
        assert!(waiting.is_err());

        drop(reader);
        handle.update(|_| Ok(())).await.unwrap();
    }

    #[tokio::test]
    async fn failed_updater_writes_nothing() {
        let original = r#"{"version": 1, "projects": {"app": {"root": ""}}}"#;
        let host = Arc::new(MemoryHost::new().with_file("angular.json", original));
        let handle = handle(Arc::clone(&host), "angular.json");
        let err = handle
            .update(|workspace| {
                workspace
                    .projects()
                    .get("app")
                    .unwrap()
                    .set_root("moved")?;
                Err(WorkspaceError::unsupported("abort"))
            })
            .await
            .unwrap_err();
        assert!(!err.is_configuration_error());
        assert_eq!(host.contents(Path::new("angular.json")).unwrap(), original);
    }

    #[tokio::test]
    async fn find_workspace_walks_up() {
        let host = MemoryHost::new().with_file("repo/angular.json", "{}");
        let found = find_workspace(&host, Path::new("repo/apps/app/src")).await;
        assert_eq!(found, Some(PathBuf::from("repo/angular.json")));
        assert_eq!(find_workspace(&host, Path::new("elsewhere")).await, None);
    }
}
