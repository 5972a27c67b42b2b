//! # snuggery-workspace
//!
//! A workspace-configuration engine: it reads, diffs and rewrites project
//! configuration stored in JSON, YAML or the KDL-based `snuggery.kdl` format,
//! while preserving the original document's formatting, comments, anchors and
//! aliases on write-back.
//!
//! The engine is layered. A [`tracker::ChangeTracker`] records in-memory
//! mutations of a configuration value as a minimal list of structural
//! changes. Per-format file handles in [`files`] apply that change list onto
//! the original serialized document instead of re-serializing from scratch.
//! The KDL format additionally supports project inheritance (`extends`),
//! which reads flatten and writes re-derive into minimal local overrides.
//! On top, [`workspace::WorkspaceHandle`] normalizes the three on-disk
//! schemas (Angular CLI v1, Nx v2, KDL v0) into one uniform model.
//!
//! ## Quick start
//!
//! ```no_run
//! use snuggery_workspace::{WorkspaceHandle, WorkspaceResult};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> WorkspaceResult<()> {
//!     let workspace = WorkspaceHandle::native("angular.json")?;
//!     workspace
//!         .update(|workspace| {
//!             let project = workspace.projects().get("app").expect("project exists");
//!             let target = project.targets().get("build").expect("target exists");
//!             target.set_option("verbose", json!(true))
//!         })
//!         .await
//! }
//! ```
//!
//! ## Module overview
//!
//! - [`value`] - The JSON value model and path addressing
//! - [`tracker`] - Change tracking, drafts and change combination
//! - [`files`] - Format-preserving file handles (JSON, YAML, KDL)
//! - [`host`] - The file system capability and its test double
//! - [`workspace`] - Schema adapters and the top-level workspace API
//! - [`error`] - Error types shared across the engine

/// Error types and handling utilities
pub mod error;
/// Format-preserving file handles for JSON, YAML and KDL documents
pub mod files;
/// The file system capability consumed by the engine
pub mod host;
/// Change tracking for in-memory configuration mutation
pub mod tracker;
/// The JSON value model and path addressing
pub mod value;
/// Schema adapters and the top-level workspace API
pub mod workspace;

pub use error::{
    InvalidConfigurationError, UnsupportedOperationError, WorkspaceError, WorkspaceResult,
};
pub use host::{MemoryHost, NativeHost, WorkspaceHost};
pub use tracker::{combine_changes, Change, ChangeTracker, CombinedTracker, Draft};
pub use value::{JsonObject, JsonPath, JsonValue, PathSegment};
pub use workspace::{
    find_workspace, workspace_filenames, ProjectDefinition, ProjectDefinitionCollection,
    TargetDefinition, TargetDefinitionCollection, WorkspaceDefinition, WorkspaceFormat,
    WorkspaceHandle,
};
