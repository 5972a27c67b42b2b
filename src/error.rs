/// Domain-specific error types for the workspace configuration engine.
///
/// `InvalidConfigurationError` covers everything a user can cause with a bad
/// document: parse failures, wrong or missing version discriminators,
/// non-object roots, duplicate keys, cyclic `extends` chains and unsupported
/// tag usage. `UnsupportedOperationError` covers structurally legal but
/// disallowed mutations. Everything else is plumbing or an internal
/// consistency failure that must surface rather than corrupt a file.
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::value::JsonPath;

/// Main error type for workspace operations.
#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error(transparent)]
    InvalidConfiguration(#[from] InvalidConfigurationError),

    #[error(transparent)]
    UnsupportedOperation(#[from] UnsupportedOperationError),

    #[error("IO error during {operation} on {path:?}")]
    Io {
        path: PathBuf,
        operation: String,
        #[source]
        source: io::Error,
    },

    /// `update()` was re-entered while a previous update on the same handle
    /// was still pending. This is a programming error, surfaced fail-fast.
    #[error("an update is already in progress for {path:?}")]
    UpdateInProgress { path: PathBuf },

    #[error("workspace file not found at {path:?}")]
    NotFound { path: PathBuf },

    #[error("unrecognized workspace file name: {filename}")]
    UnknownFormat { filename: String },

    /// The in-memory uniform view and the physical document diverged while
    /// applying a patch. Silent divergence would corrupt the user's file, so
    /// this is raised instead of ignored.
    #[error("patch consistency failure at {path}: {message}")]
    PatchConsistency { path: JsonPath, message: String },
}

/// A malformed or schema-violating configuration document.
#[derive(Error, Debug)]
#[error("invalid configuration{}: {message}", file_suffix(.file))]
pub struct InvalidConfigurationError {
    pub message: String,
    pub file: Option<PathBuf>,
}

fn file_suffix(file: &Option<PathBuf>) -> String {
    match file {
        Some(p) => format!(" in {}", p.display()),
        None => String::new(),
    }
}

impl InvalidConfigurationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            file: None,
        }
    }

    pub fn in_file(message: impl Into<String>, file: impl Into<PathBuf>) -> Self {
        Self {
            message: message.into(),
            file: Some(file.into()),
        }
    }

    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }
}

/// A structurally legal but disallowed mutation (e.g. writing through a
/// closed tracker, or assigning a non-index key on an array).
#[derive(Error, Debug)]
#[error("unsupported operation: {message}")]
pub struct UnsupportedOperationError {
    pub message: String,
}

impl UnsupportedOperationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl WorkspaceError {
    pub fn invalid(message: impl Into<String>) -> Self {
        WorkspaceError::InvalidConfiguration(InvalidConfigurationError::new(message))
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        WorkspaceError::UnsupportedOperation(UnsupportedOperationError::new(message))
    }

    pub fn io(path: impl Into<PathBuf>, operation: impl Into<String>, source: io::Error) -> Self {
        WorkspaceError::Io {
            path: path.into(),
            operation: operation.into(),
            source,
        }
    }

    pub fn consistency(path: JsonPath, message: impl Into<String>) -> Self {
        WorkspaceError::PatchConsistency {
            path,
            message: message.into(),
        }
    }

    /// True for errors caused by document contents rather than API misuse.
    pub fn is_configuration_error(&self) -> bool {
        matches!(self, WorkspaceError::InvalidConfiguration(_))
    }

    /// Attach the offending file to a configuration error that does not
    /// already name one. Other error kinds pass through unchanged.
    pub fn with_file(self, file: impl Into<PathBuf>) -> Self {
        match self {
            WorkspaceError::InvalidConfiguration(mut e) => {
                if e.file.is_none() {
                    e.file = Some(file.into());
                }
                WorkspaceError::InvalidConfiguration(e)
            }
            other => other,
        }
    }
}

/// Result type alias for workspace operations.
pub type WorkspaceResult<T> = Result<T, WorkspaceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_configuration_display_includes_file() {
        let err = InvalidConfigurationError::in_file("version must be 0", "snuggery.kdl");
        assert_eq!(
            err.to_string(),
            "invalid configuration in snuggery.kdl: version must be 0"
        );
    }

    #[test]
    fn invalid_configuration_display_without_file() {
        let err = InvalidConfigurationError::new("root must be an object");
        assert_eq!(
            err.to_string(),
            "invalid configuration: root must be an object"
        );
    }

    #[test]
    fn workspace_error_classification() {
        assert!(WorkspaceError::invalid("x").is_configuration_error());
        assert!(!WorkspaceError::unsupported("x").is_configuration_error());
    }
}
