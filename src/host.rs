//! The file system capability consumed by the workspace engine.
//!
//! The core never touches the disk directly; everything goes through a
//! [`WorkspaceHost`]. [`NativeHost`] backs it with tokio's fs, and
//! [`MemoryHost`] provides an in-memory double for tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{WorkspaceError, WorkspaceResult};

#[async_trait]
pub trait WorkspaceHost: Send + Sync {
    async fn is_file(&self, path: &Path) -> bool;

    async fn is_directory(&self, path: &Path) -> bool;

    /// File and directory names directly inside `path`.
    async fn read_dir(&self, path: &Path) -> WorkspaceResult<Vec<String>>;

    async fn read(&self, path: &Path) -> WorkspaceResult<String>;

    async fn write(&self, path: &Path, content: &str) -> WorkspaceResult<()>;
}

/// Host backed by the real file system.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeHost;

#[async_trait]
impl WorkspaceHost for NativeHost {
    async fn is_file(&self, path: &Path) -> bool {
        tokio::fs::metadata(path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    async fn is_directory(&self, path: &Path) -> bool {
        tokio::fs::metadata(path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    async fn read_dir(&self, path: &Path) -> WorkspaceResult<Vec<String>> {
        let mut entries = tokio::fs::read_dir(path)
            .await
            .map_err(|e| WorkspaceError::io(path, "readdir", e))?;
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| WorkspaceError::io(path, "readdir", e))?
        {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    async fn read(&self, path: &Path) -> WorkspaceResult<String> {
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| WorkspaceError::io(path, "read", e))
    }

    async fn write(&self, path: &Path, content: &str) -> WorkspaceResult<()> {
        tokio::fs::write(path, content)
            .await
            .map_err(|e| WorkspaceError::io(path, "write", e))
    }
}

/// In-memory host for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryHost {
    files: Mutex<HashMap<PathBuf, String>>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        self.files
            .lock()
            .expect("memory host lock")
            .insert(path.into(), content.into());
        self
    }

    pub fn insert(&self, path: impl Into<PathBuf>, content: impl Into<String>) {
        self.files
            .lock()
            .expect("memory host lock")
            .insert(path.into(), content.into());
    }

    pub fn contents(&self, path: &Path) -> Option<String> {
        self.files
            .lock()
            .expect("memory host lock")
            .get(path)
            .cloned()
    }
}

#[async_trait]
impl WorkspaceHost for MemoryHost {
    async fn is_file(&self, path: &Path) -> bool {
        self.files.lock().expect("memory host lock").contains_key(path)
    }

    async fn is_directory(&self, path: &Path) -> bool {
        let files = self.files.lock().expect("memory host lock");
        files.keys().any(|p| p.starts_with(path) && p != path)
    }

    async fn read_dir(&self, path: &Path) -> WorkspaceResult<Vec<String>> {
        let files = self.files.lock().expect("memory host lock");
        let mut names: Vec<String> = files
            .keys()
            .filter_map(|p| {
                let rest = p.strip_prefix(path).ok()?;
                rest.components()
                    .next()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
            })
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn read(&self, path: &Path) -> WorkspaceResult<String> {
        self.contents(path)
            .ok_or_else(|| WorkspaceError::NotFound {
                path: path.to_path_buf(),
            })
    }

    async fn write(&self, path: &Path, content: &str) -> WorkspaceResult<()> {
        self.insert(path, content);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_host_round_trip() {
        let host = MemoryHost::new();
        host.insert("dir/snuggery.json", "{}");
        assert!(host.is_file(Path::new("dir/snuggery.json")).await);
        assert!(host.is_directory(Path::new("dir")).await);
        assert_eq!(
            host.read(Path::new("dir/snuggery.json")).await.unwrap(),
            "{}"
        );
        assert_eq!(
            host.read_dir(Path::new("dir")).await.unwrap(),
            vec!["snuggery.json".to_string()]
        );
    }

    #[tokio::test]
    async fn memory_host_missing_file() {
        let host = MemoryHost::new();
        let err = host.read(Path::new("nope.json")).await.unwrap_err();
        assert!(matches!(err, WorkspaceError::NotFound { .. }));
    }

    #[tokio::test]
    async fn native_host_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snuggery.json");

        let host = NativeHost;
        assert!(!host.is_file(&path).await);
        host.write(&path, "{}").await.unwrap();
        assert!(host.is_file(&path).await);
        assert!(host.is_directory(dir.path()).await);
        assert_eq!(host.read(&path).await.unwrap(), "{}");
        assert!(host
            .read_dir(dir.path())
            .await
            .unwrap()
            .contains(&"snuggery.json".to_string()));
    }
}
