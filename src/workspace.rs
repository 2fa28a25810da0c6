//! Workspace file port
//!
//! Every path is resolved against an explicit root directory passed in by the
//! caller. Nothing here reads or changes the process working directory, so
//! concurrent sessions over different roots never interfere.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

/// Workspace errors
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("path '{0}' escapes the workspace root")]
    OutsideRoot(String),

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type WorkspaceResult<T> = std::result::Result<T, WorkspaceError>;

/// Result of a write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteOutcome {
    /// Path relative to the workspace root
    pub path: String,
    pub bytes_written: usize,
    /// Backup of the previous version, if one was made
    pub backup_path: Option<String>,
    /// File did not exist before
    pub created: bool,
}

/// Directory entry returned by `list`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// File port
#[async_trait]
pub trait FilePort: Send + Sync {
    async fn read(&self, path: &str) -> WorkspaceResult<String>;

    async fn write(&self, path: &str, content: &str, backup: bool) -> WorkspaceResult<WriteOutcome>;

    async fn list(&self, path: &str) -> WorkspaceResult<Vec<DirEntry>>;

    /// Absolute root all paths are resolved against
    fn root(&self) -> &Path;

    /// Absolute path for `path`, rejecting anything outside the root
    fn resolve(&self, path: &str) -> WorkspaceResult<PathBuf>;
}

/// Local file system rooted at an explicit directory
#[derive(Debug, Clone)]
pub struct LocalWorkspace {
    root: PathBuf,
}

impl LocalWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root: PathBuf = root.into();
        let root = std::fs::canonicalize(&root).unwrap_or(root);
        Self { root }
    }

    /// Resolve a user-supplied path inside the root.
    ///
    /// Resolution is lexical first; existing targets are additionally
    /// canonicalized so symlinks pointing outside the root are rejected.
    fn resolve_inside(&self, path: &str) -> WorkspaceResult<PathBuf> {
        let requested = Path::new(path);
        let relative = if requested.is_absolute() {
            requested
                .strip_prefix(&self.root)
                .map_err(|_| WorkspaceError::OutsideRoot(path.to_string()))?
                .to_path_buf()
        } else {
            requested.to_path_buf()
        };

        let mut resolved = self.root.clone();
        let mut depth = 0usize;
        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    if depth == 0 {
                        return Err(WorkspaceError::OutsideRoot(path.to_string()));
                    }
                    resolved.pop();
                    depth -= 1;
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(WorkspaceError::OutsideRoot(path.to_string()));
                }
            }
        }

        if let Ok(real) = std::fs::canonicalize(&resolved) {
            if !real.starts_with(&self.root) {
                return Err(WorkspaceError::OutsideRoot(path.to_string()));
            }
        }

        Ok(resolved)
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string()
    }

    fn io_err(path: &str, source: std::io::Error) -> WorkspaceError {
        if source.kind() == std::io::ErrorKind::NotFound {
            WorkspaceError::NotFound(path.to_string())
        } else {
            WorkspaceError::Io {
                path: path.to_string(),
                source,
            }
        }
    }
}

/// `<file>.<timestamp>.bak` next to the original
pub fn backup_path_for(path: &Path) -> PathBuf {
    let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S%3f");
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!("{}.{}.bak", name, stamp))
}

#[async_trait]
impl FilePort for LocalWorkspace {
    async fn read(&self, path: &str) -> WorkspaceResult<String> {
        let full = self.resolve(path)?;
        tokio::fs::read_to_string(&full)
            .await
            .map_err(|e| Self::io_err(path, e))
    }

    async fn write(&self, path: &str, content: &str, backup: bool) -> WorkspaceResult<WriteOutcome> {
        let full = self.resolve(path)?;
        let existed = tokio::fs::try_exists(&full).await.unwrap_or(false);

        let mut backup_path = None;
        if backup && existed {
            let target = backup_path_for(&full);
            tokio::fs::copy(&full, &target)
                .await
                .map_err(|e| Self::io_err(path, e))?;
            debug!("Backed up {} to {}", path, target.display());
            backup_path = Some(self.relative(&target));
        }

        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::io_err(path, e))?;
        }
        tokio::fs::write(&full, content)
            .await
            .map_err(|e| Self::io_err(path, e))?;

        info!("Wrote {} ({} bytes)", path, content.len());
        Ok(WriteOutcome {
            path: self.relative(&full),
            bytes_written: content.len(),
            backup_path,
            created: !existed,
        })
    }

    async fn list(&self, path: &str) -> WorkspaceResult<Vec<DirEntry>> {
        let full = self.resolve(path)?;
        let mut reader = tokio::fs::read_dir(&full)
            .await
            .map_err(|e| Self::io_err(path, e))?;

        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await.map_err(|e| Self::io_err(path, e))? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let meta = entry.metadata().await.map_err(|e| Self::io_err(path, e))?;
            entries.push(DirEntry {
                name,
                is_dir: meta.is_dir(),
                size: if meta.is_dir() { 0 } else { meta.len() },
            });
        }

        entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
        Ok(entries)
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> WorkspaceResult<PathBuf> {
        self.resolve_inside(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_rejects_escape() {
        let dir = TempDir::new().unwrap();
        let ws = LocalWorkspace::new(dir.path());

        assert!(ws.resolve("src/../main.py").is_ok());
        assert!(matches!(ws.resolve("../etc/passwd"), Err(WorkspaceError::OutsideRoot(_))));
        assert!(matches!(ws.resolve("/etc/passwd"), Err(WorkspaceError::OutsideRoot(_))));

        let inside = ws.root().join("a.py");
        assert_eq!(ws.resolve(inside.to_str().unwrap()).unwrap(), inside);
    }

    #[tokio::test]
    async fn test_write_with_backup() {
        let dir = TempDir::new().unwrap();
        let ws = LocalWorkspace::new(dir.path());

        let first = ws.write("pkg/mod.py", "x = 1\n", true).await.unwrap();
        assert!(first.created);
        assert!(first.backup_path.is_none());

        let second = ws.write("pkg/mod.py", "x = 2\n", true).await.unwrap();
        assert!(!second.created);
        let backup = second.backup_path.unwrap();
        assert!(backup.starts_with("pkg/mod.py."));
        assert!(backup.ends_with(".bak"));

        assert_eq!(ws.read(&backup).await.unwrap(), "x = 1\n");
        assert_eq!(ws.read("pkg/mod.py").await.unwrap(), "x = 2\n");
    }

    #[tokio::test]
    async fn test_read_missing() {
        let dir = TempDir::new().unwrap();
        let ws = LocalWorkspace::new(dir.path());
        assert!(matches!(ws.read("nope.py").await, Err(WorkspaceError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_sorted_dirs_first() {
        let dir = TempDir::new().unwrap();
        let ws = LocalWorkspace::new(dir.path());
        ws.write("b.py", "", false).await.unwrap();
        ws.write("a.py", "", false).await.unwrap();
        ws.write("sub/c.py", "", false).await.unwrap();
        ws.write(".hidden", "", false).await.unwrap();

        let names: Vec<String> = ws.list(".").await.unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["sub", "a.py", "b.py"]);
    }
}
