/// Workspace file service
///
/// Answers the daemon's `list_files` / `read_file` / `write_file` /
/// `delete_file` / `make_dir` requests. Every requested path is interpreted
/// relative to the agent work dir; absolute paths and `..` segments that
/// climb above it are rejected before touching the filesystem.
use crate::errors::{AgentError, AgentResult};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use testmesh_core::{AgentMessage, FileEntry, ServerMessage, WorkspaceResponse};
use tracing::{debug, warn};

/// Largest file `read_file` will return.
pub const MAX_READ_BYTES: u64 = 10 * 1024 * 1024;

/// The agent work dir, shared between the executor and the file service.
///
/// It can change once the daemon announces a directory in `welcome`.
#[derive(Debug, Clone)]
pub struct WorkDir(Arc<RwLock<PathBuf>>);

impl WorkDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        WorkDir(Arc::new(RwLock::new(path.into())))
    }

    pub fn path(&self) -> PathBuf {
        self.0.read().clone()
    }

    pub fn set(&self, path: impl Into<PathBuf>) {
        *self.0.write() = path.into();
    }
}

/// Resolve `requested` under `root` without leaving it.
pub fn resolve(root: &Path, requested: &str) -> AgentResult<PathBuf> {
    let mut relative = PathBuf::new();
    for component in Path::new(requested).components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => relative.push(part),
            Component::ParentDir => {
                if !relative.pop() {
                    return Err(AgentError::PathEscape(requested.to_string()));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(AgentError::PathEscape(requested.to_string()));
            }
        }
    }
    Ok(root.join(relative))
}

/// Path relative to the work dir, `/`-separated, as reported to the daemon.
fn display_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

pub struct WorkspaceService {
    work_dir: WorkDir,
}

impl WorkspaceService {
    pub fn new(work_dir: WorkDir) -> Self {
        Self { work_dir }
    }

    /// Answer a workspace request; `None` for any other message.
    pub async fn handle(&self, message: &ServerMessage) -> Option<AgentMessage> {
        let response = match message {
            ServerMessage::ListFiles { request_id, path } => {
                AgentMessage::ListFilesResponse(match self.list(path).await {
                    Ok(entries) => WorkspaceResponse {
                        entries,
                        ..WorkspaceResponse::ok(request_id.as_str())
                    },
                    Err(e) => failed(request_id, "list_files", e),
                })
            }
            ServerMessage::ReadFile { request_id, path } => {
                AgentMessage::ReadFileResponse(match self.read(path).await {
                    Ok(content) => WorkspaceResponse {
                        content: Some(content),
                        ..WorkspaceResponse::ok(request_id.as_str())
                    },
                    Err(e) => failed(request_id, "read_file", e),
                })
            }
            ServerMessage::WriteFile {
                request_id,
                path,
                content,
            } => AgentMessage::WriteFileResponse(respond(
                request_id,
                "write_file",
                self.write(path, content).await,
            )),
            ServerMessage::DeleteFile { request_id, path } => AgentMessage::DeleteFileResponse(
                respond(request_id, "delete_file", self.delete(path).await),
            ),
            ServerMessage::MakeDir { request_id, path } => AgentMessage::MakeDirResponse(respond(
                request_id,
                "make_dir",
                self.make_dir(path).await,
            )),
            _ => return None,
        };
        Some(response)
    }

    async fn root(&self) -> AgentResult<PathBuf> {
        let root = self.work_dir.path();
        tokio::fs::create_dir_all(&root).await?;
        Ok(root)
    }

    /// Entries of a directory, directories first, then by name.
    pub async fn list(&self, path: &str) -> AgentResult<Vec<FileEntry>> {
        let root = self.root().await?;
        let dir = resolve(&root, path)?;

        let mut entries = Vec::new();
        let mut reader = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = reader.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(e) => {
                    debug!(path = %entry.path().display(), "Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            entries.push(FileEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                path: display_path(&root, &entry.path()),
                is_dir: metadata.is_dir(),
                size: if metadata.is_dir() { 0 } else { metadata.len() },
                modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            });
        }
        entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
        Ok(entries)
    }

    pub async fn read(&self, path: &str) -> AgentResult<String> {
        let file = resolve(&self.root().await?, path)?;
        let metadata = tokio::fs::metadata(&file).await?;
        if metadata.is_dir() {
            return Err(AgentError::IoError(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is a directory", path),
            )));
        }
        if metadata.len() > MAX_READ_BYTES {
            return Err(AgentError::IoError(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} exceeds {} bytes", path, MAX_READ_BYTES),
            )));
        }
        Ok(tokio::fs::read_to_string(&file).await?)
    }

    /// Write `content`, creating parent directories as needed.
    pub async fn write(&self, path: &str, content: &str) -> AgentResult<()> {
        let root = self.root().await?;
        let file = resolve(&root, path)?;
        if file == root {
            return Err(AgentError::PathEscape(path.to_string()));
        }
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&file, content).await?;
        Ok(())
    }

    /// Remove a file, or a directory with everything in it.
    pub async fn delete(&self, path: &str) -> AgentResult<()> {
        let root = self.root().await?;
        let target = resolve(&root, path)?;
        if target == root {
            return Err(AgentError::PathEscape(path.to_string()));
        }
        if tokio::fs::metadata(&target).await?.is_dir() {
            tokio::fs::remove_dir_all(&target).await?;
        } else {
            tokio::fs::remove_file(&target).await?;
        }
        Ok(())
    }

    pub async fn make_dir(&self, path: &str) -> AgentResult<()> {
        let dir = resolve(&self.root().await?, path)?;
        tokio::fs::create_dir_all(&dir).await?;
        Ok(())
    }
}

fn failed(request_id: &str, operation: &str, error: AgentError) -> WorkspaceResponse {
    warn!(request_id, operation, "Workspace request failed: {}", error);
    WorkspaceResponse::failed(request_id, error.to_string())
}

fn respond(request_id: &str, operation: &str, result: AgentResult<()>) -> WorkspaceResponse {
    match result {
        Ok(()) => WorkspaceResponse::ok(request_id),
        Err(e) => failed(request_id, operation, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> WorkspaceService {
        WorkspaceService::new(WorkDir::new(dir.path()))
    }

    #[test]
    fn test_resolve_confines_paths() {
        let root = Path::new("/srv/work");
        assert_eq!(resolve(root, "a/b.txt").unwrap(), root.join("a/b.txt"));
        assert_eq!(resolve(root, "./a/../b").unwrap(), root.join("b"));
        assert_eq!(resolve(root, ".").unwrap(), root.to_path_buf());
        assert!(resolve(root, "../etc/passwd").is_err());
        assert!(resolve(root, "a/../../x").is_err());
        assert!(resolve(root, "/etc/passwd").is_err());
    }

    #[tokio::test]
    async fn test_write_read_list_delete() {
        let dir = TempDir::new().unwrap();
        let workspace = service(&dir);

        workspace.write("reports/out.txt", "hello").await.unwrap();
        workspace.make_dir("fixtures").await.unwrap();
        assert_eq!(workspace.read("reports/out.txt").await.unwrap(), "hello");

        let entries = workspace.list(".").await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["fixtures", "reports"]);

        let nested = workspace.list("reports").await.unwrap();
        assert_eq!(nested.len(), 1);
        assert_eq!(nested[0].path, "reports/out.txt");
        assert_eq!(nested[0].size, 5);
        assert!(!nested[0].is_dir);

        workspace.delete("reports").await.unwrap();
        assert!(workspace.read("reports/out.txt").await.is_err());
        assert!(workspace.delete(".").await.is_err());
    }

    #[tokio::test]
    async fn test_handle_reports_failures_in_response() {
        let dir = TempDir::new().unwrap();
        let workspace = service(&dir);

        let reply = workspace
            .handle(&ServerMessage::ReadFile {
                request_id: "r1".to_string(),
                path: "../secret".to_string(),
            })
            .await
            .unwrap();
        match reply {
            AgentMessage::ReadFileResponse(response) => {
                assert_eq!(response.request_id, "r1");
                assert!(!response.success);
                assert!(response.error.unwrap().contains("escapes"));
            }
            other => panic!("unexpected reply: {:?}", other),
        }

        let reply = workspace
            .handle(&ServerMessage::WriteFile {
                request_id: "r2".to_string(),
                path: "notes.md".to_string(),
                content: "# notes".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(reply.message_type(), "write_file_response");
        assert_eq!(reply.request_id(), Some("r2"));

        assert!(workspace
            .handle(&ServerMessage::CancelTask {
                task_id: "t".to_string()
            })
            .await
            .is_none());
    }
}
