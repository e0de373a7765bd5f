//! Capability traits implemented by the host.
//!
//! The engine never talks to the network, the UI or the model directly. It
//! receives these handles at construction time and calls through them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{
    BlobKind, BlobUploadReceipt, CreateSessionRequest, HostMessage, RemoteSession, RestoredTask,
    SessionPage, ShareInfo, TaskInfo, UpdateSessionRequest,
};

/// Remote session store client.
#[async_trait]
pub trait RemoteSessionStore: Send + Sync {
    /// Bearer token the client currently authenticates with.
    fn current_token(&self) -> Option<String>;

    /// Ask the server whether a token is still accepted.
    async fn validate_token(&self, token: &str) -> Result<bool>;

    /// Fetch a session; `Ok(None)` when it does not exist.
    ///
    /// With `include_blob_urls`, the returned record carries signed download URLs.
    async fn get_session(
        &self,
        session_id: &str,
        include_blob_urls: bool,
    ) -> Result<Option<RemoteSession>>;

    /// Create a session.
    async fn create_session(&self, request: CreateSessionRequest) -> Result<RemoteSession>;

    /// Update selected fields of a session.
    async fn update_session(&self, request: UpdateSessionRequest) -> Result<RemoteSession>;

    /// List sessions, newest first.
    async fn list_sessions(&self, limit: usize, cursor: Option<&str>) -> Result<SessionPage>;

    /// Full-text search over session titles.
    async fn search_sessions(&self, query: &str, limit: usize) -> Result<Vec<RemoteSession>>;

    /// Make a session publicly shareable.
    async fn share_session(&self, session_id: &str) -> Result<ShareInfo>;

    /// Copy a session (by session or share id) into a new session owned by the caller.
    async fn fork_session(&self, id: &str) -> Result<RemoteSession>;

    /// Delete a session.
    async fn delete_session(&self, session_id: &str) -> Result<()>;

    /// Upload blob content through a signed upload URL.
    async fn upload_blob(
        &self,
        session_id: &str,
        blob: BlobKind,
        content: Vec<u8>,
    ) -> Result<BlobUploadReceipt>;

    /// Download blob content from a signed URL.
    async fn fetch_blob(&self, url: &str) -> Result<Vec<u8>>;
}

/// Filesystem locations used by the engine.
pub trait PathProvider: Send + Sync {
    /// Root directory holding one sub-directory per task.
    fn task_storage_dir(&self) -> PathBuf;

    /// Per-workspace JSON state file.
    fn workspace_state_path(&self) -> PathBuf;

    /// Working tree whose git state is captured and restored.
    fn workspace_dir(&self) -> PathBuf;

    /// Directory of a single task.
    fn task_dir(&self, task_id: &str) -> PathBuf {
        self.task_storage_dir().join(task_id)
    }
}

/// Channel back into the host application.
#[async_trait]
pub trait HostMessenger: Send + Sync {
    /// Push a typed message to the UI.
    fn post_message(&self, message: HostMessage);

    /// Request one LLM completion; the host must give up after `timeout`.
    async fn request_completion(&self, prompt: &str, timeout: Duration) -> Result<String>;

    /// Tell the host a task now exists locally after a restore.
    async fn register_restored_task(&self, task: RestoredTask) -> Result<()>;
}

/// Lookup of host task data.
#[async_trait]
pub trait TaskDataProvider: Send + Sync {
    /// Metadata and conversation file paths for a task.
    async fn task_info(&self, task_id: &str) -> Result<TaskInfo>;
}

/// Plain filesystem [`PathProvider`].
#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    task_storage_dir: PathBuf,
    workspace_state_path: PathBuf,
    workspace_dir: PathBuf,
}

impl WorkspacePaths {
    /// Create paths from explicit locations.
    #[must_use]
    pub fn new(
        task_storage_dir: impl Into<PathBuf>,
        workspace_state_path: impl Into<PathBuf>,
        workspace_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            task_storage_dir: task_storage_dir.into(),
            workspace_state_path: workspace_state_path.into(),
            workspace_dir: workspace_dir.into(),
        }
    }

    /// Default locations for a workspace under the platform data directory.
    ///
    /// The state file name is derived from a hash of the workspace path so
    /// each workspace gets its own document.
    #[must_use]
    pub fn for_workspace(workspace_dir: &Path) -> Self {
        let data_dir = directories::ProjectDirs::from("dev", "tether", "Tether")
            .map_or_else(|| PathBuf::from(".tether"), |dirs| dirs.data_dir().to_path_buf());

        let key = xxhash_rust::xxh64::xxh64(workspace_dir.to_string_lossy().as_bytes(), 0);

        Self {
            task_storage_dir: data_dir.join("tasks"),
            workspace_state_path: data_dir
                .join("workspaces")
                .join(format!("{key:016x}.json")),
            workspace_dir: workspace_dir.to_path_buf(),
        }
    }
}

impl PathProvider for WorkspacePaths {
    fn task_storage_dir(&self) -> PathBuf {
        self.task_storage_dir.clone()
    }

    fn workspace_state_path(&self) -> PathBuf {
        self.workspace_state_path.clone()
    }

    fn workspace_dir(&self) -> PathBuf {
        self.workspace_dir.clone()
    }
}
