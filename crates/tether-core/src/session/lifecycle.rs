//! Session create, restore, fork, share, rename and delete.
//!
//! Restoring a session materializes its blobs in a local task directory and
//! replays its git state. Each blob is handled on its own; a blob that fails
//! to download is logged and skipped.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future;
use serde_json::Value;

use super::persistence::SessionPersistenceManager;
use super::state::SessionStateManager;
use super::title::SessionTitleService;
use crate::error::{Error, Result};
use crate::git::GitStateService;
use crate::model::{
    BlobKind, CreateSessionRequest, GitRestoreState, RemoteSession, RestoredTask, SessionPage,
    ShareInfo,
};
use crate::ports::{HostMessenger, PathProvider, RemoteSessionStore, TaskDataProvider};
use crate::SESSION_SCHEMA_VERSION;

const EMPTY_ARRAY: &[u8] = b"[]";

/// Remote session CRUD plus local restore.
pub struct SessionLifecycleService {
    remote: Arc<dyn RemoteSessionStore>,
    host: Arc<dyn HostMessenger>,
    paths: Arc<dyn PathProvider>,
    tasks: Arc<dyn TaskDataProvider>,
    state: Arc<SessionStateManager>,
    persistence: Arc<SessionPersistenceManager>,
    titles: Arc<SessionTitleService>,
    git: GitStateService,
}

impl std::fmt::Debug for SessionLifecycleService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLifecycleService")
            .field("git", &self.git)
            .finish_non_exhaustive()
    }
}

impl SessionLifecycleService {
    /// Create a lifecycle service.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        remote: Arc<dyn RemoteSessionStore>,
        host: Arc<dyn HostMessenger>,
        paths: Arc<dyn PathProvider>,
        tasks: Arc<dyn TaskDataProvider>,
        state: Arc<SessionStateManager>,
        persistence: Arc<SessionPersistenceManager>,
        titles: Arc<SessionTitleService>,
        git: GitStateService,
    ) -> Self {
        Self {
            remote,
            host,
            paths,
            tasks,
            state,
            persistence,
            titles,
            git,
        }
    }

    /// Restore a remote session as a local task.
    ///
    /// With `rethrow`, failures are returned; otherwise they are logged and
    /// `Ok(None)` is returned.
    pub async fn restore_session(
        &self,
        session_id: &str,
        rethrow: bool,
    ) -> Result<Option<RestoredTask>> {
        match self.restore(session_id).await {
            Ok(task) => Ok(Some(task)),
            Err(e) if rethrow => Err(e),
            Err(e) => {
                tracing::error!(session_id, error = %e, "Failed to restore session");
                Ok(None)
            }
        }
    }

    async fn restore(&self, session_id: &str) -> Result<RestoredTask> {
        let session = self
            .remote
            .get_session(session_id, true)
            .await?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;

        if session.version != SESSION_SCHEMA_VERSION {
            tracing::warn!(
                session_id,
                stored = session.version,
                expected = SESSION_SCHEMA_VERSION,
                "Session schema version mismatch"
            );
        }

        let task_id = session.session_id.clone();
        let task_dir = self.paths.task_dir(&task_id);
        tokio::fs::create_dir_all(&task_dir).await?;

        let fetches = BlobKind::ALL.into_iter().filter_map(|kind| {
            let url = session.blob_url(kind)?;
            Some(async move { (kind, self.remote.fetch_blob(url).await) })
        });

        let mut written = HashSet::new();
        for (kind, result) in future::join_all(fetches).await {
            let data = match result {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!(session_id, blob = %kind, error = %e, "Failed to fetch blob");
                    continue;
                }
            };
            if self.materialize(&task_dir, kind, &data).await {
                written.insert(kind);
            }
        }

        for kind in BlobKind::ALL {
            if !kind.needs_placeholder() || written.contains(&kind) {
                continue;
            }
            if let Some(path) = blob_path(&task_dir, kind) {
                tokio::fs::write(&path, EMPTY_ARRAY).await?;
            }
        }

        let title = session.non_empty_title().map(str::to_string);
        let restored = RestoredTask {
            task_id: task_id.clone(),
            session_id: session.session_id.clone(),
            title: title.clone(),
            task_dir,
            updated_at: session.updated_at.clone(),
        };
        self.host.register_restored_task(restored.clone()).await?;

        self.state.mark_verified(&session.session_id).await;
        self.state
            .set_active_session_id(Some(session.session_id.clone()))
            .await;
        self.state
            .set_session_for_task(&task_id, &session.session_id)
            .await;
        self.state
            .update_timestamp(&session.session_id, &session.updated_at)
            .await;
        self.state.set_mode(&session.session_id, session.mode.clone()).await;
        self.state
            .set_model(&session.session_id, session.model.clone())
            .await;
        if let Some(title) = &title {
            self.state.set_title(&session.session_id, title.as_str()).await;
        }

        let now = chrono::Utc::now().timestamp_millis();
        self.persistence
            .set_last_session(&session.session_id, now)
            .await?;
        self.persistence
            .set_session_for_task(&task_id, &session.session_id)
            .await?;

        tracing::info!(session_id, "Restored session");
        Ok(restored)
    }

    /// Write or replay one downloaded blob. Returns whether a local file was written.
    async fn materialize(&self, task_dir: &Path, kind: BlobKind, data: &[u8]) -> bool {
        match kind {
            BlobKind::GitState => {
                if !self.git.is_enabled() {
                    tracing::debug!("Git restore disabled, ignoring git state");
                    return false;
                }
                match serde_json::from_slice::<GitRestoreState>(data) {
                    Ok(state) => {
                        let report = self.git.execute_git_restore(&state).await;
                        tracing::debug!(?report, "Git state restored");
                    }
                    Err(e) => tracing::warn!(error = %e, "Invalid git state blob"),
                }
                false
            }
            BlobKind::UiMessages => {
                let filtered = without_checkpoints(data);
                write_blob(task_dir, kind, filtered.as_deref().unwrap_or(data)).await
            }
            BlobKind::ApiConversationHistory | BlobKind::TaskMetadata => {
                write_blob(task_dir, kind, data).await
            }
        }
    }

    /// Session of a task, creating and seeding one when none exists.
    ///
    /// A mapped session is verified against the remote store once per
    /// process; if it is gone a new one is created.
    pub async fn get_or_create_session_for_task(&self, task_id: &str) -> Result<String> {
        if let Some(session_id) = self.persistence.get_session_for_task(task_id).await {
            if self.state.is_verified(&session_id).await {
                return Ok(session_id);
            }
            match self.remote.get_session(&session_id, false).await {
                Ok(Some(_)) => {
                    self.state.mark_verified(&session_id).await;
                    self.state.set_session_for_task(task_id, &session_id).await;
                    return Ok(session_id);
                }
                Ok(None) => {
                    tracing::info!(task_id, session_id = %session_id, "Mapped session no longer exists");
                }
                Err(e) => {
                    tracing::warn!(task_id, session_id = %session_id, error = %e, "Could not verify mapped session");
                }
            }
        }

        self.create_session_for_task(task_id).await
    }

    async fn create_session_for_task(&self, task_id: &str) -> Result<String> {
        let info = self.tasks.task_info(task_id).await?;
        let history = read_optional(info.files.api_conversation_history.as_deref()).await?;
        let ui_messages = read_optional(info.files.ui_messages.as_deref()).await?;

        let messages: Vec<Value> = ui_messages
            .as_deref()
            .and_then(|data| serde_json::from_slice(data).ok())
            .unwrap_or_default();
        let title = info
            .title_hint
            .as_deref()
            .map(str::trim)
            .filter(|hint| !hint.is_empty())
            .map(str::to_string)
            .or_else(|| SessionTitleService::first_message_text(&messages, true));

        let parent_session_id = match &info.parent_task_id {
            Some(parent) => self.persistence.get_session_for_task(parent).await,
            None => None,
        };

        let git_url = self.state.git_url(task_id).await;
        let created = self
            .remote
            .create_session(CreateSessionRequest {
                title: title.clone(),
                git_url,
                mode: info.mode.clone(),
                model: info.model.clone(),
                parent_session_id,
                organization_id: info.organization_id.clone(),
                version: SESSION_SCHEMA_VERSION,
            })
            .await?;
        let session_id = created.session_id;
        tracing::info!(task_id, session_id = %session_id, "Created session for task");

        self.state.set_session_for_task(task_id, &session_id).await;
        self.state.mark_verified(&session_id).await;
        self.state
            .update_timestamp(&session_id, &created.updated_at)
            .await;
        self.state.set_mode(&session_id, info.mode).await;
        self.state.set_model(&session_id, info.model).await;
        if let Some(title) = title {
            self.state.set_title(&session_id, title).await;
        }
        self.persistence
            .set_session_for_task(task_id, &session_id)
            .await?;

        for (kind, data) in [
            (BlobKind::ApiConversationHistory, history),
            (BlobKind::UiMessages, ui_messages),
        ] {
            let body = data.unwrap_or_else(|| EMPTY_ARRAY.to_vec());
            let receipt = self.remote.upload_blob(&session_id, kind, body).await?;
            self.state
                .update_timestamp(&session_id, &receipt.updated_at)
                .await;
        }

        Ok(session_id)
    }

    /// Fork a session remotely and restore the fork locally.
    pub async fn fork_session(&self, session_id: Option<&str>) -> Result<RestoredTask> {
        let session_id = self.resolve_session_id(session_id).await?;
        let forked = self.remote.fork_session(&session_id).await?;
        tracing::info!(
            session_id = %session_id,
            fork_id = %forked.session_id,
            "Forked session"
        );

        self.restore_session(&forked.session_id, true)
            .await?
            .ok_or_else(|| Error::SessionNotFound(forked.session_id.clone()))
    }

    /// Create a share link for a session.
    pub async fn share_session(&self, session_id: Option<&str>) -> Result<ShareInfo> {
        let session_id = self.resolve_session_id(session_id).await?;
        self.remote.share_session(&session_id).await
    }

    /// Rename a session.
    pub async fn rename_session(&self, session_id: Option<&str>, title: &str) -> Result<()> {
        if title.trim().is_empty() {
            return Err(Error::InvalidTitle);
        }
        let session_id = self.resolve_session_id(session_id).await?;
        self.titles.update_title(&session_id, title).await
    }

    /// Fetch a session record.
    pub async fn get_session(&self, session_id: &str) -> Result<RemoteSession> {
        self.remote
            .get_session(session_id, false)
            .await?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    /// One page of the user's sessions.
    pub async fn list_sessions(&self, limit: usize, cursor: Option<&str>) -> Result<SessionPage> {
        self.remote.list_sessions(limit, cursor).await
    }

    /// Sessions matching a search query.
    pub async fn search_sessions(&self, query: &str, limit: usize) -> Result<Vec<RemoteSession>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        self.remote.search_sessions(query, limit).await
    }

    /// Delete a session remotely and forget it locally.
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.remote.delete_session(session_id).await?;
        let tasks = self.state.tasks_for_session(session_id).await;
        self.state.forget_session(session_id).await;
        self.persistence.remove_session(session_id).await?;
        tracing::info!(session_id, tasks = ?tasks, "Deleted session");
        Ok(())
    }

    async fn resolve_session_id(&self, session_id: Option<&str>) -> Result<String> {
        if let Some(id) = session_id.map(str::trim).filter(|id| !id.is_empty()) {
            return Ok(id.to_string());
        }
        self.state
            .active_session_id()
            .await
            .ok_or(Error::NoActiveSession)
    }
}

fn blob_path(task_dir: &Path, kind: BlobKind) -> Option<PathBuf> {
    kind.file_name().map(|name| task_dir.join(name))
}

async fn write_blob(task_dir: &Path, kind: BlobKind, data: &[u8]) -> bool {
    let Some(path) = blob_path(task_dir, kind) else {
        return false;
    };
    match tokio::fs::write(&path, data).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to write restored blob");
            false
        }
    }
}

async fn read_optional(path: Option<&Path>) -> Result<Option<Vec<u8>>> {
    let Some(path) = path else {
        return Ok(None);
    };
    match tokio::fs::read(path).await {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// UI messages with transient checkpoint entries removed.
///
/// Returns `None` when the data is not a JSON array, so it is kept as is.
fn without_checkpoints(data: &[u8]) -> Option<Vec<u8>> {
    let mut messages: Vec<Value> = serde_json::from_slice(data).ok()?;
    messages.retain(|message| {
        !message
            .get("say")
            .and_then(Value::as_str)
            .is_some_and(|say| say.starts_with("checkpoint"))
    });
    serde_json::to_vec(&messages).ok()
}
