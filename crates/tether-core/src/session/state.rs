//! In-memory session state for the running process.
//!
//! Nothing here touches the disk or the network. Entries live until
//! [`SessionStateManager::reset`] (logout, test teardown).

use std::collections::{HashMap, HashSet};

use tokio::sync::Mutex;

/// Placeholder title stored while a title is being generated.
pub const PENDING_TITLE: &str = "\u{2026}";

#[derive(Debug, Default)]
struct StateInner {
    active_session_id: Option<String>,
    verified_sessions: HashSet<String>,
    task_git_urls: HashMap<String, String>,
    task_git_hashes: HashMap<String, String>,
    session_titles: HashMap<String, String>,
    session_updated_at: HashMap<String, String>,
    session_modes: HashMap<String, String>,
    session_models: HashMap<String, String>,
    task_sessions: HashMap<String, String>,
}

/// Keyed cache of per-task and per-session facts.
#[derive(Debug, Default)]
pub struct SessionStateManager {
    inner: Mutex<StateInner>,
}

impl SessionStateManager {
    /// Create an empty state manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Session the user is currently working in.
    pub async fn active_session_id(&self) -> Option<String> {
        self.inner.lock().await.active_session_id.clone()
    }

    /// Set or clear the active session.
    pub async fn set_active_session_id(&self, session_id: Option<String>) {
        self.inner.lock().await.active_session_id = session_id;
    }

    /// Whether the session was confirmed to exist remotely in this process.
    pub async fn is_verified(&self, session_id: &str) -> bool {
        self.inner.lock().await.verified_sessions.contains(session_id)
    }

    /// Remember that the session exists remotely.
    pub async fn mark_verified(&self, session_id: &str) {
        self.inner
            .lock()
            .await
            .verified_sessions
            .insert(session_id.to_string());
    }

    /// Git URL last synced for a task.
    pub async fn git_url(&self, task_id: &str) -> Option<String> {
        self.inner.lock().await.task_git_urls.get(task_id).cloned()
    }

    /// Record the git URL synced for a task; `None` forgets it.
    pub async fn set_git_url(&self, task_id: &str, url: Option<String>) {
        let mut inner = self.inner.lock().await;
        match url {
            Some(url) => inner.task_git_urls.insert(task_id.to_string(), url),
            None => inner.task_git_urls.remove(task_id),
        };
    }

    /// Hash of the git state last uploaded for a task.
    pub async fn git_hash(&self, task_id: &str) -> Option<String> {
        self.inner.lock().await.task_git_hashes.get(task_id).cloned()
    }

    /// Record the hash of the git state uploaded for a task.
    pub async fn set_git_hash(&self, task_id: &str, hash: impl Into<String>) {
        self.inner
            .lock()
            .await
            .task_git_hashes
            .insert(task_id.to_string(), hash.into());
    }

    /// Whether a session has a title or one is being generated.
    pub async fn has_title(&self, session_id: &str) -> bool {
        self.inner
            .lock()
            .await
            .session_titles
            .contains_key(session_id)
    }

    /// Set the title of a session.
    pub async fn set_title(&self, session_id: &str, title: impl Into<String>) {
        self.inner
            .lock()
            .await
            .session_titles
            .insert(session_id.to_string(), title.into());
    }

    /// Drop the title of a session.
    pub async fn clear_title(&self, session_id: &str) {
        self.inner.lock().await.session_titles.remove(session_id);
    }

    /// Set the title only if none is recorded. Returns whether it was set.
    pub async fn set_title_if_absent(&self, session_id: &str, title: impl Into<String>) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.session_titles.contains_key(session_id) {
            return false;
        }
        inner
            .session_titles
            .insert(session_id.to_string(), title.into());
        true
    }

    /// High-water mark of a session's modification time.
    pub async fn updated_at(&self, session_id: &str) -> Option<String> {
        self.inner
            .lock()
            .await
            .session_updated_at
            .get(session_id)
            .cloned()
    }

    /// Advance the high-water mark.
    ///
    /// The stored value is replaced only when `timestamp` is greater. ISO-8601
    /// timestamps in a fixed-width UTC format compare correctly as strings, so
    /// out-of-order upload confirmations never move the mark backwards.
    /// Returns whether the mark moved.
    pub async fn update_timestamp(&self, session_id: &str, timestamp: &str) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.session_updated_at.get(session_id) {
            Some(current) if current.as_str() >= timestamp => false,
            _ => {
                inner
                    .session_updated_at
                    .insert(session_id.to_string(), timestamp.to_string());
                true
            }
        }
    }

    /// Mode last synced for a session.
    pub async fn mode(&self, session_id: &str) -> Option<String> {
        self.inner.lock().await.session_modes.get(session_id).cloned()
    }

    /// Record the mode synced for a session.
    pub async fn set_mode(&self, session_id: &str, mode: Option<String>) {
        let mut inner = self.inner.lock().await;
        match mode {
            Some(mode) => inner.session_modes.insert(session_id.to_string(), mode),
            None => inner.session_modes.remove(session_id),
        };
    }

    /// Model last synced for a session.
    pub async fn model(&self, session_id: &str) -> Option<String> {
        self.inner.lock().await.session_models.get(session_id).cloned()
    }

    /// Record the model synced for a session.
    pub async fn set_model(&self, session_id: &str, model: Option<String>) {
        let mut inner = self.inner.lock().await;
        match model {
            Some(model) => inner.session_models.insert(session_id.to_string(), model),
            None => inner.session_models.remove(session_id),
        };
    }

    /// Session a task maps to in this process.
    pub async fn session_for_task(&self, task_id: &str) -> Option<String> {
        self.inner.lock().await.task_sessions.get(task_id).cloned()
    }

    /// Map a task to a session.
    pub async fn set_session_for_task(&self, task_id: &str, session_id: &str) {
        self.inner
            .lock()
            .await
            .task_sessions
            .insert(task_id.to_string(), session_id.to_string());
    }

    /// Tasks mapped to a session.
    pub async fn tasks_for_session(&self, session_id: &str) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut tasks: Vec<String> = inner
            .task_sessions
            .iter()
            .filter(|(_, sid)| sid.as_str() == session_id)
            .map(|(task, _)| task.clone())
            .collect();
        tasks.sort();
        tasks
    }

    /// Forget everything known about a session (after a remote delete).
    pub async fn forget_session(&self, session_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.verified_sessions.remove(session_id);
        inner.session_titles.remove(session_id);
        inner.session_updated_at.remove(session_id);
        inner.session_modes.remove(session_id);
        inner.session_models.remove(session_id);
        let tasks: Vec<String> = inner
            .task_sessions
            .iter()
            .filter(|(_, sid)| sid.as_str() == session_id)
            .map(|(task, _)| task.clone())
            .collect();
        for task in tasks {
            inner.task_sessions.remove(&task);
            inner.task_git_urls.remove(&task);
            inner.task_git_hashes.remove(&task);
        }
        if inner.active_session_id.as_deref() == Some(session_id) {
            inner.active_session_id = None;
        }
    }

    /// Clear all state.
    pub async fn reset(&self) {
        *self.inner.lock().await = StateInner::default();
    }
}
