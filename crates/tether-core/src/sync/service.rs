//! Sync passes.
//!
//! A pass drains the [`SyncQueue`]: for each task with pending items it makes
//! sure a remote session exists, uploads the newest version of every changed
//! blob, uploads the git state when it changed, and tells the host. Callers
//! that arrive while a pass is running share its result instead of starting
//! another one.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt, Shared};
use serde_json::Value;
use tokio::sync::Mutex;

use super::queue::SyncQueue;
use crate::config::SyncSettings;
use crate::error::{Error, Result};
use crate::git::GitStateService;
use crate::model::{
    BlobKind, CreateSessionRequest, GitState, HostMessage, SyncQueueItem, TaskInfo,
    UpdateSessionRequest,
};
use crate::ports::{HostMessenger, RemoteSessionStore, TaskDataProvider};
use crate::session::persistence::SessionPersistenceManager;
use crate::session::state::SessionStateManager;
use crate::session::title::SessionTitleService;
use crate::token::TokenValidationService;
use crate::SESSION_SCHEMA_VERSION;

type PendingPass = Shared<BoxFuture<'static, SyncReport>>;

/// Why a pass did no work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Nothing was queued
    Empty,
    /// Sync is disabled; the queue was cleared
    Disabled,
    /// No auth token is available
    NoToken,
    /// The auth token was rejected
    InvalidToken,
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Tasks whose pending items were all handled
    pub tasks_synced: usize,
    /// Tasks with at least one failure
    pub tasks_failed: usize,
    /// Blobs uploaded, git state included
    pub blobs_uploaded: usize,
    /// Set when the pass was skipped
    pub skipped: Option<SkipReason>,
}

impl SyncReport {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
struct TaskOutcome {
    uploaded: usize,
    errors: Vec<Error>,
}

/// Drains the sync queue into the remote store.
pub struct SessionSyncService {
    queue: Arc<SyncQueue>,
    state: Arc<SessionStateManager>,
    persistence: Arc<SessionPersistenceManager>,
    titles: Arc<SessionTitleService>,
    token: Arc<TokenValidationService>,
    git: GitStateService,
    remote: Arc<dyn RemoteSessionStore>,
    host: Arc<dyn HostMessenger>,
    tasks: Arc<dyn TaskDataProvider>,
    settings: SyncSettings,
    pending: Mutex<Option<PendingPass>>,
    passes: AtomicU64,
}

impl std::fmt::Debug for SessionSyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSyncService")
            .field("settings", &self.settings)
            .field("passes", &self.passes.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl SessionSyncService {
    /// Create a sync service over shared session components.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        queue: Arc<SyncQueue>,
        state: Arc<SessionStateManager>,
        persistence: Arc<SessionPersistenceManager>,
        titles: Arc<SessionTitleService>,
        token: Arc<TokenValidationService>,
        git: GitStateService,
        remote: Arc<dyn RemoteSessionStore>,
        host: Arc<dyn HostMessenger>,
        tasks: Arc<dyn TaskDataProvider>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            queue,
            state,
            persistence,
            titles,
            token,
            git,
            remote,
            host,
            tasks,
            settings,
            pending: Mutex::new(None),
            passes: AtomicU64::new(0),
        }
    }

    /// Number of passes started so far.
    pub fn pass_count(&self) -> u64 {
        self.passes.load(Ordering::SeqCst)
    }

    /// Run a sync pass, sharing one that is already running.
    ///
    /// Without `force`, a caller arriving during a pass gets that pass's
    /// report. With `force`, it waits for the running pass and then starts a
    /// new one only if items are still queued. Passes never overlap.
    pub async fn do_sync(self: &Arc<Self>, force: bool) -> SyncReport {
        loop {
            let running = self.pending.lock().await.clone();
            if let Some(pass) = running {
                let report = pass.await;
                if !force {
                    return report;
                }
                if self.queue.is_empty().await {
                    return SyncReport::skipped(SkipReason::Empty);
                }
                continue;
            }

            let pass = {
                let mut slot = self.pending.lock().await;
                if slot.is_some() {
                    continue;
                }
                let pass = self.spawn_pass();
                *slot = Some(pass.clone());
                pass
            };
            return pass.await;
        }
    }

    /// Start a pass on the runtime. The pass clears the pending slot when
    /// done, including when it panics.
    fn spawn_pass(self: &Arc<Self>) -> PendingPass {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let report = AssertUnwindSafe(this.run_pass())
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    tracing::error!(panic = panic_message(&*panic), "Sync pass panicked");
                    SyncReport::default()
                });
            // Only this pass can occupy the slot until it is cleared here.
            *this.pending.lock().await = None;
            report
        });

        async move {
            handle.await.unwrap_or_else(|e| {
                tracing::error!(error = %e, "Sync pass aborted");
                SyncReport::default()
            })
        }
        .boxed()
        .shared()
    }

    async fn run_pass(&self) -> SyncReport {
        if self.queue.is_empty().await {
            return SyncReport::skipped(SkipReason::Empty);
        }

        if !self.settings.enabled {
            tracing::debug!("Sync disabled, dropping queued items");
            self.queue.clear().await;
            return SyncReport::skipped(SkipReason::Disabled);
        }

        match self.token.is_valid().await {
            None => {
                tracing::debug!("No auth token, skipping sync");
                return SyncReport::skipped(SkipReason::NoToken);
            }
            Some(false) => {
                tracing::info!("Auth token invalid, skipping sync");
                return SyncReport::skipped(SkipReason::InvalidToken);
            }
            Some(true) => {}
        }

        let pass = self.passes.fetch_add(1, Ordering::SeqCst) + 1;
        let last_item = self.queue.last_item().await;
        let git_state = if self.git.is_enabled() {
            self.git.get_git_state().await
        } else {
            None
        };

        let task_ids = self.queue.unique_task_ids().await;
        tracing::debug!(pass, tasks = task_ids.len(), "Starting sync pass");

        let mut report = SyncReport::default();
        for task_id in &task_ids {
            let outcome = self.sync_task(task_id, git_state.as_ref()).await;
            report.blobs_uploaded += outcome.uploaded;

            if outcome.errors.is_empty() {
                report.tasks_synced += 1;
                continue;
            }

            report.tasks_failed += 1;
            for e in &outcome.errors {
                if e.is_recoverable() {
                    tracing::info!(
                        task_id = %task_id,
                        error = %e,
                        "Task sync failed, retrying next pass"
                    );
                } else {
                    tracing::warn!(task_id = %task_id, error = %e, "Task sync failed");
                }
            }
            if outcome.errors.iter().any(Error::is_auth_error) {
                self.token.invalidate_cache().await;
            }
        }

        if let Some(item) = last_item {
            self.record_last_session(&item).await;
        }

        tracing::info!(
            pass,
            tasks_synced = report.tasks_synced,
            tasks_failed = report.tasks_failed,
            blobs_uploaded = report.blobs_uploaded,
            "Sync pass finished"
        );
        report
    }

    async fn sync_task(&self, task_id: &str, git_state: Option<&GitState>) -> TaskOutcome {
        let mut outcome = TaskOutcome::default();

        let info = match self.tasks.task_info(task_id).await {
            Ok(info) => info,
            Err(e) => {
                outcome.errors.push(e);
                return outcome;
            }
        };

        let git_url = git_state.and_then(|g| g.repo_url.clone());
        let session_id = match self.ensure_session(task_id, &info, git_url).await {
            Ok(id) => id,
            Err(e) => {
                outcome.errors.push(e);
                return outcome;
            }
        };

        let (uploaded, errors) = self.upload_blobs(task_id, &session_id).await;
        outcome.uploaded += uploaded;
        outcome.errors.extend(errors);

        if let Some(git_state) = git_state {
            match self.upload_git_state(task_id, &session_id, git_state).await {
                Ok(true) => outcome.uploaded += 1,
                Ok(false) => {}
                Err(e) => outcome.errors.push(e),
            }
        }

        if outcome.errors.is_empty() {
            self.host.post_message(HostMessage::SessionSynced {
                session_id: session_id.clone(),
                updated_at: self.state.updated_at(&session_id).await,
            });
        }

        outcome
    }

    /// Session of `task_id`, created on first sync and updated when its
    /// git URL, mode or model changed.
    async fn ensure_session(
        &self,
        task_id: &str,
        info: &TaskInfo,
        git_url: Option<String>,
    ) -> Result<String> {
        let Some(session_id) = self.persistence.get_session_for_task(task_id).await else {
            return self.create_session(task_id, info, git_url).await;
        };

        let url_changed = git_url.is_some() && self.state.git_url(task_id).await != git_url;
        let mode_changed = info.mode.is_some() && self.state.mode(&session_id).await != info.mode;
        let model_changed =
            info.model.is_some() && self.state.model(&session_id).await != info.model;

        if url_changed || mode_changed || model_changed {
            tracing::debug!(
                task_id,
                session_id = %session_id,
                url_changed,
                mode_changed,
                model_changed,
                "Updating session metadata"
            );
            let updated = self
                .remote
                .update_session(UpdateSessionRequest {
                    session_id: session_id.clone(),
                    title: None,
                    git_url: git_url.clone(),
                    mode: info.mode.clone(),
                    model: info.model.clone(),
                })
                .await?;
            self.state
                .update_timestamp(&session_id, &updated.updated_at)
                .await;
            self.state.set_git_url(task_id, git_url).await;
            self.state.set_mode(&session_id, info.mode.clone()).await;
            self.state.set_model(&session_id, info.model.clone()).await;
        }

        self.state.set_session_for_task(task_id, &session_id).await;
        Ok(session_id)
    }

    async fn create_session(
        &self,
        task_id: &str,
        info: &TaskInfo,
        git_url: Option<String>,
    ) -> Result<String> {
        let parent_session_id = match &info.parent_task_id {
            Some(parent) => self.persistence.get_session_for_task(parent).await,
            None => None,
        };

        let created = self
            .remote
            .create_session(CreateSessionRequest {
                title: None,
                git_url: git_url.clone(),
                mode: info.mode.clone(),
                model: info.model.clone(),
                parent_session_id,
                organization_id: info.organization_id.clone(),
                version: SESSION_SCHEMA_VERSION,
            })
            .await?;

        let session_id = created.session_id;
        tracing::info!(task_id, session_id = %session_id, "Created remote session");

        self.state.set_session_for_task(task_id, &session_id).await;
        self.state.mark_verified(&session_id).await;
        self.state
            .update_timestamp(&session_id, &created.updated_at)
            .await;
        self.state.set_git_url(task_id, git_url).await;
        self.state.set_mode(&session_id, info.mode.clone()).await;
        self.state.set_model(&session_id, info.model.clone()).await;
        if let Err(e) = self
            .persistence
            .set_session_for_task(task_id, &session_id)
            .await
        {
            tracing::warn!(task_id, error = %e, "Failed to persist task session mapping");
        }

        Ok(session_id)
    }

    /// Upload the newest queued version of each blob of a task, concurrently.
    async fn upload_blobs(&self, task_id: &str, session_id: &str) -> (usize, Vec<Error>) {
        let mut latest: Vec<SyncQueueItem> = Vec::new();
        let mut seen = HashSet::new();
        for item in self.queue.items_for_task(task_id).await {
            if seen.insert(item.blob) {
                if let Some(last) = self.queue.last_item_for_blob(task_id, item.blob).await {
                    latest.push(last);
                }
            }
        }

        let mut contents: HashMap<PathBuf, Arc<Vec<u8>>> = HashMap::new();
        let mut errors: Vec<Error> = Vec::new();
        let mut ready = Vec::with_capacity(latest.len());
        for item in latest {
            if let Some(data) = contents.get(&item.blob_path) {
                ready.push((item, Arc::clone(data)));
                continue;
            }
            match tokio::fs::read(&item.blob_path).await {
                Ok(data) => {
                    let data = Arc::new(data);
                    contents.insert(item.blob_path.clone(), Arc::clone(&data));
                    ready.push((item, data));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::warn!(
                        task_id,
                        path = %item.blob_path.display(),
                        "Queued file no longer exists, dropping"
                    );
                    self.queue
                        .remove_processed_items(task_id, item.blob, item.timestamp)
                        .await;
                }
                Err(e) => errors.push(e.into()),
            }
        }

        let uploads = ready
            .into_iter()
            .map(|(item, data)| self.upload_blob(session_id, item, data));
        let mut uploaded = 0;
        for result in future::join_all(uploads).await {
            match result {
                Ok(()) => uploaded += 1,
                Err(e) => errors.push(e),
            }
        }

        (uploaded, errors)
    }

    async fn upload_blob(
        &self,
        session_id: &str,
        item: SyncQueueItem,
        data: Arc<Vec<u8>>,
    ) -> Result<()> {
        let receipt = self
            .remote
            .upload_blob(session_id, item.blob, Vec::clone(&data))
            .await?;

        self.state
            .update_timestamp(session_id, &receipt.updated_at)
            .await;
        let removed = self
            .queue
            .remove_processed_items(&item.task_id, item.blob, item.timestamp)
            .await;
        tracing::debug!(
            session_id,
            blob = %item.blob,
            removed,
            "Uploaded blob"
        );

        if item.blob == BlobKind::UiMessages && !self.state.has_title(session_id).await {
            self.spawn_title_generation(session_id, &data);
        }

        Ok(())
    }

    fn spawn_title_generation(&self, session_id: &str, data: &[u8]) {
        let messages: Vec<Value> = match serde_json::from_slice(data) {
            Ok(messages) => messages,
            Err(e) => {
                tracing::debug!(session_id, error = %e, "UI messages are not a JSON array");
                return;
            }
        };

        let titles = Arc::clone(&self.titles);
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            titles.generate_and_update_title(&session_id, &messages).await;
        });
    }

    /// Upload the git state unless its hash matches the last upload for the task.
    async fn upload_git_state(
        &self,
        task_id: &str,
        session_id: &str,
        git_state: &GitState,
    ) -> Result<bool> {
        let hash = GitStateService::hash_git_state(git_state);
        if self.state.git_hash(task_id).await.as_deref() == Some(hash.as_str()) {
            tracing::trace!(task_id, "Git state unchanged");
            return Ok(false);
        }

        let body = serde_json::to_vec(git_state)?;
        let receipt = self
            .remote
            .upload_blob(session_id, BlobKind::GitState, body)
            .await?;

        self.state.set_git_hash(task_id, hash).await;
        self.state
            .update_timestamp(session_id, &receipt.updated_at)
            .await;
        tracing::debug!(task_id, session_id, "Uploaded git state");
        Ok(true)
    }

    async fn record_last_session(&self, item: &SyncQueueItem) {
        let Some(session_id) = self.state.session_for_task(&item.task_id).await else {
            return;
        };

        self.state.set_active_session_id(Some(session_id.clone())).await;
        let now = chrono::Utc::now().timestamp_millis();
        if let Err(e) = self.persistence.set_last_session(&session_id, now).await {
            tracing::warn!(session_id = %session_id, error = %e, "Failed to persist last session");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
