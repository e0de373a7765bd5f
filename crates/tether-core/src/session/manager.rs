//! Session facade.
//!
//! [`SessionManager`] owns every session service and is what a host talks
//! to: it records file saves, runs syncs and exposes session operations.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::lifecycle::SessionLifecycleService;
use super::persistence::SessionPersistenceManager;
use super::state::SessionStateManager;
use super::title::SessionTitleService;
use crate::config::Config;
use crate::error::Result;
use crate::git::GitStateService;
use crate::model::{
    BlobKind, RemoteSession, RestoredTask, SessionPage, ShareInfo, SyncQueueItem,
};
use crate::ports::{HostMessenger, PathProvider, RemoteSessionStore, TaskDataProvider};
use crate::sync::{SessionSyncService, SyncQueue, SyncReport};
use crate::token::TokenValidationService;
use crate::DEFAULT_SYNC_INTERVAL_SECS;

/// Background periodic sync. Dropping it stops the loop.
#[derive(Debug)]
pub struct PeriodicSync {
    handle: JoinHandle<()>,
}

impl PeriodicSync {
    /// Stop the loop.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for PeriodicSync {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Entry point wiring the session services together.
pub struct SessionManager {
    config: Config,
    queue: Arc<SyncQueue>,
    state: Arc<SessionStateManager>,
    persistence: Arc<SessionPersistenceManager>,
    token: Arc<TokenValidationService>,
    sync: Arc<SessionSyncService>,
    lifecycle: SessionLifecycleService,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("config", &self.config)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Build every service from `config` and the host's capabilities.
    ///
    /// The queue's flush handler holds a weak reference to the sync service
    /// and starts a non-forced sync in the background.
    pub async fn new(
        config: Config,
        remote: Arc<dyn RemoteSessionStore>,
        paths: Arc<dyn PathProvider>,
        host: Arc<dyn HostMessenger>,
        tasks: Arc<dyn TaskDataProvider>,
    ) -> Arc<Self> {
        let queue = Arc::new(SyncQueue::new(config.sync.flush_threshold));
        let state = Arc::new(SessionStateManager::new());
        let persistence = Arc::new(SessionPersistenceManager::new(
            paths.workspace_state_path(),
            Arc::clone(&state),
        ));
        let token = Arc::new(TokenValidationService::new(Arc::clone(&remote)));
        let titles = Arc::new(SessionTitleService::new(
            Arc::clone(&remote),
            Arc::clone(&host),
            Arc::clone(&state),
            config.title.clone(),
        ));
        let git = GitStateService::new(paths.workspace_dir(), config.git.clone());

        let sync = Arc::new(SessionSyncService::new(
            Arc::clone(&queue),
            Arc::clone(&state),
            Arc::clone(&persistence),
            Arc::clone(&titles),
            Arc::clone(&token),
            git.clone(),
            Arc::clone(&remote),
            Arc::clone(&host),
            Arc::clone(&tasks),
            config.sync.clone(),
        ));

        let lifecycle = SessionLifecycleService::new(
            remote,
            host,
            paths,
            tasks,
            Arc::clone(&state),
            Arc::clone(&persistence),
            titles,
            git,
        );

        let weak = Arc::downgrade(&sync);
        queue
            .set_flush_handler(Arc::new(move || {
                if let Some(sync) = weak.upgrade() {
                    tokio::spawn(async move {
                        sync.do_sync(false).await;
                    });
                }
            }))
            .await;

        Arc::new(Self {
            config,
            queue,
            state,
            persistence,
            token,
            sync,
            lifecycle,
        })
    }

    /// Configuration the manager was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The upload queue.
    pub fn queue(&self) -> &Arc<SyncQueue> {
        &self.queue
    }

    /// The sync service.
    pub fn sync_service(&self) -> &Arc<SessionSyncService> {
        &self.sync
    }

    /// The persisted workspace state.
    pub fn persistence(&self) -> &Arc<SessionPersistenceManager> {
        &self.persistence
    }

    /// Record that a task's conversation file was written.
    pub async fn handle_file_saved(
        &self,
        task_id: &str,
        blob: BlobKind,
        path: impl Into<PathBuf>,
    ) -> SyncQueueItem {
        self.queue.enqueue(task_id, blob, path).await
    }

    /// Sync, joining a pass that is already running.
    pub async fn sync(&self) -> SyncReport {
        self.sync.do_sync(false).await
    }

    /// Sync, waiting for a running pass and then draining what is left.
    pub async fn force_sync(&self) -> SyncReport {
        self.sync.do_sync(true).await
    }

    /// Restore a remote session as a local task.
    pub async fn restore_session(
        &self,
        session_id: &str,
        rethrow: bool,
    ) -> Result<Option<RestoredTask>> {
        self.lifecycle.restore_session(session_id, rethrow).await
    }

    /// Restore the persisted last session unless it is already active.
    pub async fn restore_last_session(&self) -> Result<Option<RestoredTask>> {
        let Some(last) = self.persistence.get_last_session().await else {
            return Ok(None);
        };
        if self.state.active_session_id().await.as_deref() == Some(last.session_id.as_str()) {
            return Ok(None);
        }
        tracing::debug!(session_id = %last.session_id, "Restoring last session");
        self.lifecycle.restore_session(&last.session_id, false).await
    }

    /// Session of a task, created when missing.
    pub async fn get_or_create_session_for_task(&self, task_id: &str) -> Result<String> {
        self.lifecycle.get_or_create_session_for_task(task_id).await
    }

    /// Share a session, the active one when `session_id` is `None`.
    pub async fn share_session(&self, session_id: Option<&str>) -> Result<ShareInfo> {
        self.lifecycle.share_session(session_id).await
    }

    /// Rename a session, the active one when `session_id` is `None`.
    pub async fn rename_session(&self, session_id: Option<&str>, title: &str) -> Result<()> {
        self.lifecycle.rename_session(session_id, title).await
    }

    /// Fork a session, the active one when `session_id` is `None`.
    pub async fn fork_session(&self, session_id: Option<&str>) -> Result<RestoredTask> {
        self.lifecycle.fork_session(session_id).await
    }

    /// Fetch a session record.
    pub async fn get_session(&self, session_id: &str) -> Result<RemoteSession> {
        self.lifecycle.get_session(session_id).await
    }

    /// One page of sessions.
    pub async fn list_sessions(&self, limit: usize, cursor: Option<&str>) -> Result<SessionPage> {
        self.lifecycle.list_sessions(limit, cursor).await
    }

    /// Sessions matching a query.
    pub async fn search_sessions(&self, query: &str, limit: usize) -> Result<Vec<RemoteSession>> {
        self.lifecycle.search_sessions(query, limit).await
    }

    /// Delete a session.
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.lifecycle.delete_session(session_id).await
    }

    /// Currently active session.
    pub async fn active_session_id(&self) -> Option<String> {
        self.state.active_session_id().await
    }

    /// Session a task maps to, in memory or persisted.
    pub async fn session_for_task(&self, task_id: &str) -> Option<String> {
        self.persistence.get_session_for_task(task_id).await
    }

    /// Sync every `[sync] interval` until the returned handle is dropped.
    pub fn start_periodic_sync(self: &Arc<Self>) -> PeriodicSync {
        let period = if self.config.sync.interval.is_zero() {
            Duration::from_secs(DEFAULT_SYNC_INTERVAL_SECS)
        } else {
            self.config.sync.interval
        };
        let weak = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                let report = manager.sync().await;
                tracing::trace!(?report, "Periodic sync");
            }
        });

        tracing::debug!(interval_secs = period.as_secs(), "Started periodic sync");
        PeriodicSync { handle }
    }

    /// Forget all session state, pending uploads and token checks.
    pub async fn logout(&self) {
        self.state.reset().await;
        self.queue.clear().await;
        self.token.clear().await;
        tracing::info!("Session state cleared");
    }
}
