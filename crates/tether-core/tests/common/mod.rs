//! Common test utilities for `tether-core` integration tests.
//!
//! In-memory implementations of the host capability traits plus a harness
//! that builds a [`SessionManager`] over them in a temporary directory.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;

use tether_core::config::Config;
use tether_core::model::{
    BlobKind, BlobUploadReceipt, CreateSessionRequest, HostMessage, RemoteSession, RestoredTask,
    SessionPage, ShareInfo, TaskFiles, TaskInfo, UpdateSessionRequest,
};
use tether_core::ports::{HostMessenger, RemoteSessionStore, TaskDataProvider, WorkspacePaths};
use tether_core::session::SessionManager;
use tether_core::{Error, Result};

/// Remote store kept in memory, recording every call.
#[derive(Debug, Default)]
pub struct MockRemote {
    pub token: Mutex<Option<String>>,
    pub token_accepted: Mutex<bool>,
    pub validate_error: Mutex<Option<String>>,
    pub validate_calls: AtomicUsize,
    pub get_calls: AtomicUsize,
    pub sessions: Mutex<HashMap<String, RemoteSession>>,
    pub blob_store: Mutex<HashMap<String, Vec<u8>>>,
    pub creates: Mutex<Vec<CreateSessionRequest>>,
    pub updates: Mutex<Vec<UpdateSessionRequest>>,
    pub uploads: Mutex<Vec<(String, BlobKind, Vec<u8>)>>,
    pub upload_error: Mutex<Option<String>>,
    pub upload_delay: Mutex<Option<Duration>>,
    pub uploads_started: AtomicUsize,
    /// Makes the next `upload_blob` call panic.
    pub panic_next_upload: AtomicBool,
    clock: AtomicUsize,
    next_id: AtomicUsize,
}

impl MockRemote {
    /// A remote that accepts the token `"test-token"`.
    pub fn new() -> Arc<Self> {
        let remote = Self::default();
        *remote.token.lock().unwrap() = Some("test-token".to_string());
        *remote.token_accepted.lock().unwrap() = true;
        Arc::new(remote)
    }

    /// Fixed-width ISO-8601 time that increases on every call.
    pub fn tick(&self) -> String {
        let n = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        format!("2026-01-01T00:{:02}:{:02}.000Z", n / 60, n % 60)
    }

    /// Store a session with the given blobs, exposed through signed URLs.
    pub fn insert_session(&self, mut session: RemoteSession, blobs: &[(BlobKind, &[u8])]) {
        for (kind, data) in blobs {
            let url = format!("https://blobs.test/{}/{}", session.session_id, kind.as_str());
            self.blob_store.lock().unwrap().insert(url.clone(), data.to_vec());
            match kind {
                BlobKind::ApiConversationHistory => {
                    session.api_conversation_history_blob_url = Some(url);
                }
                BlobKind::UiMessages => session.ui_messages_blob_url = Some(url),
                BlobKind::TaskMetadata => session.task_metadata_blob_url = Some(url),
                BlobKind::GitState => session.git_state_blob_url = Some(url),
            }
        }
        self.sessions
            .lock()
            .unwrap()
            .insert(session.session_id.clone(), session);
    }

    pub fn create_count(&self) -> usize {
        self.creates.lock().unwrap().len()
    }

    pub fn uploads_of(&self, kind: BlobKind) -> Vec<(String, Vec<u8>)> {
        self.uploads
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(id, _, data)| (id.clone(), data.clone()))
            .collect()
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }

    pub fn title_updates(&self) -> Vec<(String, String)> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .filter_map(|u| u.title.clone().map(|t| (u.session_id.clone(), t)))
            .collect()
    }

    fn new_session(&self, request: &CreateSessionRequest) -> RemoteSession {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.tick();
        RemoteSession {
            session_id: format!("session-{n}"),
            title: request.title.clone(),
            created_at: now.clone(),
            updated_at: now,
            git_url: request.git_url.clone(),
            mode: request.mode.clone(),
            model: request.model.clone(),
            parent_session_id: request.parent_session_id.clone(),
            organization_id: request.organization_id.clone(),
            version: request.version,
            ..Default::default()
        }
    }
}

#[async_trait]
impl RemoteSessionStore for MockRemote {
    fn current_token(&self) -> Option<String> {
        self.token.lock().unwrap().clone()
    }

    async fn validate_token(&self, _token: &str) -> Result<bool> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.validate_error.lock().unwrap().clone() {
            return Err(Error::Remote(message));
        }
        Ok(*self.token_accepted.lock().unwrap())
    }

    async fn get_session(
        &self,
        session_id: &str,
        include_blob_urls: bool,
    ) -> Result<Option<RemoteSession>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let session = self.sessions.lock().unwrap().get(session_id).cloned();
        Ok(session.map(|mut s| {
            if !include_blob_urls {
                s.api_conversation_history_blob_url = None;
                s.ui_messages_blob_url = None;
                s.task_metadata_blob_url = None;
                s.git_state_blob_url = None;
            }
            s
        }))
    }

    async fn create_session(&self, request: CreateSessionRequest) -> Result<RemoteSession> {
        let session = self.new_session(&request);
        self.creates.lock().unwrap().push(request);
        self.sessions
            .lock()
            .unwrap()
            .insert(session.session_id.clone(), session.clone());
        Ok(session)
    }

    async fn update_session(&self, request: UpdateSessionRequest) -> Result<RemoteSession> {
        let now = self.tick();
        self.updates.lock().unwrap().push(request.clone());
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(&request.session_id)
            .ok_or_else(|| Error::SessionNotFound(request.session_id.clone()))?;
        if request.title.is_some() {
            session.title = request.title;
        }
        if request.git_url.is_some() {
            session.git_url = request.git_url;
        }
        if request.mode.is_some() {
            session.mode = request.mode;
        }
        if request.model.is_some() {
            session.model = request.model;
        }
        session.updated_at = now;
        Ok(session.clone())
    }

    async fn list_sessions(&self, limit: usize, _cursor: Option<&str>) -> Result<SessionPage> {
        let mut sessions: Vec<RemoteSession> =
            self.sessions.lock().unwrap().values().cloned().collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        let next_cursor = (sessions.len() > limit).then(|| sessions[limit].session_id.clone());
        sessions.truncate(limit);
        Ok(SessionPage {
            sessions,
            next_cursor,
        })
    }

    async fn search_sessions(&self, query: &str, limit: usize) -> Result<Vec<RemoteSession>> {
        let query = query.to_lowercase();
        let mut found: Vec<RemoteSession> = self
            .sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| {
                s.title
                    .as_deref()
                    .is_some_and(|t| t.to_lowercase().contains(&query))
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        found.truncate(limit);
        Ok(found)
    }

    async fn share_session(&self, session_id: &str) -> Result<ShareInfo> {
        if !self.sessions.lock().unwrap().contains_key(session_id) {
            return Err(Error::SessionNotFound(session_id.to_string()));
        }
        Ok(ShareInfo {
            share_id: format!("share-{session_id}"),
            share_url: Some(format!("https://share.test/{session_id}")),
        })
    }

    async fn fork_session(&self, id: &str) -> Result<RemoteSession> {
        let source = self
            .sessions
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
        let mut fork = self.new_session(&CreateSessionRequest {
            title: source.title.clone(),
            parent_session_id: Some(id.to_string()),
            version: source.version,
            ..Default::default()
        });
        fork.api_conversation_history_blob_url = source.api_conversation_history_blob_url;
        fork.ui_messages_blob_url = source.ui_messages_blob_url;
        fork.task_metadata_blob_url = source.task_metadata_blob_url;
        self.sessions
            .lock()
            .unwrap()
            .insert(fork.session_id.clone(), fork.clone());
        Ok(fork)
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.sessions
            .lock()
            .unwrap()
            .remove(session_id)
            .map(|_| ())
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    async fn upload_blob(
        &self,
        session_id: &str,
        blob: BlobKind,
        body: Vec<u8>,
    ) -> Result<BlobUploadReceipt> {
        self.uploads_started.fetch_add(1, Ordering::SeqCst);
        if self.panic_next_upload.swap(false, Ordering::SeqCst) {
            panic!("upload transport crashed");
        }
        let delay = *self.upload_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = self.upload_error.lock().unwrap().clone() {
            return Err(Error::Remote(message));
        }
        let updated_at = self.tick();
        self.uploads
            .lock()
            .unwrap()
            .push((session_id.to_string(), blob, body));
        if let Some(session) = self.sessions.lock().unwrap().get_mut(session_id) {
            session.updated_at.clone_from(&updated_at);
        }
        Ok(BlobUploadReceipt { updated_at })
    }

    async fn fetch_blob(&self, url: &str) -> Result<Vec<u8>> {
        self.blob_store
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| Error::Remote(format!("404 blob not found: {url}")))
    }
}

/// Host that records messages and answers completions from a script.
#[derive(Debug, Default)]
pub struct MockMessenger {
    pub messages: Mutex<Vec<HostMessage>>,
    pub completion: Mutex<Option<String>>,
    pub completion_delay: Mutex<Option<Duration>>,
    pub completion_calls: AtomicUsize,
    pub registered: Mutex<Vec<RestoredTask>>,
}

impl MockMessenger {
    /// A host whose completions return `completion`; `None` fails them.
    pub fn new(completion: Option<&str>) -> Arc<Self> {
        let host = Self::default();
        *host.completion.lock().unwrap() = completion.map(str::to_string);
        Arc::new(host)
    }

    pub fn messages(&self) -> Vec<HostMessage> {
        self.messages.lock().unwrap().clone()
    }

    pub fn synced_sessions(&self) -> Vec<(String, Option<String>)> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                HostMessage::SessionSynced {
                    session_id,
                    updated_at,
                } => Some((session_id, updated_at)),
                HostMessage::TitleGenerated { .. } => None,
            })
            .collect()
    }

    pub fn generated_titles(&self) -> Vec<(String, String)> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                HostMessage::TitleGenerated { session_id, title } => Some((session_id, title)),
                HostMessage::SessionSynced { .. } => None,
            })
            .collect()
    }
}

#[async_trait]
impl HostMessenger for MockMessenger {
    fn post_message(&self, message: HostMessage) {
        self.messages.lock().unwrap().push(message);
    }

    async fn request_completion(&self, _prompt: &str, _timeout: Duration) -> Result<String> {
        self.completion_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.completion_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.completion
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::Remote("completion unavailable".to_string()))
    }

    async fn register_restored_task(&self, task: RestoredTask) -> Result<()> {
        self.registered.lock().unwrap().push(task);
        Ok(())
    }
}

/// Task metadata registered by tests.
#[derive(Debug, Default)]
pub struct MockTasks {
    pub tasks: Mutex<HashMap<String, TaskInfo>>,
}

impl MockTasks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, task_id: &str, info: TaskInfo) {
        self.tasks.lock().unwrap().insert(task_id.to_string(), info);
    }

    pub fn update<F: FnOnce(&mut TaskInfo)>(&self, task_id: &str, f: F) {
        if let Some(info) = self.tasks.lock().unwrap().get_mut(task_id) {
            f(info);
        }
    }
}

#[async_trait]
impl TaskDataProvider for MockTasks {
    async fn task_info(&self, task_id: &str) -> Result<TaskInfo> {
        self.tasks
            .lock()
            .unwrap()
            .get(task_id)
            .cloned()
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))
    }
}

/// Configuration used by most tests: git capture off, short title timeout.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.git.enabled = false;
    config.title.timeout = Duration::from_millis(500);
    config
}

/// A manager over mocks rooted in a temporary directory.
pub struct Harness {
    pub dir: TempDir,
    pub remote: Arc<MockRemote>,
    pub host: Arc<MockMessenger>,
    pub tasks: Arc<MockTasks>,
    pub paths: Arc<WorkspacePaths>,
    pub manager: Arc<SessionManager>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: Config) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp directory");
        let workspace = dir.path().join("workspace");
        std::fs::create_dir_all(&workspace).expect("Failed to create workspace");
        let paths = Arc::new(WorkspacePaths::new(
            dir.path().join("tasks"),
            dir.path().join("state").join("workspace.json"),
            workspace,
        ));
        Self::build(dir, paths, MockRemote::new(), config).await
    }

    /// A second manager sharing this harness's directory and remote, as after a restart.
    pub async fn restart(self) -> Self {
        let config = self.manager.config().clone();
        Self::build(self.dir, self.paths, self.remote, config).await
    }

    async fn build(
        dir: TempDir,
        paths: Arc<WorkspacePaths>,
        remote: Arc<MockRemote>,
        config: Config,
    ) -> Self {
        let host = MockMessenger::new(Some("Generated title"));
        let tasks = MockTasks::new();
        let manager = SessionManager::new(
            config,
            remote.clone(),
            paths.clone(),
            host.clone(),
            tasks.clone(),
        )
        .await;

        Self {
            dir,
            remote,
            host,
            tasks,
            paths,
            manager,
        }
    }

    pub fn workspace(&self) -> PathBuf {
        self.dir.path().join("workspace")
    }

    /// Write a conversation file for a task and register the task.
    pub fn write_task_file(&self, task_id: &str, blob: BlobKind, content: &Value) -> PathBuf {
        let dir = self.dir.path().join("local").join(task_id);
        std::fs::create_dir_all(&dir).expect("Failed to create task directory");
        let path = dir.join(blob.file_name().unwrap_or("blob.json"));
        std::fs::write(&path, serde_json::to_vec(content).unwrap()).expect("Failed to write file");

        let mut tasks = self.tasks.tasks.lock().unwrap();
        let info = tasks.entry(task_id.to_string()).or_default();
        match blob {
            BlobKind::ApiConversationHistory => info.files.api_conversation_history = Some(path.clone()),
            BlobKind::UiMessages => info.files.ui_messages = Some(path.clone()),
            BlobKind::TaskMetadata => info.files.task_metadata = Some(path.clone()),
            BlobKind::GitState => {}
        }
        path
    }

    /// Write a file and enqueue it.
    pub async fn save(&self, task_id: &str, blob: BlobKind, content: &Value) -> PathBuf {
        let path = self.write_task_file(task_id, blob, content);
        self.manager.handle_file_saved(task_id, blob, &path).await;
        path
    }
}

/// Task info with mode and model set.
pub fn task_info(mode: &str, model: &str) -> TaskInfo {
    TaskInfo {
        mode: Some(mode.to_string()),
        model: Some(model.to_string()),
        files: TaskFiles::default(),
        ..Default::default()
    }
}

/// Poll `condition` every 10ms for up to two seconds.
pub async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Whether `git` can be run.
pub fn git_available() -> bool {
    std::process::Command::new("git")
        .arg("--version")
        .output()
        .is_ok_and(|o| o.status.success())
}

/// Run git in `dir`, panicking on failure.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = std::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git runs");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Initialise a repository with one commit.
pub fn init_repo(dir: &Path) -> String {
    git(dir, &["init", "-q"]);
    git(dir, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    git(dir, &["config", "user.name", "Tether Test"]);
    git(dir, &["config", "user.email", "test@tether.dev"]);
    git(dir, &["config", "commit.gpgsign", "false"]);
    std::fs::write(dir.join("README.md"), "# test\n").expect("write README");
    git(dir, &["add", "README.md"]);
    git(dir, &["commit", "-q", "-m", "initial"]);
    git(dir, &["rev-parse", "HEAD"])
}
