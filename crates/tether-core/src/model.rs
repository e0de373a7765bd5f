//! Remote session, blob, and git state types.
//!
//! Field names follow the remote store's JSON (snake_case) except for the
//! git state payloads, which use camelCase like the rest of the host's
//! persisted documents.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Named JSON artifact attached to a remote session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobKind {
    /// Raw model conversation
    ApiConversationHistory,
    /// Messages as rendered in the host UI
    UiMessages,
    /// Task bookkeeping (files in context, usage)
    TaskMetadata,
    /// Git working-tree snapshot; never written as a local file
    GitState,
}

impl BlobKind {
    /// Every blob kind, in upload order.
    pub const ALL: [Self; 4] = [
        Self::ApiConversationHistory,
        Self::UiMessages,
        Self::TaskMetadata,
        Self::GitState,
    ];

    /// Wire name of the blob.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ApiConversationHistory => "api_conversation_history",
            Self::UiMessages => "ui_messages",
            Self::TaskMetadata => "task_metadata",
            Self::GitState => "git_state",
        }
    }

    /// Local file name inside a task directory, if the blob is materialized.
    #[must_use]
    pub const fn file_name(self) -> Option<&'static str> {
        match self {
            Self::ApiConversationHistory => Some("api_conversation_history.json"),
            Self::UiMessages => Some("ui_messages.json"),
            Self::TaskMetadata => Some("task_metadata.json"),
            Self::GitState => None,
        }
    }

    /// Whether a missing blob is replaced by an empty JSON array on restore.
    #[must_use]
    pub const fn needs_placeholder(self) -> bool {
        matches!(self, Self::ApiConversationHistory | Self::UiMessages)
    }
}

impl fmt::Display for BlobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlobKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::Internal(format!("unknown blob kind '{s}'")))
    }
}

/// Session record as stored remotely.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSession {
    /// Remote identifier
    pub session_id: String,
    /// Display title
    pub title: Option<String>,
    /// ISO-8601 creation time
    pub created_at: String,
    /// ISO-8601 last modification time
    pub updated_at: String,
    /// Remote URL of the repository the work happened in
    pub git_url: Option<String>,
    /// Host mode the task ran in
    pub mode: Option<String>,
    /// Model used by the task
    pub model: Option<String>,
    /// Session this one was spawned from
    pub parent_session_id: Option<String>,
    /// Owning organization
    pub organization_id: Option<String>,
    /// Schema version the record was written with
    #[serde(default)]
    pub version: u32,
    /// Signed download URL for the conversation history
    pub api_conversation_history_blob_url: Option<String>,
    /// Signed download URL for the UI messages
    pub ui_messages_blob_url: Option<String>,
    /// Signed download URL for the task metadata
    pub task_metadata_blob_url: Option<String>,
    /// Signed download URL for the git state
    pub git_state_blob_url: Option<String>,
}

impl RemoteSession {
    /// Signed URL of a blob, when the session was fetched with blob URLs.
    #[must_use]
    pub fn blob_url(&self, kind: BlobKind) -> Option<&str> {
        match kind {
            BlobKind::ApiConversationHistory => self.api_conversation_history_blob_url.as_deref(),
            BlobKind::UiMessages => self.ui_messages_blob_url.as_deref(),
            BlobKind::TaskMetadata => self.task_metadata_blob_url.as_deref(),
            BlobKind::GitState => self.git_state_blob_url.as_deref(),
        }
    }

    /// Title, ignoring empty strings.
    #[must_use]
    pub fn non_empty_title(&self) -> Option<&str> {
        self.title.as_deref().filter(|t| !t.trim().is_empty())
    }
}

/// Fields sent when creating a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    /// Initial title
    pub title: Option<String>,
    /// Repository URL
    pub git_url: Option<String>,
    /// Host mode
    pub mode: Option<String>,
    /// Model
    pub model: Option<String>,
    /// Parent session back-reference
    pub parent_session_id: Option<String>,
    /// Owning organization
    pub organization_id: Option<String>,
    /// Schema version
    pub version: u32,
}

/// Fields sent when updating a session; `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSessionRequest {
    /// Session to update
    pub session_id: String,
    /// New title
    pub title: Option<String>,
    /// New repository URL
    pub git_url: Option<String>,
    /// New mode
    pub mode: Option<String>,
    /// New model
    pub model: Option<String>,
}

/// Server confirmation of a blob upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobUploadReceipt {
    /// ISO-8601 time the session was last modified, as seen by the server
    pub updated_at: String,
}

/// One page of a session listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPage {
    /// Sessions on this page, newest first
    pub sessions: Vec<RemoteSession>,
    /// Cursor for the next page
    pub next_cursor: Option<String>,
}

/// Result of sharing a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareInfo {
    /// Public share identifier, usable with fork
    pub share_id: String,
    /// Shareable link, when the server provides one
    pub share_url: Option<String>,
}

/// Captured git working-tree state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitState {
    /// First remote URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,
    /// Commit hash of HEAD
    pub head: String,
    /// Branch name; `None` for a detached HEAD
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Diff of the working tree against HEAD, untracked files included
    pub patch: String,
}

/// Git state as downloaded for restoration; same shape as [`GitState`].
pub type GitRestoreState = GitState;

/// One pending local-file to remote-blob upload obligation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    /// Task the file belongs to
    pub task_id: String,
    /// Blob the file is uploaded as
    pub blob: BlobKind,
    /// Local file holding the content
    pub blob_path: PathBuf,
    /// Enqueue time in epoch milliseconds
    pub timestamp: i64,
}

/// Local conversation files of a task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFiles {
    /// `api_conversation_history.json`
    pub api_conversation_history: Option<PathBuf>,
    /// `ui_messages.json`
    pub ui_messages: Option<PathBuf>,
    /// `task_metadata.json`
    pub task_metadata: Option<PathBuf>,
}

/// What the host knows about a task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskInfo {
    /// Host-provided title hint
    pub title_hint: Option<String>,
    /// Host mode
    pub mode: Option<String>,
    /// Model
    pub model: Option<String>,
    /// Task this one was spawned from
    pub parent_task_id: Option<String>,
    /// Organization the user is acting for
    pub organization_id: Option<String>,
    /// Conversation artifacts on disk
    pub files: TaskFiles,
}

/// A task recreated locally from a remote session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoredTask {
    /// Local task id (equal to the session id)
    pub task_id: String,
    /// Session it was restored from
    pub session_id: String,
    /// Session title
    pub title: Option<String>,
    /// Directory holding the restored files
    pub task_dir: PathBuf,
    /// Last remote modification time
    pub updated_at: String,
}

/// Typed message pushed to the host UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HostMessage {
    /// A task's changes reached the remote store
    #[serde(rename_all = "camelCase")]
    SessionSynced {
        /// Session that was synced
        session_id: String,
        /// High-water mark after the sync
        updated_at: Option<String>,
    },
    /// A session received a (new) title
    #[serde(rename_all = "camelCase")]
    TitleGenerated {
        /// Session that was titled
        session_id: String,
        /// The title
        title: String,
    },
}
