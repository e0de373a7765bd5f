//! Per-workspace persisted session state.
//!
//! One JSON document per workspace:
//!
//! ```json
//! {
//!   "lastSession": { "sessionId": "...", "timestamp": 1767225600000 },
//!   "taskSessionMap": { "task-1": "session-a" }
//! }
//! ```
//!
//! The document is created on first write and read-modify-written after
//! that. It is a recovery source after restart; the in-memory
//! [`SessionStateManager`] stays authoritative for the running process.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::state::SessionStateManager;
use crate::error::Result;

/// Last session the user worked in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastSession {
    /// Session id
    pub session_id: String,
    /// When it was recorded, epoch milliseconds
    pub timestamp: i64,
}

/// Persisted workspace document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSessionState {
    /// Last active session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_session: Option<LastSession>,
    /// Task id to session id, in write order
    #[serde(default, with = "ordered_map")]
    pub task_session_map: Vec<(String, String)>,
}

impl WorkspaceSessionState {
    /// Map a task to a session. An existing task keeps its position.
    pub fn insert(&mut self, task_id: &str, session_id: &str) {
        if let Some(entry) = self.task_session_map.iter_mut().find(|(t, _)| t == task_id) {
            entry.1 = session_id.to_string();
        } else {
            self.task_session_map
                .push((task_id.to_string(), session_id.to_string()));
        }
    }

    /// Session of a task in the raw map.
    #[must_use]
    pub fn get(&self, task_id: &str) -> Option<&str> {
        self.task_session_map
            .iter()
            .find(|(t, _)| t == task_id)
            .map(|(_, s)| s.as_str())
    }

    /// Map with one task per session: the latest written task wins.
    #[must_use]
    pub fn deduplicated(&self) -> BTreeMap<String, String> {
        let mut seen_sessions = HashSet::new();
        self.task_session_map
            .iter()
            .rev()
            .filter(|(_, session)| seen_sessions.insert(session.as_str()))
            .map(|(task, session)| (task.clone(), session.clone()))
            .collect()
    }
}

/// Durable mirror of a subset of the state manager.
#[derive(Debug)]
pub struct SessionPersistenceManager {
    path: PathBuf,
    state: Arc<SessionStateManager>,
    write_lock: Mutex<()>,
}

impl SessionPersistenceManager {
    /// Create a manager for the document at `path`.
    #[must_use]
    pub fn new(path: PathBuf, state: Arc<SessionStateManager>) -> Self {
        Self {
            path,
            state,
            write_lock: Mutex::new(()),
        }
    }

    /// Path of the workspace document.
    #[must_use]
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Read the document; a missing or unreadable file yields the default.
    pub async fn load(&self) -> WorkspaceSessionState {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return WorkspaceSessionState::default();
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to read workspace state");
                return WorkspaceSessionState::default();
            }
        };

        serde_json::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "Workspace state is corrupt; starting from an empty document"
            );
            WorkspaceSessionState::default()
        })
    }

    async fn save(&self, document: &WorkspaceSessionState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(document)?;
        tokio::fs::write(&self.path, content).await?;
        Ok(())
    }

    async fn update<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut WorkspaceSessionState),
    {
        let _guard = self.write_lock.lock().await;
        let mut document = self.load().await;
        mutate(&mut document);
        self.save(&document).await
    }

    /// Last active session.
    pub async fn get_last_session(&self) -> Option<LastSession> {
        self.load().await.last_session
    }

    /// Record the last active session.
    pub async fn set_last_session(&self, session_id: &str, timestamp: i64) -> Result<()> {
        let last = LastSession {
            session_id: session_id.to_string(),
            timestamp,
        };
        self.update(|document| document.last_session = Some(last))
            .await
    }

    /// Task to session map with at most one task per session.
    ///
    /// When several tasks historically point at the same session, only the
    /// most recently written task is kept.
    pub async fn get_task_session_map(&self) -> BTreeMap<String, String> {
        self.load().await.deduplicated()
    }

    /// Persist a task to session mapping.
    pub async fn set_session_for_task(&self, task_id: &str, session_id: &str) -> Result<()> {
        self.update(|document| document.insert(task_id, session_id))
            .await
    }

    /// Session of a task: in-memory state first, then the persisted map.
    pub async fn get_session_for_task(&self, task_id: &str) -> Option<String> {
        if let Some(session_id) = self.state.session_for_task(task_id).await {
            return Some(session_id);
        }
        self.get_task_session_map().await.remove(task_id)
    }

    /// Drop every mapping to a deleted session.
    pub async fn remove_session(&self, session_id: &str) -> Result<()> {
        self.update(|document| {
            document
                .task_session_map
                .retain(|(_, session)| session != session_id);
            if document
                .last_session
                .as_ref()
                .is_some_and(|last| last.session_id == session_id)
            {
                document.last_session = None;
            }
        })
        .await
    }
}

/// JSON object <-> ordered list of pairs, preserving document order.
mod ordered_map {
    use std::fmt;

    use serde::de::{MapAccess, Visitor};
    use serde::ser::SerializeMap;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(pairs: &[(String, String)], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(pairs.len()))?;
        for (key, value) in pairs {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<(String, String)>, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct PairsVisitor;

        impl<'de> Visitor<'de> for PairsVisitor {
            type Value = Vec<(String, String)>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of task ids to session ids")
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut pairs: Vec<(String, String)> =
                    Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, value)) = access.next_entry::<String, String>()? {
                    if let Some(entry) = pairs.iter_mut().find(|(k, _)| *k == key) {
                        entry.1 = value;
                    } else {
                        pairs.push((key, value));
                    }
                }
                Ok(pairs)
            }
        }

        deserializer.deserialize_map(PairsVisitor)
    }
}
