//! Pending upload queue.
//!
//! Every local write of a conversation artifact becomes a [`SyncQueueItem`].
//! The queue keeps two indices next to the ordered item list:
//!
//! - task index: `task_id -> items` for per-task draining
//! - blob index: `"task:blob" -> latest item` for O(1) dedup lookups
//!
//! Both indices are rebuilt from the item list whenever items are removed.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::model::{BlobKind, SyncQueueItem};

/// Callback fired when the queue grows past its flush threshold.
pub type FlushHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Default)]
struct QueueState {
    items: Vec<SyncQueueItem>,
    task_index: HashMap<String, Vec<SyncQueueItem>>,
    blob_index: HashMap<String, SyncQueueItem>,
    last_timestamp: i64,
}

impl QueueState {
    fn index(&mut self, item: &SyncQueueItem) {
        self.task_index
            .entry(item.task_id.clone())
            .or_default()
            .push(item.clone());
        self.blob_index
            .insert(blob_key(&item.task_id, item.blob), item.clone());
    }

    fn rebuild_indices(&mut self) {
        self.task_index.clear();
        self.blob_index.clear();
        let items = std::mem::take(&mut self.items);
        for item in &items {
            self.index(item);
        }
        self.items = items;
    }

    /// Strictly increasing epoch-millis timestamp.
    fn next_timestamp(&mut self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        self.last_timestamp = now.max(self.last_timestamp + 1);
        self.last_timestamp
    }
}

/// Ordered, dual-indexed queue of pending blob uploads.
pub struct SyncQueue {
    state: Mutex<QueueState>,
    flush_threshold: usize,
    flush_handler: Mutex<Option<FlushHandler>>,
}

impl std::fmt::Debug for SyncQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncQueue")
            .field("flush_threshold", &self.flush_threshold)
            .finish_non_exhaustive()
    }
}

impl SyncQueue {
    /// Create an empty queue that requests a flush above `flush_threshold` items.
    #[must_use]
    pub fn new(flush_threshold: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            flush_threshold,
            flush_handler: Mutex::new(None),
        }
    }

    /// Install the flush callback.
    ///
    /// Set after construction so the queue can exist before the sync service
    /// that drains it.
    pub async fn set_flush_handler(&self, handler: FlushHandler) {
        *self.flush_handler.lock().await = Some(handler);
    }

    /// Record that `blob_path` must be uploaded as `blob` of `task_id`.
    pub async fn enqueue(
        &self,
        task_id: impl Into<String>,
        blob: BlobKind,
        blob_path: impl Into<PathBuf>,
    ) -> SyncQueueItem {
        let (item, len) = {
            let mut state = self.state.lock().await;
            let item = SyncQueueItem {
                task_id: task_id.into(),
                blob,
                blob_path: blob_path.into(),
                timestamp: state.next_timestamp(),
            };
            state.items.push(item.clone());
            state.index(&item);
            (item, state.items.len())
        };

        tracing::trace!(
            task_id = %item.task_id,
            blob = %item.blob,
            queue_len = len,
            "Enqueued blob upload"
        );

        if len > self.flush_threshold {
            let handler = self.flush_handler.lock().await.clone();
            if let Some(handler) = handler {
                tracing::debug!(queue_len = len, "Queue above flush threshold");
                handler();
            }
        }

        item
    }

    /// Items of a task in enqueue order.
    pub async fn items_for_task(&self, task_id: &str) -> Vec<SyncQueueItem> {
        self.state
            .lock()
            .await
            .task_index
            .get(task_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Distinct task ids in order of first appearance.
    pub async fn unique_task_ids(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut seen = HashSet::new();
        state
            .items
            .iter()
            .filter(|item| seen.insert(item.task_id.as_str()))
            .map(|item| item.task_id.clone())
            .collect()
    }

    /// Latest item for a task and blob.
    pub async fn last_item_for_blob(&self, task_id: &str, blob: BlobKind) -> Option<SyncQueueItem> {
        self.state
            .lock()
            .await
            .blob_index
            .get(&blob_key(task_id, blob))
            .cloned()
    }

    /// Most recently enqueued item.
    pub async fn last_item(&self) -> Option<SyncQueueItem> {
        self.state.lock().await.items.last().cloned()
    }

    /// Drop items of `task_id`/`blob` enqueued at or before `before_ts`.
    ///
    /// Returns the number of removed items. Items enqueued after `before_ts`
    /// stay queued for the next pass.
    pub async fn remove_processed_items(&self, task_id: &str, blob: BlobKind, before_ts: i64) -> usize {
        let mut state = self.state.lock().await;
        let before = state.items.len();
        state.items.retain(|item| {
            !(item.task_id == task_id && item.blob == blob && item.timestamp <= before_ts)
        });
        let removed = before - state.items.len();
        if removed > 0 {
            state.rebuild_indices();
        }
        removed
    }

    /// Remove everything.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.items.clear();
        state.task_index.clear();
        state.blob_index.clear();
    }

    /// Copy of all items in enqueue order.
    pub async fn snapshot(&self) -> Vec<SyncQueueItem> {
        self.state.lock().await.items.clone()
    }

    /// Number of queued items.
    pub async fn len(&self) -> usize {
        self.state.lock().await.items.len()
    }

    /// Whether nothing is queued.
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.items.is_empty()
    }
}

fn blob_key(task_id: &str, blob: BlobKind) -> String {
    format!("{task_id}:{blob}")
}
