use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::Notify;

use qm_core::TaskId;

// ---------------------------------------------------------------------------
// ProgressSink
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub task_id: TaskId,
    pub fraction: f64,
    pub message: Option<String>,
}

/// Keep-latest coalescing buffer for high-frequency task progress.
///
/// Agents stream progress token-by-token; publishing every tick would flood
/// the bus and the store write queue. The sink keeps only the newest update
/// per task; a single pump drains snapshots as fast as it can keep up.
/// Lifecycle transitions (started/completed/failed) never go through here.
#[derive(Debug, Default)]
pub struct ProgressSink {
    latest: Mutex<HashMap<TaskId, ProgressUpdate>>,
    notify: Notify,
}

impl ProgressSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an update, replacing any queued one for the same task.
    pub fn record(&self, update: ProgressUpdate) {
        self.latest
            .lock()
            .expect("progress sink lock poisoned")
            .insert(update.task_id.clone(), update);
        self.notify.notify_one();
    }

    /// Take everything currently queued, newest-per-task.
    pub fn drain(&self) -> Vec<ProgressUpdate> {
        let mut map = self.latest.lock().expect("progress sink lock poisoned");
        let mut updates: Vec<ProgressUpdate> = map.drain().map(|(_, v)| v).collect();
        updates.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        updates
    }

    /// Wait until at least one update has been recorded since the last drain.
    pub async fn changed(&self) {
        self.notify.notified().await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
