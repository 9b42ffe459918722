//! In-memory task table: status, results, step logs, and retention.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::TaskError;

/// `Created → Authorizing → Executing → {Done, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Created,
    Authorizing,
    Executing,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Point-in-time view of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub name: String,
    pub user: String,
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_kind: Option<String>,
    #[serde(default)]
    pub log: Vec<String>,
    pub created_at: u64,
    #[serde(default)]
    pub finished_at: Option<u64>,
}

impl TaskSnapshot {
    /// The recorded outcome, or `None` while the task is running.
    pub fn outcome(&self) -> Option<Result<Value, TaskError>> {
        match self.status {
            TaskStatus::Done => Some(Ok(self.result.clone().unwrap_or(Value::Null))),
            TaskStatus::Failed => Some(Err(self.failure())),
            _ => None,
        }
    }

    fn failure(&self) -> TaskError {
        let message = self.error.clone().unwrap_or_default();
        match self.error_kind.as_deref() {
            Some("validation") => TaskError::Validation(message),
            Some("permission_denied") => TaskError::PermissionDenied(message),
            Some("not_found") => TaskError::NotFound(message),
            Some("capacity_exhausted") => TaskError::CapacityExhausted(message),
            Some("conflict") => TaskError::Conflict(message),
            Some("connection") => TaskError::Connection(message),
            Some("maintenance_mode") => TaskError::MaintenanceMode,
            Some("not_supported") => TaskError::NotSupported(message),
            _ => TaskError::Internal(message),
        }
    }
}

struct Entry {
    snapshot: TaskSnapshot,
    finished: Option<Instant>,
    status: watch::Sender<TaskStatus>,
}

/// Shared table of every task the manager has run and not yet evicted.
///
/// `Clone` is cheap; all clones see the same table.
#[derive(Clone)]
pub struct TaskTracker {
    tasks: Arc<Mutex<HashMap<String, Entry>>>,
    retention: Duration,
}

impl std::fmt::Debug for TaskTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskTracker")
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

impl TaskTracker {
    /// Terminal tasks are kept for `retention` after they finish.
    pub fn new(retention: Duration) -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            retention,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a new task in `Created` and return its handle.
    pub fn create(&self, name: &str, user: &str, description: String) -> Task {
        let id = uuid::Uuid::new_v4().to_string();
        let snapshot = TaskSnapshot {
            id: id.clone(),
            name: name.to_string(),
            user: user.to_string(),
            description,
            status: TaskStatus::Created,
            result: None,
            error: None,
            error_kind: None,
            log: Vec::new(),
            created_at: epoch_secs(),
            finished_at: None,
        };
        let (status, _) = watch::channel(TaskStatus::Created);
        self.table().insert(
            id.clone(),
            Entry {
                snapshot,
                finished: None,
                status,
            },
        );
        Task {
            id,
            tracker: self.clone(),
        }
    }

    pub fn set_status(&self, id: &str, status: TaskStatus) {
        if let Some(entry) = self.table().get_mut(id) {
            entry.snapshot.status = status;
            entry.status.send_replace(status);
        }
    }

    /// Record the terminal outcome of a task.
    pub fn finish(&self, id: &str, outcome: &Result<Value, TaskError>) {
        let mut table = self.table();
        let Some(entry) = table.get_mut(id) else {
            return;
        };
        let status = match outcome {
            Ok(value) => {
                entry.snapshot.result = Some(value.clone());
                TaskStatus::Done
            }
            Err(e) => {
                entry.snapshot.error = Some(e.to_string());
                entry.snapshot.error_kind = Some(e.kind().to_string());
                TaskStatus::Failed
            }
        };
        entry.snapshot.status = status;
        entry.snapshot.finished_at = Some(epoch_secs());
        entry.finished = Some(Instant::now());
        entry.status.send_replace(status);
    }

    fn append_log(&self, id: &str, message: String) {
        if let Some(entry) = self.table().get_mut(id) {
            entry.snapshot.log.push(message);
        }
    }

    pub fn snapshot(&self, id: &str) -> Option<TaskSnapshot> {
        self.table().get(id).map(|entry| entry.snapshot.clone())
    }

    /// Wait up to `timeout` for the task to finish, then return its snapshot.
    /// `None` if the ID is unknown or was evicted.
    pub async fn wait(&self, id: &str, timeout: Duration) -> Option<TaskSnapshot> {
        let mut rx = self.table().get(id)?.status.subscribe();
        let _ = tokio::time::timeout(timeout, rx.wait_for(|status| status.is_terminal())).await;
        self.snapshot(id)
    }

    /// Drop terminal tasks that finished more than `retention` ago.
    /// Returns how many were evicted.
    pub fn evict_expired(&self) -> usize {
        let retention = self.retention;
        let mut table = self.table();
        let before = table.len();
        table.retain(|_, entry| match entry.finished {
            Some(finished) => finished.elapsed() < retention,
            None => true,
        });
        before - table.len()
    }

    /// True when no task other than `except` is authorizing or executing.
    pub fn is_idle(&self, except: Option<&str>) -> bool {
        self.table().values().all(|entry| {
            Some(entry.snapshot.id.as_str()) == except
                || matches!(entry.snapshot.status, TaskStatus::Created)
                || entry.snapshot.status.is_terminal()
        })
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }
}

/// Handle passed to a running command.
#[derive(Debug, Clone)]
pub struct Task {
    id: String,
    tracker: TaskTracker,
}

impl Task {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Append a step message to the task's log.
    pub fn log(&self, message: impl Into<String>) {
        let message = message.into();
        debug!(task_id = %self.id, step = %message, "task step");
        self.tracker.append_log(&self.id, message);
    }
}

/// Periodically evict expired task results until `shutdown` flips.
pub async fn run_eviction(
    tracker: TaskTracker,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(?interval, retention = ?tracker.retention(), "result eviction starting");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let evicted = tracker.evict_expired();
                if evicted > 0 {
                    info!(evicted, remaining = tracker.len(), "evicted expired task results");
                }
            }
            _ = shutdown.changed() => {
                debug!("result eviction shutting down");
                break;
            }
        }
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lifecycle_and_snapshot() {
        let tracker = TaskTracker::new(Duration::from_secs(60));
        let task = tracker.create("Deploy", "alice", "deploy web".into());
        assert_eq!(tracker.snapshot(task.id()).unwrap().status, TaskStatus::Created);

        tracker.set_status(task.id(), TaskStatus::Executing);
        task.log("picked hosts");
        tracker.finish(task.id(), &Ok(json!({"port": 65533})));

        let snap = tracker.snapshot(task.id()).unwrap();
        assert_eq!(snap.status, TaskStatus::Done);
        assert_eq!(snap.log, vec!["picked hosts"]);
        assert_eq!(snap.outcome(), Some(Ok(json!({"port": 65533}))));
        assert!(snap.finished_at.is_some());
    }

    #[test]
    fn failure_keeps_kind() {
        let tracker = TaskTracker::new(Duration::from_secs(60));
        let task = tracker.create("GetApp", "bob", "get app".into());
        tracker.finish(task.id(), &Err(TaskError::NotFound("app web not found".into())));
        let snap = tracker.snapshot(task.id()).unwrap();
        assert_eq!(snap.error_kind.as_deref(), Some("not_found"));
        assert_eq!(
            snap.outcome(),
            Some(Err(TaskError::NotFound("app web not found".into())))
        );
    }

    #[test]
    fn eviction_only_drops_finished_tasks() {
        let tracker = TaskTracker::new(Duration::ZERO);
        let done = tracker.create("A", "u", "a".into());
        let running = tracker.create("B", "u", "b".into());
        tracker.set_status(running.id(), TaskStatus::Executing);
        tracker.finish(done.id(), &Ok(Value::Null));

        assert_eq!(tracker.evict_expired(), 1);
        assert!(tracker.snapshot(done.id()).is_none());
        assert!(tracker.snapshot(running.id()).is_some());
    }

    #[test]
    fn idleness_ignores_the_caller() {
        let tracker = TaskTracker::new(Duration::from_secs(60));
        let idle = tracker.create("Idle", "u", "idle".into());
        tracker.set_status(idle.id(), TaskStatus::Executing);
        assert!(tracker.is_idle(Some(idle.id())));

        let deploy = tracker.create("Deploy", "u", "deploy".into());
        tracker.set_status(deploy.id(), TaskStatus::Executing);
        assert!(!tracker.is_idle(Some(idle.id())));

        tracker.finish(deploy.id(), &Ok(Value::Null));
        assert!(tracker.is_idle(Some(idle.id())));
    }

    #[tokio::test]
    async fn wait_returns_when_finished() {
        let tracker = TaskTracker::new(Duration::from_secs(60));
        let task = tracker.create("Deploy", "u", "deploy".into());
        tracker.set_status(task.id(), TaskStatus::Executing);

        let waiter = {
            let tracker = tracker.clone();
            let id = task.id().to_string();
            tokio::spawn(async move { tracker.wait(&id, Duration::from_secs(10)).await })
        };
        tokio::task::yield_now().await;
        tracker.finish(task.id(), &Ok(json!("ok")));

        let snap = waiter.await.unwrap().unwrap();
        assert_eq!(snap.status, TaskStatus::Done);
    }

    #[tokio::test]
    async fn wait_is_bounded_and_unknown_is_none() {
        let tracker = TaskTracker::new(Duration::from_secs(60));
        let task = tracker.create("Deploy", "u", "deploy".into());
        tracker.set_status(task.id(), TaskStatus::Executing);
        let snap = tracker.wait(task.id(), Duration::from_millis(20)).await.unwrap();
        assert_eq!(snap.status, TaskStatus::Executing);
        assert!(tracker.wait("nope", Duration::from_millis(1)).await.is_none());
    }

    #[tokio::test]
    async fn eviction_loop_stops_on_shutdown() {
        let tracker = TaskTracker::new(Duration::ZERO);
        let task = tracker.create("A", "u", "a".into());
        tracker.finish(task.id(), &Ok(Value::Null));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_eviction(tracker.clone(), Duration::from_millis(5), rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(tracker.is_empty());
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
