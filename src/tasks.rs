//! Background ingestion task tracking.
//!
//! Every background run gets an entry keyed by task id. Each entry owns a
//! [`CancellationToken`] (a child of the registry's root token, so
//! [`TaskRegistry::shutdown`] reaches all of them) and the run's
//! `JoinHandle`. Entries live in process memory only; a terminal entry is
//! evicted the first time its status is read, or swept on the next
//! [`TaskRegistry::register`] once it has sat unread for the retention
//! period (one hour by default).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use ragline_core::error::{RagError, Result};
use ragline_core::models::{IngestStage, TaskStatus};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Snapshot of one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskInfo {
    pub task_id: String,
    pub document_id: String,
    pub status: TaskStatus,
    pub stage: IngestStage,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The `status(task_id)` response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatusReport {
    pub status: TaskStatus,
    /// Stage counter, 0 (queued) through 4 (stored).
    pub progress: u8,
    pub stage: IngestStage,
    pub error: Option<String>,
}

struct TaskEntry {
    info: TaskInfo,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

/// How long an unread terminal entry is kept.
const DEFAULT_RETENTION_SECS: i64 = 3600;

pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, TaskEntry>>,
    root: CancellationToken,
    retention: chrono::Duration,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            root: CancellationToken::new(),
            retention: chrono::Duration::seconds(DEFAULT_RETENTION_SECS),
        }
    }

    pub fn with_retention(mut self, retention: chrono::Duration) -> Self {
        self.retention = retention;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, TaskEntry>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A token cancelled by [`Self::shutdown`], for runs that are not
    /// tracked as tasks.
    pub fn child_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    /// Register a pending task for `document_id`.
    pub fn register(self: &Arc<Self>, document_id: &str) -> TaskProgress {
        let task_id = uuid::Uuid::new_v4().to_string();
        let cancel = self.root.child_token();
        let now = Utc::now();
        let info = TaskInfo {
            task_id: task_id.clone(),
            document_id: document_id.to_string(),
            status: TaskStatus::Pending,
            stage: IngestStage::Queued,
            error: None,
            created_at: now,
            updated_at: now,
        };
        let mut tasks = self.lock();
        let before = tasks.len();
        tasks.retain(|_, e| {
            !(e.info.status.is_terminal() && now - e.info.updated_at >= self.retention)
        });
        if tasks.len() < before {
            tracing::debug!(swept = before - tasks.len(), "dropped unread finished tasks");
        }
        tasks.insert(
            task_id.clone(),
            TaskEntry {
                info,
                cancel: cancel.clone(),
                handle: None,
            },
        );
        drop(tasks);
        TaskProgress {
            registry: Arc::clone(self),
            task_id,
            cancel,
        }
    }

    pub fn attach(&self, task_id: &str, handle: JoinHandle<()>) {
        if let Some(entry) = self.lock().get_mut(task_id) {
            entry.handle = Some(handle);
        }
    }

    fn update(&self, task_id: &str, f: impl FnOnce(&mut TaskInfo)) {
        if let Some(entry) = self.lock().get_mut(task_id) {
            f(&mut entry.info);
            entry.info.updated_at = Utc::now();
        }
    }

    /// Status of a task. Reading a terminal status evicts the entry.
    pub fn get_status(&self, task_id: &str) -> Result<TaskStatusReport> {
        let mut tasks = self.lock();
        let entry = tasks
            .get(task_id)
            .ok_or_else(|| RagError::not_found("task", task_id))?;
        let info = &entry.info;
        let report = TaskStatusReport {
            status: info.status,
            progress: info.stage.counter(),
            stage: info.stage,
            error: info.error.clone(),
        };
        if report.status.is_terminal() {
            tasks.remove(task_id);
        }
        Ok(report)
    }

    /// Request cooperative cancellation. Cancelling a finished task is a
    /// no-op.
    pub fn cancel(&self, task_id: &str) -> Result<()> {
        let tasks = self.lock();
        let entry = tasks
            .get(task_id)
            .ok_or_else(|| RagError::not_found("task", task_id))?;
        if entry.info.status.is_terminal() {
            tracing::debug!(task_id, "cancel requested for finished task");
            return Ok(());
        }
        tracing::info!(task_id, document_id = %entry.info.document_id, "cancellation requested");
        entry.cancel.cancel();
        Ok(())
    }

    /// Snapshot of all tracked tasks, oldest first.
    pub fn list(&self) -> Vec<TaskInfo> {
        let mut out: Vec<TaskInfo> = self.lock().values().map(|e| e.info.clone()).collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.task_id.cmp(&b.task_id)));
        out
    }

    /// Cancel every in-flight task and wait for all of them to finish.
    pub async fn shutdown(&self) {
        self.root.cancel();
        let handles: Vec<JoinHandle<()>> = self
            .lock()
            .values_mut()
            .filter_map(|e| e.handle.take())
            .collect();
        let count = handles.len();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "ingestion task ended abnormally");
            }
        }
        tracing::debug!(count, "task registry shut down");
    }
}

/// Write side of one task's entry, held by the run.
#[derive(Clone)]
pub struct TaskProgress {
    registry: Arc<TaskRegistry>,
    task_id: String,
    cancel: CancellationToken,
}

impl TaskProgress {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn attach(&self, handle: JoinHandle<()>) {
        self.registry.attach(&self.task_id, handle);
    }

    /// Advance the stage counter. Never moves backwards.
    pub fn stage(&self, stage: IngestStage) {
        self.registry.update(&self.task_id, |info| {
            if stage > info.stage {
                info.stage = stage;
            }
        });
    }

    pub fn status(&self, status: TaskStatus) {
        self.registry.update(&self.task_id, |info| {
            if !info.status.is_terminal() {
                info.status = status;
            }
        });
    }

    pub fn finish(&self, status: TaskStatus, error: Option<String>) {
        self.registry.update(&self.task_id, |info| {
            info.status = status;
            info.error = error;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_lifecycle_and_eviction() {
        let registry = Arc::new(TaskRegistry::new());
        let progress = registry.register("doc-1");
        let id = progress.task_id().to_string();

        let report = registry.get_status(&id).unwrap();
        assert_eq!(report.status, TaskStatus::Pending);
        assert_eq!(report.progress, 0);

        progress.status(TaskStatus::Processing);
        progress.stage(IngestStage::Chunked);
        progress.stage(IngestStage::Loaded);
        let report = registry.get_status(&id).unwrap();
        assert_eq!(report.stage, IngestStage::Chunked);
        assert_eq!(report.progress, 2);

        progress.finish(TaskStatus::Completed, None);
        assert_eq!(registry.get_status(&id).unwrap().status, TaskStatus::Completed);
        assert_eq!(registry.get_status(&id).unwrap_err().kind(), "not_found");
    }

    #[test]
    fn test_register_sweeps_stale_finished_tasks() {
        let registry = Arc::new(TaskRegistry::new().with_retention(chrono::Duration::zero()));
        let done = registry.register("done");
        done.finish(TaskStatus::Failed, Some("cancelled".into()));
        let running = registry.register("running");
        running.status(TaskStatus::Processing);

        registry.register("fresh");
        let docs: Vec<String> = registry.list().into_iter().map(|t| t.document_id).collect();
        assert_eq!(docs.len(), 2);
        assert!(!docs.contains(&"done".to_string()));
        assert!(docs.contains(&"running".to_string()));

        let kept = Arc::new(TaskRegistry::new());
        kept.register("done").finish(TaskStatus::Completed, None);
        kept.register("next");
        assert_eq!(kept.list().len(), 2);
    }

    #[test]
    fn test_cancel_unknown_task() {
        let registry = TaskRegistry::new();
        assert_eq!(registry.cancel("nope").unwrap_err().kind(), "not_found");
    }

    #[test]
    fn test_cancel_triggers_token() {
        let registry = Arc::new(TaskRegistry::new());
        let progress = registry.register("doc-1");
        let token = progress.token();
        registry.cancel(progress.task_id()).unwrap();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_list_snapshot() {
        let registry = Arc::new(TaskRegistry::new());
        registry.register("a");
        registry.register("b");
        let docs: Vec<String> = registry.list().into_iter().map(|t| t.document_id).collect();
        assert_eq!(docs.len(), 2);
        assert!(docs.contains(&"a".to_string()));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_and_awaits() {
        let registry = Arc::new(TaskRegistry::new());
        let progress = registry.register("doc-1");
        let token = progress.token();
        let handle = tokio::spawn(async move {
            token.cancelled().await;
        });
        progress.attach(handle);
        registry.shutdown().await;
        assert!(progress.token().is_cancelled());
    }
}
