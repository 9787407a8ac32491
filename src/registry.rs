//! In-memory task registry
//!
//! The registry is the only state shared between task workers and the request layer.
//! Its lock is held for a single lookup or update and never across external work.
//! Mutations are crate-private: only the orchestrator worker that owns a task writes it.

use chrono::{DateTime, Utc};
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::task::{Stage, Task, TaskArtifacts, TaskError, TaskLookupError, TaskStatus};

struct TaskEntry {
    task: Task,
    cancel: CancellationToken,
}

#[derive(Clone, Default)]
pub struct TaskRegistry {
    inner: Arc<Mutex<HashMap<String, TaskEntry>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly created task and hand back its cancellation token
    pub(crate) async fn insert(&self, task: Task) -> CancellationToken {
        let cancel = CancellationToken::new();
        let mut tasks = self.inner.lock().await;
        debug!("Registering task {}", task.id);
        tasks.insert(
            task.id.clone(),
            TaskEntry {
                task,
                cancel: cancel.clone(),
            },
        );
        cancel
    }

    /// Snapshot of a task
    pub async fn get(&self, id: &str) -> Result<Task, TaskLookupError> {
        let tasks = self.inner.lock().await;
        tasks
            .get(id)
            .map(|entry| entry.task.clone())
            .ok_or_else(|| TaskLookupError::TaskNotFound(id.to_string()))
    }

    pub async fn status(&self, id: &str) -> Result<TaskStatus, TaskLookupError> {
        let tasks = self.inner.lock().await;
        tasks
            .get(id)
            .map(|entry| entry.task.status())
            .ok_or_else(|| TaskLookupError::TaskNotFound(id.to_string()))
    }

    /// Status of every task, oldest first
    pub async fn list(&self) -> Vec<TaskStatus> {
        let mut statuses: Vec<TaskStatus> = {
            let tasks = self.inner.lock().await;
            tasks.values().map(|entry| entry.task.status()).collect()
        };
        statuses.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        statuses
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    pub(crate) async fn enter_stage(&self, id: &str, stage: Stage) -> Result<bool, TaskLookupError> {
        self.update(id, |task| task.enter_stage(stage)).await
    }

    pub(crate) async fn complete(
        &self,
        id: &str,
        artifacts: TaskArtifacts,
    ) -> Result<bool, TaskLookupError> {
        self.update(id, |task| task.complete(artifacts)).await
    }

    pub(crate) async fn fail(&self, id: &str, error: TaskError) -> Result<bool, TaskLookupError> {
        self.update(id, |task| task.fail(error)).await
    }

    async fn update<F>(&self, id: &str, apply: F) -> Result<bool, TaskLookupError>
    where
        F: FnOnce(&mut Task) -> bool,
    {
        let mut tasks = self.inner.lock().await;
        let entry = tasks
            .get_mut(id)
            .ok_or_else(|| TaskLookupError::TaskNotFound(id.to_string()))?;
        Ok(apply(&mut entry.task))
    }

    /// Request cancellation of a non-terminal task. The owning worker observes the
    /// token and records the failure itself.
    pub async fn cancel(&self, id: &str) -> Result<(), TaskLookupError> {
        let tasks = self.inner.lock().await;
        let entry = tasks
            .get(id)
            .ok_or_else(|| TaskLookupError::TaskNotFound(id.to_string()))?;
        if entry.task.stage.is_terminal() {
            return Err(TaskLookupError::AlreadyTerminal(id.to_string()));
        }
        entry.cancel.cancel();
        Ok(())
    }

    /// Drop a finished task from the registry and return its last state
    pub(crate) async fn remove_terminal(&self, id: &str) -> Result<Task, TaskLookupError> {
        let mut tasks = self.inner.lock().await;
        match tasks.get(id) {
            None => Err(TaskLookupError::TaskNotFound(id.to_string())),
            Some(entry) if !entry.task.stage.is_terminal() => {
                Err(TaskLookupError::StillRunning(id.to_string()))
            }
            Some(_) => tasks
                .remove(id)
                .map(|entry| entry.task)
                .ok_or_else(|| TaskLookupError::TaskNotFound(id.to_string())),
        }
    }

    /// Ids of terminal tasks that finished before `cutoff`
    pub(crate) async fn finished_before(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        let tasks = self.inner.lock().await;
        tasks
            .values()
            .filter(|entry| matches!(entry.task.completed_at, Some(done) if done < cutoff))
            .map(|entry| entry.task.id.clone())
            .collect()
    }
}
