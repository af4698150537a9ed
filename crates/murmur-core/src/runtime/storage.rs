use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::runtime::task::Task;
use crate::runtime::types::{CoreError, TaskId, TaskStatus};

/// Read-modify-write callback passed to [`TaskStore::update`].
///
/// Returning an error aborts the update and leaves the stored record as it
/// was; the error is handed back to the caller unchanged.
pub type TaskMutator = Box<dyn FnOnce(&mut Task) -> Result<(), CoreError> + Send>;

/// Selection criteria for [`TaskStore::list`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    /// Keep only the `limit` most recently submitted matches.
    pub limit: Option<usize>,
}

impl TaskFilter {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.status.is_none_or(|s| task.status == s)
    }
}

/// Durable mapping from task id to task record.
///
/// Implementations must give read-your-writes consistency within a process
/// and apply each [`update`](TaskStore::update) atomically with respect to
/// every other update of the same task.
#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    /// Insert a new record. Fails if the id is already present.
    async fn put(&self, task: Task) -> Result<(), CoreError>;

    async fn get(&self, id: &TaskId) -> Result<Option<Task>, CoreError>;

    /// Apply `mutate` to the current record and persist the result.
    ///
    /// Returns the updated record, [`CoreError::NotFound`] for an unknown id,
    /// or whatever error `mutate` produced.
    async fn update(&self, id: &TaskId, mutate: TaskMutator) -> Result<Task, CoreError>;

    /// Records matching `filter`, ordered by `submitted_at` ascending (ties
    /// broken by id). With a limit, the newest `limit` of them.
    async fn list(&self, filter: TaskFilter) -> Result<Vec<Task>, CoreError>;
}

/// Process-local [`TaskStore`] backed by a `tokio::sync::RwLock<HashMap>`.
///
/// Many readers can observe tasks concurrently while writers take the lock
/// exclusively for the duration of a single read-modify-write.
#[derive(Debug, Clone, Default)]
pub struct MemoryTaskStore {
    inner: Arc<RwLock<HashMap<TaskId, Task>>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn put(&self, task: Task) -> Result<(), CoreError> {
        let mut guard = self.inner.write().await;
        if guard.contains_key(&task.id) {
            return Err(CoreError::Store(format!("duplicate task id {}", task.id)));
        }
        guard.insert(task.id.clone(), task);
        Ok(())
    }

    async fn get(&self, id: &TaskId) -> Result<Option<Task>, CoreError> {
        Ok(self.inner.read().await.get(id).cloned())
    }

    async fn update(&self, id: &TaskId, mutate: TaskMutator) -> Result<Task, CoreError> {
        let mut guard = self.inner.write().await;
        let record = guard.get_mut(id).ok_or_else(|| CoreError::NotFound {
            task_id: id.clone(),
        })?;
        // Mutate a copy so a rejected change leaves the stored record intact.
        let mut next = record.clone();
        mutate(&mut next)?;
        *record = next.clone();
        Ok(next)
    }

    async fn list(&self, filter: TaskFilter) -> Result<Vec<Task>, CoreError> {
        let guard = self.inner.read().await;
        let mut tasks: Vec<Task> = guard
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| {
            a.submitted_at
                .cmp(&b.submitted_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        if let Some(limit) = filter.limit {
            let skip = tasks.len().saturating_sub(limit);
            tasks.drain(..skip);
        }
        Ok(tasks)
    }
}
