use std::collections::HashMap;

use tokio::sync::{Mutex, MutexGuard};

use crate::runtime::task::Task;
use crate::runtime::types::{Fingerprint, TaskId};

/// In-memory map from fingerprint to the task that currently owns it.
///
/// Only `queued`/`processing` tasks own a fingerprint. The index is a cache
/// derived from the task store: [`rebuild`](Self::rebuild) reconstructs it
/// from the store's active tasks after a restart.
///
/// Check-and-register is atomic: callers take [`lock`](Self::lock), look the
/// fingerprint up, create the task and register it before the guard drops.
/// The guard may be held across task-store calls, which is why this uses
/// `tokio::sync::Mutex`.
#[derive(Debug, Default)]
pub struct DedupIndex {
    inner: Mutex<HashMap<Fingerprint, TaskId>>,
}

/// Exclusive view over the index for a single check-and-register.
pub struct DedupGuard<'a> {
    map: MutexGuard<'a, HashMap<Fingerprint, TaskId>>,
}

impl DedupGuard<'_> {
    pub fn owner(&self, fingerprint: &Fingerprint) -> Option<&TaskId> {
        self.map.get(fingerprint)
    }

    pub fn register(&mut self, fingerprint: Fingerprint, task_id: TaskId) {
        self.map.insert(fingerprint, task_id);
    }

    pub fn evict(&mut self, fingerprint: &Fingerprint) -> Option<TaskId> {
        self.map.remove(fingerprint)
    }
}

impl DedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self) -> DedupGuard<'_> {
        DedupGuard {
            map: self.inner.lock().await,
        }
    }

    /// Drop `task_id`'s ownership of `fingerprint`.
    ///
    /// A no-op when another task already owns the fingerprint. Returns whether
    /// an entry was removed.
    pub async fn release(&self, fingerprint: &Fingerprint, task_id: &TaskId) -> bool {
        let mut map = self.inner.lock().await;
        if map.get(fingerprint) == Some(task_id) {
            map.remove(fingerprint);
            true
        } else {
            false
        }
    }

    pub async fn owner(&self, fingerprint: &Fingerprint) -> Option<TaskId> {
        self.inner.lock().await.get(fingerprint).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    /// Replace the index with the owners found among `tasks`.
    ///
    /// Terminal tasks are skipped. If two active tasks share a fingerprint the
    /// earliest-submitted one keeps ownership.
    pub async fn rebuild<'a>(&self, tasks: impl IntoIterator<Item = &'a Task>) {
        let mut active: Vec<&Task> = tasks
            .into_iter()
            .filter(|t| t.status.is_active())
            .collect();
        active.sort_by_key(|t| (t.submitted_at, t.id.clone()));

        let mut map = self.inner.lock().await;
        map.clear();
        for task in active {
            map.entry(task.fingerprint.clone())
                .or_insert_with(|| task.id.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::runtime::types::VoiceParams;

    fn task(text: &str) -> Task {
        Task::new(text.into(), VoiceParams::default(), None, Utc::now())
    }

    #[tokio::test]
    async fn release_only_removes_matching_owner() {
        let index = DedupIndex::new();
        let first = task("hello");
        let second = task("hello");
        assert_eq!(first.fingerprint, second.fingerprint);

        index
            .lock()
            .await
            .register(first.fingerprint.clone(), first.id.clone());

        assert!(!index.release(&second.fingerprint, &second.id).await);
        assert_eq!(index.owner(&first.fingerprint).await, Some(first.id.clone()));

        assert!(index.release(&first.fingerprint, &first.id).await);
        assert!(index.is_empty().await);
    }

    #[tokio::test]
    async fn rebuild_keeps_earliest_active_owner() {
        let index = DedupIndex::new();

        let mut older = task("same");
        older.submitted_at = Utc::now() - Duration::seconds(10);
        let newer = task("same");
        let mut done = task("finished");
        done.mark_cancelled(Utc::now()).expect("cancel");

        index.rebuild([&newer, &older, &done]).await;

        assert_eq!(index.len().await, 1);
        assert_eq!(index.owner(&older.fingerprint).await, Some(older.id.clone()));
        assert_eq!(index.owner(&done.fingerprint).await, None);
    }

    #[tokio::test]
    async fn concurrent_check_and_register_admits_one_owner() {
        let index = std::sync::Arc::new(DedupIndex::new());
        let fingerprint = task("race").fingerprint;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let index = index.clone();
            let fingerprint = fingerprint.clone();
            handles.push(tokio::spawn(async move {
                let mut guard = index.lock().await;
                if guard.owner(&fingerprint).is_some() {
                    return false;
                }
                tokio::task::yield_now().await;
                guard.register(fingerprint, TaskId::generate());
                true
            }));
        }

        let mut winners = 0;
        for h in handles {
            if h.await.expect("join") {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
