//! In-memory task store.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{QueueKey, StoreError, TaskStore, retention_cutoff};
use crate::domain::{StatusCounts, Task, TaskId, TaskStatus, TaskType};

/// In-memory store state.
#[derive(Default)]
struct State {
    /// All task records (single source of truth).
    records: HashMap<TaskId, Task>,

    /// Claimable tasks per partition, best first.
    queues: HashMap<TaskType, BTreeSet<QueueKey>>,
}

impl State {
    fn reindex(&mut self, task: &Task) {
        let key = QueueKey::for_task(task);
        let queue = self.queues.entry(task.config.task_type).or_default();
        if task.status.is_claimable() {
            queue.insert(key);
        } else {
            queue.remove(&key);
        }
    }

    /// Walk the index in scan order, dropping entries whose record is gone
    /// or no longer claimable, and return up to `limit` eligible ids.
    fn eligible(&mut self, now: DateTime<Utc>, limit: usize) -> Vec<TaskId> {
        let mut found = Vec::new();
        for task_type in TaskType::ALL {
            let Some(queue) = self.queues.get_mut(&task_type) else {
                continue;
            };
            let mut stale = Vec::new();
            for key in queue.iter() {
                if found.len() >= limit {
                    break;
                }
                match self.records.get(&key.id) {
                    Some(task) if task.is_eligible(now) => found.push(key.id),
                    Some(task) if task.status.is_claimable() => {} // still backing off
                    _ => stale.push(*key),
                }
            }
            for key in stale {
                queue.remove(&key);
            }
            if found.len() >= limit {
                break;
            }
        }
        found
    }

    fn update(
        &mut self,
        id: TaskId,
        apply: impl FnOnce(&mut Task) -> Result<bool, StoreError>,
    ) -> Result<bool, StoreError> {
        let Some(task) = self.records.get_mut(&id) else {
            return Ok(false);
        };
        let mut next = task.clone();
        if !apply(&mut next)? {
            return Ok(false);
        }
        *task = next.clone();
        self.reindex(&next);
        Ok(true)
    }
}

/// Process-local `TaskStore`. Every operation runs under one mutex, which
/// is what makes `claim_next` atomic.
#[derive(Default)]
pub struct InMemoryTaskStore {
    state: Mutex<State>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn save(&self, task: &Task) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.records.insert(task.id, task.clone());
        state.reindex(task);
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.records.get(&id).cloned())
    }

    async fn update_status(&self, id: TaskId, status: TaskStatus) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.update(id, |task| {
            task.set_status(status, now)?;
            Ok(true)
        })
    }

    async fn transition_status(
        &self,
        id: TaskId,
        from: &[TaskStatus],
        to: TaskStatus,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.update(id, |task| {
            if !from.contains(&task.status) {
                return Ok(false);
            }
            task.set_status(to, now)?;
            Ok(true)
        })
    }

    async fn pop_pending(&self, limit: usize) -> Result<Vec<Task>, StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let ids = state.eligible(now, limit);
        Ok(ids
            .iter()
            .filter_map(|id| state.records.get(id).cloned())
            .collect())
    }

    async fn claim_next(&self, worker_id: &str) -> Result<Option<Task>, StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let Some(id) = state.eligible(now, 1).into_iter().next() else {
            return Ok(None);
        };
        state.update(id, |task| {
            task.claim(worker_id, now)?;
            Ok(true)
        })?;
        Ok(state.records.get(&id).cloned())
    }

    async fn cleanup_older_than(&self, days: u32) -> Result<usize, StoreError> {
        let Some(cutoff) = retention_cutoff(Utc::now(), days) else {
            return Ok(0);
        };
        let mut state = self.state.lock().await;
        let expired: Vec<Task> = state
            .records
            .values()
            .filter(|task| task.created_at <= cutoff)
            .cloned()
            .collect();
        for task in &expired {
            state.records.remove(&task.id);
            if let Some(queue) = state.queues.get_mut(&task.config.task_type) {
                queue.remove(&QueueKey::for_task(task));
            }
        }
        Ok(expired.len())
    }

    async fn count_by_status(&self) -> Result<StatusCounts, StoreError> {
        let state = self.state.lock().await;
        let mut counts = StatusCounts::default();
        for task in state.records.values() {
            counts.record(task.status);
        }
        Ok(counts)
    }

    async fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
