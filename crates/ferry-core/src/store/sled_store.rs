//! Durable task store on top of sled.
//!
//! Layout:
//! - tree `tasks`: task id (16 bytes) → JSON record
//! - tree `queue:<task_type>` per partition: `QueueKey` bytes → task id
//!
//! Record updates go through compare-and-swap, so a claim made by one worker
//! can never be overwritten by another worker's stale copy.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sled::{Db, IVec, Tree};
use tracing::{debug, warn};

use super::{QueueKey, StoreError, TaskStore, retention_cutoff};
use crate::domain::{StatusCounts, Task, TaskId, TaskStatus, TaskType};

const TASKS_TREE: &str = "tasks";

enum Update {
    Missing,
    Unchanged,
    Applied(Task),
}

pub struct SledTaskStore {
    db: Db,
    tasks: Tree,
    /// Indexed by `TaskType::index()`.
    queues: Vec<Tree>,
}

impl SledTaskStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "opened sled task store");
        Self::from_db(db)
    }

    /// Throwaway database, removed on drop.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self, StoreError> {
        let tasks = db.open_tree(TASKS_TREE)?;
        let queues = TaskType::ALL
            .iter()
            .map(|task_type| db.open_tree(format!("queue:{}", task_type.as_str())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { db, tasks, queues })
    }

    fn queue(&self, task_type: TaskType) -> &Tree {
        &self.queues[task_type.index()]
    }

    fn reindex(&self, task: &Task) -> Result<(), StoreError> {
        let key = QueueKey::for_task(task).to_bytes();
        let queue = self.queue(task.config.task_type);
        if task.status.is_claimable() {
            queue.insert(key, &task.id.to_bytes()[..])?;
        } else {
            queue.remove(key)?;
        }
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<Task, StoreError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Read-modify-write of one record, retried until the CAS wins.
    fn update_record(
        &self,
        id: TaskId,
        mut apply: impl FnMut(&mut Task) -> Result<bool, StoreError>,
    ) -> Result<Update, StoreError> {
        let key = id.to_bytes();
        loop {
            let Some(current) = self.tasks.get(key)? else {
                return Ok(Update::Missing);
            };
            let mut task = Self::decode(&current)?;
            if !apply(&mut task)? {
                return Ok(Update::Unchanged);
            }
            let encoded = serde_json::to_vec(&task)?;
            match self
                .tasks
                .compare_and_swap(key, Some(&current), Some(encoded))?
            {
                Ok(()) => {
                    self.reindex(&task)?;
                    return Ok(Update::Applied(task));
                }
                Err(_) => debug!(task_id = %id, "concurrent update, retrying"),
            }
        }
    }

    fn index_entry_id(value: &IVec) -> Result<TaskId, StoreError> {
        let bytes = <[u8; 16]>::try_from(&value[..])
            .map_err(|_| StoreError::CorruptIndex(format!("{} byte task id", value.len())))?;
        Ok(TaskId::from_bytes(bytes))
    }

    /// Walk one partition in index order, calling `visit` with every record the
    /// index points at. Entries for missing or terminal records are removed.
    /// `visit` returns `true` to stop the walk.
    fn scan(
        &self,
        task_type: TaskType,
        mut visit: impl FnMut(Task) -> Result<bool, StoreError>,
    ) -> Result<bool, StoreError> {
        let queue = self.queue(task_type);
        for entry in queue.iter() {
            let (key, value) = entry?;
            let id = Self::index_entry_id(&value)?;
            let task = match self.tasks.get(id.to_bytes())? {
                Some(bytes) => Self::decode(&bytes)?,
                None => {
                    queue.remove(key)?;
                    continue;
                }
            };
            if task.status.is_terminal() {
                queue.remove(key)?;
                continue;
            }
            if visit(task)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn try_claim(
        &self,
        candidate: &Task,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError> {
        let update = self.update_record(candidate.id, |task| {
            if !task.is_eligible(now) {
                return Ok(false);
            }
            task.claim(worker_id, now)?;
            Ok(true)
        })?;
        Ok(match update {
            Update::Applied(task) => Some(task),
            Update::Missing | Update::Unchanged => None,
        })
    }

    /// Decode every record, skipping (and logging) entries that fail to decode.
    fn all_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let mut tasks = Vec::new();
        for entry in self.tasks.iter() {
            let (key, value) = entry?;
            match Self::decode(&value) {
                Ok(task) => tasks.push(task),
                Err(err) => warn!(key = ?key, error = %err, "skipping undecodable task record"),
            }
        }
        Ok(tasks)
    }
}

#[async_trait]
impl TaskStore for SledTaskStore {
    async fn save(&self, task: &Task) -> Result<(), StoreError> {
        let encoded = serde_json::to_vec(task)?;
        self.tasks.insert(task.id.to_bytes(), encoded)?;
        self.reindex(task)
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        self.tasks
            .get(id.to_bytes())?
            .map(|bytes| Self::decode(&bytes))
            .transpose()
    }

    async fn update_status(&self, id: TaskId, status: TaskStatus) -> Result<bool, StoreError> {
        let now = Utc::now();
        let update = self.update_record(id, |task| {
            task.set_status(status, now)?;
            Ok(true)
        })?;
        Ok(matches!(update, Update::Applied(_)))
    }

    async fn transition_status(
        &self,
        id: TaskId,
        from: &[TaskStatus],
        to: TaskStatus,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let update = self.update_record(id, |task| {
            if !from.contains(&task.status) {
                return Ok(false);
            }
            task.set_status(to, now)?;
            Ok(true)
        })?;
        Ok(matches!(update, Update::Applied(_)))
    }

    async fn pop_pending(&self, limit: usize) -> Result<Vec<Task>, StoreError> {
        let now = Utc::now();
        let mut found = Vec::new();
        if limit == 0 {
            return Ok(found);
        }
        for task_type in TaskType::ALL {
            let full = self.scan(task_type, |task| {
                if task.is_eligible(now) {
                    found.push(task);
                }
                Ok(found.len() >= limit)
            })?;
            if full {
                break;
            }
        }
        Ok(found)
    }

    async fn claim_next(&self, worker_id: &str) -> Result<Option<Task>, StoreError> {
        let now = Utc::now();
        let mut claimed = None;
        for task_type in TaskType::ALL {
            let done = self.scan(task_type, |candidate| {
                if !candidate.is_eligible(now) {
                    return Ok(false);
                }
                // losing the CAS means someone else took it; keep looking
                claimed = self.try_claim(&candidate, worker_id, now)?;
                Ok(claimed.is_some())
            })?;
            if done {
                break;
            }
        }
        Ok(claimed)
    }

    async fn cleanup_older_than(&self, days: u32) -> Result<usize, StoreError> {
        let Some(cutoff) = retention_cutoff(Utc::now(), days) else {
            return Ok(0);
        };
        let mut removed = 0;
        for task in self.all_tasks()? {
            if task.created_at > cutoff {
                continue;
            }
            self.tasks.remove(task.id.to_bytes())?;
            self.queue(task.config.task_type)
                .remove(QueueKey::for_task(&task).to_bytes())?;
            removed += 1;
        }
        Ok(removed)
    }

    async fn count_by_status(&self) -> Result<StatusCounts, StoreError> {
        let mut counts = StatusCounts::default();
        for task in self.all_tasks()? {
            counts.record(task.status);
        }
        Ok(counts)
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let bytes = self.db.flush_async().await?;
        debug!(bytes, "flushed sled task store");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskConfig, TaskPriority};
    use chrono::TimeDelta;
    use serde_json::json;

    fn task(priority: TaskPriority, created_at: DateTime<Utc>) -> Task {
        Task::new(
            "test.echo.v1",
            json!({"n": 1}),
            TaskConfig::default().with_priority(priority),
            created_at,
        )
    }

    #[tokio::test]
    async fn test_save_get_round_trip() {
        let store = SledTaskStore::temporary().unwrap();
        let t = task(TaskPriority::Normal, Utc::now()).with_user("7");
        store.save(&t).await.unwrap();

        assert_eq!(store.get(t.id).await.unwrap(), Some(t));
        assert_eq!(store.get(TaskId::generate(Utc::now())).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_claim_order_and_exclusivity() {
        let store = SledTaskStore::temporary().unwrap();
        let now = Utc::now();
        let low = task(TaskPriority::Low, now);
        let high = task(TaskPriority::High, now + TimeDelta::milliseconds(1));
        let normal = task(TaskPriority::Normal, now + TimeDelta::milliseconds(2));
        for t in [&low, &high, &normal] {
            store.save(t).await.unwrap();
        }

        let mut order = Vec::new();
        while let Some(t) = store.claim_next("worker-a").await.unwrap() {
            assert_eq!(t.status, TaskStatus::Running);
            assert_eq!(t.worker_id.as_deref(), Some("worker-a"));
            order.push(t.id);
        }
        assert_eq!(order, vec![high.id, normal.id, low.id]);

        let stored = store.get(high.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Running);
        assert!(stored.started_at.is_some());
    }

    #[tokio::test]
    async fn test_terminal_tasks_leave_the_index() {
        let store = SledTaskStore::temporary().unwrap();
        let mut t = task(TaskPriority::Normal, Utc::now());
        store.save(&t).await.unwrap();
        assert_eq!(store.pop_pending(10).await.unwrap().len(), 1);

        t.cancel(Utc::now()).unwrap();
        store.save(&t).await.unwrap();
        assert!(store.pop_pending(10).await.unwrap().is_empty());
        assert!(store.claim_next("w").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_conditional_cancel() {
        let store = SledTaskStore::temporary().unwrap();
        let t = task(TaskPriority::Normal, Utc::now());
        store.save(&t).await.unwrap();
        let from = [TaskStatus::Pending, TaskStatus::Retrying];

        assert!(
            store
                .transition_status(t.id, &from, TaskStatus::Cancelled)
                .await
                .unwrap()
        );
        assert!(
            !store
                .transition_status(t.id, &from, TaskStatus::Cancelled)
                .await
                .unwrap()
        );
        let stored = store.get(t.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Cancelled);
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.db");
        let t = task(TaskPriority::High, Utc::now());

        {
            let store = SledTaskStore::open(&path).unwrap();
            store.save(&t).await.unwrap();
            store.flush().await.unwrap();
        }

        let store = SledTaskStore::open(&path).unwrap();
        assert_eq!(store.get(t.id).await.unwrap(), Some(t.clone()));
        let claimed = store.claim_next("w").await.unwrap().unwrap();
        assert_eq!(claimed.id, t.id);
    }

    #[tokio::test]
    async fn test_cleanup_and_counts() {
        let store = SledTaskStore::temporary().unwrap();
        let old = task(TaskPriority::Normal, Utc::now() - TimeDelta::days(30));
        let fresh = task(TaskPriority::Normal, Utc::now());
        store.save(&old).await.unwrap();
        store.save(&fresh).await.unwrap();
        store.update_status(fresh.id, TaskStatus::Running).await.unwrap();

        // one old and one recent record per terminal status
        let terminal = [
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
            TaskStatus::Timeout,
        ];
        for status in terminal {
            for age in [TimeDelta::days(30), TimeDelta::hours(1)] {
                let t = task(TaskPriority::Normal, Utc::now() - age);
                store.save(&t).await.unwrap();
                if status != TaskStatus::Cancelled {
                    store.update_status(t.id, TaskStatus::Running).await.unwrap();
                }
                store.update_status(t.id, status).await.unwrap();
            }
        }

        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.running, 1);
        for status in terminal {
            assert_eq!(counts.get(status), 2);
        }

        assert_eq!(store.cleanup_older_than(7).await.unwrap(), 5);
        assert!(store.pop_pending(10).await.unwrap().is_empty());
        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts.running, 1);
        for status in terminal {
            assert_eq!(counts.get(status), 1);
        }

        assert_eq!(store.cleanup_older_than(0).await.unwrap(), 5);
        assert_eq!(store.count_by_status().await.unwrap().total(), 0);
    }
}
