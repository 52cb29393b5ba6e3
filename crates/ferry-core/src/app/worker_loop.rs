//! Worker - タスク実行ループ
//!
//! # フロー
//! 1. TaskStore::claim_next() で次のタスクを RUNNING にして取得
//! 2. 無ければ poll_interval / submit 通知 / shutdown のどれかまで待つ
//!    （claim 中に shutdown が来たらタスクを戻して終了）
//! 3. Handler を別タスクで実行（timeout 付き、panic も捕捉）
//! 4. 結果を Task に反映（complete / retry / fail / timeout）
//! 5. TaskStore::save() で保存

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use super::status::WorkerSnapshot;
use crate::domain::{Decision, Task, TaskId, TransitionError};
use crate::store::TaskStore;
use crate::typed::{HandlerError, HandlerRegistry};

/// Counters owned by one worker, readable by the manager at any time.
#[derive(Debug, Default)]
pub struct WorkerStats {
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    retried: AtomicU64,
    current: Mutex<Option<TaskId>>,
}

impl WorkerStats {
    pub async fn snapshot(&self, worker_id: &str) -> WorkerSnapshot {
        WorkerSnapshot {
            worker_id: worker_id.to_string(),
            current_task: *self.current.lock().await,
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Result of running the handler once.
enum Attempt {
    Completed(Value),
    Failed(HandlerError),
    TimedOut(Duration),
}

/// Aborts the spawned handler if the worker is dropped mid-execution
/// (e.g. aborted by `QueueManager::stop`).
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// A single logical executor pulling from the shared store.
pub struct Worker {
    id: String,
    store: Arc<dyn TaskStore>,
    registry: Arc<HandlerRegistry>,
    stats: Arc<WorkerStats>,
    poll_interval: Duration,
    wake: Arc<Notify>,
}

impl Worker {
    pub fn new(
        id: String,
        store: Arc<dyn TaskStore>,
        registry: Arc<HandlerRegistry>,
        stats: Arc<WorkerStats>,
        poll_interval: Duration,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            id,
            store,
            registry,
            stats,
            poll_interval,
            wake,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run until `shutdown` turns true (or its sender is dropped).
    ///
    /// An in-flight task is always finished before the flag is checked.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.id, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.store.claim_next(&self.id).await {
                // stop may have been signalled while the claim was in flight
                Ok(Some(task)) if *shutdown.borrow() => {
                    self.release(task).await;
                    break;
                }
                Ok(Some(task)) => {
                    self.execute(task).await;
                    continue;
                }
                Ok(None) => {}
                Err(err) => error!(worker_id = %self.id, error = %err, "failed to claim task"),
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        info!(worker_id = %self.id, "worker stopped");
    }

    /// Hand a task claimed during shutdown back to the queue untouched.
    async fn release(&self, mut task: Task) {
        let task_id = task.id;
        if let Err(err) = task.release() {
            error!(worker_id = %self.id, %task_id, error = %err, "could not release task");
            return;
        }
        match self.store.save(&task).await {
            Ok(()) => info!(worker_id = %self.id, %task_id, "released task claimed during shutdown"),
            Err(err) => {
                error!(worker_id = %self.id, %task_id, error = %err, "failed to persist released task")
            }
        }
    }

    async fn execute(&self, mut task: Task) {
        let task_id = task.id;
        *self.stats.current.lock().await = Some(task_id);
        debug!(
            worker_id = %self.id,
            %task_id,
            handler = %task.handler,
            attempt = task.retries + 1,
            "executing task"
        );

        let started = Instant::now();
        let attempt = self.invoke(&task).await;
        let elapsed = started.elapsed();

        if let Err(err) = self.apply(&mut task, attempt, elapsed) {
            // claim already put the task in RUNNING, so this means the record
            // was modified behind our back
            error!(worker_id = %self.id, %task_id, error = %err, "could not record task outcome");
        }

        if let Err(err) = self.store.save(&task).await {
            error!(worker_id = %self.id, %task_id, error = %err, "failed to persist task outcome");
        }
        *self.stats.current.lock().await = None;
    }

    async fn invoke(&self, task: &Task) -> Attempt {
        let Some(handler) = self.registry.get(&task.handler) else {
            return Attempt::Failed(HandlerError::UnknownHandler(task.handler.clone()));
        };

        let payload = task.payload.clone();
        let mut running = AbortOnDrop(tokio::spawn(async move {
            handler.handle_dyn(payload).await
        }));

        let joined = match task.config.timeout_duration() {
            Some(limit) => match tokio::time::timeout(limit, &mut running.0).await {
                Ok(joined) => joined,
                Err(_) => return Attempt::TimedOut(limit),
            },
            None => (&mut running.0).await,
        };

        match joined {
            Ok(Ok(value)) => Attempt::Completed(value),
            Ok(Err(err)) => Attempt::Failed(err),
            Err(err) => Attempt::Failed(HandlerError::Panicked(join_error_message(err))),
        }
    }

    fn apply(
        &self,
        task: &mut Task,
        attempt: Attempt,
        elapsed: Duration,
    ) -> Result<(), TransitionError> {
        let now = Utc::now();
        let task_id = task.id;
        match attempt {
            Attempt::Completed(value) => {
                task.complete(value, elapsed, now)?;
                WorkerStats::bump(&self.stats.completed);
                info!(
                    worker_id = %self.id,
                    %task_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "task completed"
                );
            }
            Attempt::Failed(err) => {
                let decision =
                    task.record_failure(&err.to_string(), err.is_retryable(), elapsed, now)?;
                self.log_decision(task, &decision, &err.to_string());
            }
            Attempt::TimedOut(limit) => match task.time_out(limit, elapsed, now)? {
                Some(decision) => {
                    self.log_decision(task, &decision, "timed out");
                }
                None => {
                    WorkerStats::bump(&self.stats.timed_out);
                    warn!(
                        worker_id = %self.id,
                        %task_id,
                        timeout_secs = limit.as_secs_f64(),
                        "task timed out"
                    );
                }
            },
        }
        Ok(())
    }

    fn log_decision(&self, task: &Task, decision: &Decision, error: &str) {
        match decision {
            Decision::Retry { delay } => {
                WorkerStats::bump(&self.stats.retried);
                warn!(
                    worker_id = %self.id,
                    task_id = %task.id,
                    retry = task.retries,
                    max_retries = task.config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error,
                    "task failed, retry scheduled"
                );
            }
            Decision::Fail => {
                WorkerStats::bump(&self.stats.failed);
                error!(
                    worker_id = %self.id,
                    task_id = %task.id,
                    retries = task.retries,
                    error,
                    "task failed"
                );
            }
        }
    }
}

fn join_error_message(err: JoinError) -> String {
    let payload: Box<dyn Any + Send> = match err.try_into_panic() {
        Ok(payload) => payload,
        Err(_) => return "handler task was cancelled".to_string(),
    };
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{StatusCounts, TaskConfig, TaskStatus};
    use crate::store::{InMemoryTaskStore, StoreError};
    use crate::typed::handler::testing::{Add, AddHandler};
    use crate::typed::{Handler, Payload};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Serialize, Deserialize)]
    struct Explode;

    impl Payload for Explode {
        const NAME: &'static str = "test.explode.v1";
        type Output = ();
    }

    struct ExplodeHandler;

    #[async_trait]
    impl Handler<Explode> for ExplodeHandler {
        async fn handle(&self, _payload: Explode) -> Result<(), HandlerError> {
            panic!("kaboom");
        }
    }

    fn worker(store: Arc<dyn TaskStore>) -> (Worker, Arc<WorkerStats>) {
        let mut registry = HandlerRegistry::new();
        registry.register::<Add, _>(AddHandler).unwrap();
        registry.register::<Explode, _>(ExplodeHandler).unwrap();
        let stats = Arc::new(WorkerStats::default());
        let worker = Worker::new(
            "worker-test-0".into(),
            store,
            Arc::new(registry),
            Arc::clone(&stats),
            Duration::from_millis(10),
            Arc::new(Notify::new()),
        );
        (worker, stats)
    }

    async fn run_once(store: &Arc<dyn TaskStore>, worker: &Worker, task: Task) -> Task {
        store.save(&task).await.unwrap();
        let claimed = store.claim_next(worker.id()).await.unwrap().unwrap();
        worker.execute(claimed).await;
        store.get(task.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_completes_and_counts() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let (worker, stats) = worker(Arc::clone(&store));
        let task = Task::new(Add::NAME, json!({"a": 1, "b": 2}), TaskConfig::default(), Utc::now());

        let done = run_once(&store, &worker, task).await;

        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.worker_id.as_deref(), Some("worker-test-0"));
        let snapshot = stats.snapshot(worker.id()).await;
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.current_task, None);
    }

    #[tokio::test]
    async fn test_panic_is_caught_as_failure() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let (worker, stats) = worker(Arc::clone(&store));
        let task = Task::new(
            Explode::NAME,
            json!(null),
            TaskConfig::default().with_max_retries(0),
            Utc::now(),
        );

        let done = run_once(&store, &worker, task).await;

        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.error(), Some("handler panicked: kaboom"));
        assert_eq!(stats.snapshot(worker.id()).await.failed, 1);
    }

    #[tokio::test]
    async fn test_unknown_handler_fails_without_retry() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let (worker, _stats) = worker(Arc::clone(&store));
        let task = Task::new(
            "gone.v1",
            json!({}),
            TaskConfig::default().with_max_retries(3),
            Utc::now(),
        );

        let done = run_once(&store, &worker, task).await;

        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.retries, 0);
        assert_eq!(done.error(), Some("no handler registered under 'gone.v1'"));
    }

    #[tokio::test]
    async fn test_undecodable_payload_fails_without_retry() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let (worker, _stats) = worker(Arc::clone(&store));
        let task = Task::new(Add::NAME, json!("not an object"), TaskConfig::default(), Utc::now());

        let done = run_once(&store, &worker, task).await;

        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.retries, 0);
    }

    #[tokio::test]
    async fn test_run_exits_when_shutdown_is_signalled() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let (worker, _stats) = worker(store);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(rx));

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    /// Delays every claim so a shutdown can land while one is in flight.
    struct SlowClaims {
        inner: InMemoryTaskStore,
        delay: Duration,
    }

    #[async_trait]
    impl TaskStore for SlowClaims {
        async fn save(&self, task: &Task) -> Result<(), StoreError> {
            self.inner.save(task).await
        }
        async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
            self.inner.get(id).await
        }
        async fn update_status(&self, id: TaskId, status: TaskStatus) -> Result<bool, StoreError> {
            self.inner.update_status(id, status).await
        }
        async fn transition_status(
            &self,
            id: TaskId,
            from: &[TaskStatus],
            to: TaskStatus,
        ) -> Result<bool, StoreError> {
            self.inner.transition_status(id, from, to).await
        }
        async fn pop_pending(&self, limit: usize) -> Result<Vec<Task>, StoreError> {
            self.inner.pop_pending(limit).await
        }
        async fn claim_next(&self, worker_id: &str) -> Result<Option<Task>, StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.claim_next(worker_id).await
        }
        async fn cleanup_older_than(&self, days: u32) -> Result<usize, StoreError> {
            self.inner.cleanup_older_than(days).await
        }
        async fn count_by_status(&self) -> Result<StatusCounts, StoreError> {
            self.inner.count_by_status().await
        }
        async fn flush(&self) -> Result<(), StoreError> {
            self.inner.flush().await
        }
    }

    #[tokio::test]
    async fn test_task_claimed_during_shutdown_is_released() {
        let store: Arc<dyn TaskStore> = Arc::new(SlowClaims {
            inner: InMemoryTaskStore::new(),
            delay: Duration::from_millis(200),
        });
        let task = Task::new(Add::NAME, json!({"a": 1, "b": 2}), TaskConfig::default(), Utc::now());
        store.save(&task).await.unwrap();

        let (worker, stats) = worker(Arc::clone(&store));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();

        let stored = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored, task);
        assert_eq!(stats.snapshot("worker-test-0").await.completed, 0);
        assert_eq!(store.pop_pending(10).await.unwrap().len(), 1);
    }
}
