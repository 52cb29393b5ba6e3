//! QueueManager - ワーカープールと公開 API
//!
//! - `start()` / `stop()` でプールのライフサイクルを管理（どちらも冪等）
//! - `submit` / `get_status` / `cancel` / `get_queue_stats` を提供
//! - グローバル状態は持たない。インスタンスを Arc で共有して使う

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::maintenance::Maintenance;
use super::status::QueueStats;
use super::worker_loop::{Worker, WorkerStats};
use crate::config::QueueConfig;
use crate::domain::{Task, TaskConfig, TaskId, TaskStatus, TaskStatusView};
use crate::error::QueueError;
use crate::store::TaskStore;
use crate::typed::{HandlerRegistry, Payload};

/// Per-submission settings.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub config: TaskConfig,
    pub user_id: Option<String>,
}

impl SubmitOptions {
    pub fn new(config: TaskConfig) -> Self {
        Self {
            config,
            user_id: None,
        }
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

impl From<TaskConfig> for SubmitOptions {
    fn from(config: TaskConfig) -> Self {
        Self::new(config)
    }
}

struct WorkerSlot {
    id: String,
    stats: Arc<WorkerStats>,
    join: JoinHandle<()>,
}

/// Handles of a started pool.
/// - `shutdown_tx` に true を送るとワーカーは新しいタスクを取らなくなる
/// - 実行中のタスクは最後まで走らせる（stop の猶予時間内なら）
struct Pool {
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<WorkerSlot>,
    maintenance: JoinHandle<()>,
}

pub struct QueueManager {
    store: Arc<dyn TaskStore>,
    registry: Arc<HandlerRegistry>,
    config: QueueConfig,
    wake: Arc<Notify>,
    pool: Mutex<Option<Pool>>,
}

impl QueueManager {
    pub(crate) fn new(
        store: Arc<dyn TaskStore>,
        registry: HandlerRegistry,
        config: QueueConfig,
    ) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            config,
            wake: Arc::new(Notify::new()),
            pool: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub async fn is_running(&self) -> bool {
        self.pool.lock().await.is_some()
    }

    /// Spawn `concurrency` workers and the maintenance loop. No-op when already running.
    pub async fn start(&self) {
        let mut pool = self.pool.lock().await;
        if pool.is_some() {
            debug!("task queue already running");
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pid = std::process::id();
        let mut workers = Vec::with_capacity(self.config.concurrency);
        for n in 0..self.config.concurrency {
            let stats = Arc::new(WorkerStats::default());
            let worker = Worker::new(
                format!("worker-{pid}-{n}"),
                Arc::clone(&self.store),
                Arc::clone(&self.registry),
                Arc::clone(&stats),
                self.config.poll_interval(),
                Arc::clone(&self.wake),
            );
            let id = worker.id().to_string();
            let join = tokio::spawn(worker.run(shutdown_rx.clone()));
            workers.push(WorkerSlot { id, stats, join });
        }

        let maintenance = Maintenance {
            store: Arc::clone(&self.store),
            interval: self.config.maintenance_interval(),
            retention_days: self.config.retention_days,
            workers: workers
                .iter()
                .map(|w| (w.id.clone(), Arc::clone(&w.stats)))
                .collect(),
        };
        let maintenance = tokio::spawn(maintenance.run(shutdown_rx));

        info!(
            workers = workers.len(),
            handlers = ?self.registry.registered_names(),
            "task queue started"
        );
        *pool = Some(Pool {
            shutdown_tx,
            workers,
            maintenance,
        });
    }

    /// Stop claiming, give in-flight tasks up to `grace` to finish, abort the
    /// rest, then flush the store. No-op when not running.
    ///
    /// A task aborted here stays RUNNING in the store.
    pub async fn stop(&self, grace: Duration) {
        let Some(pool) = self.pool.lock().await.take() else {
            return;
        };
        info!(grace_secs = grace.as_secs_f64(), "stopping task queue");

        // receivers may already be gone
        let _ = pool.shutdown_tx.send(true);
        self.wake.notify_waiters();

        let deadline = Instant::now() + grace;
        for mut slot in pool.workers {
            match tokio::time::timeout_at(deadline, &mut slot.join).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(worker_id = %slot.id, error = %err, "worker ended abnormally"),
                Err(_) => {
                    warn!(worker_id = %slot.id, "worker did not finish in time, aborting");
                    slot.join.abort();
                }
            }
        }

        let mut maintenance = pool.maintenance;
        if tokio::time::timeout_at(deadline, &mut maintenance).await.is_err() {
            maintenance.abort();
        }

        if let Err(err) = self.store.flush().await {
            error!(error = %err, "failed to flush task store");
        }
        info!("task queue stopped");
    }

    /// Submit a typed payload; the handler is `P::NAME`.
    pub async fn submit<P: Payload>(
        &self,
        payload: &P,
        options: impl Into<SubmitOptions>,
    ) -> Result<TaskId, QueueError> {
        let value = serde_json::to_value(payload).map_err(|source| QueueError::Encode {
            handler: P::NAME.to_string(),
            source,
        })?;
        self.submit_raw(P::NAME, value, options).await
    }

    /// Submit a JSON payload for a handler by name.
    pub async fn submit_raw(
        &self,
        handler: &str,
        payload: Value,
        options: impl Into<SubmitOptions>,
    ) -> Result<TaskId, QueueError> {
        let options = options.into();
        if !self.registry.contains(handler) {
            return Err(QueueError::UnknownHandler(handler.to_string()));
        }
        options.config.validate()?;

        let mut task = Task::new(handler, payload, options.config, Utc::now());
        task.user_id = options.user_id;

        if let Err(err) = self.store.save(&task).await {
            error!(task_id = %task.id, handler, error = %err, "failed to persist submitted task");
            return Err(err.into());
        }
        self.wake.notify_one();

        info!(
            task_id = %task.id,
            handler,
            priority = ?task.config.priority,
            task_type = %task.config.task_type,
            "task submitted"
        );
        Ok(task.id)
    }

    pub async fn get_status(&self, id: TaskId) -> Result<Option<Task>, QueueError> {
        Ok(self.store.get(id).await?)
    }

    pub async fn status_view(&self, id: TaskId) -> Result<Option<TaskStatusView>, QueueError> {
        Ok(self.get_status(id).await?.map(|task| task.view()))
    }

    /// Cancel a task that has not started (PENDING or RETRYING).
    ///
    /// `Ok(false)` when the task is unknown, running, or already finished.
    pub async fn cancel(&self, id: TaskId) -> Result<bool, QueueError> {
        let cancelled = self
            .store
            .transition_status(
                id,
                &[TaskStatus::Pending, TaskStatus::Retrying],
                TaskStatus::Cancelled,
            )
            .await?;
        if cancelled {
            info!(task_id = %id, "task cancelled");
        } else {
            debug!(task_id = %id, "cancel ignored: task is not waiting");
        }
        Ok(cancelled)
    }

    pub async fn get_queue_stats(&self) -> Result<QueueStats, QueueError> {
        let tasks = self.store.count_by_status().await?;
        let pool = self.pool.lock().await;
        let Some(pool) = pool.as_ref() else {
            return Ok(QueueStats::new(false, 0, Vec::new(), tasks));
        };

        let mut workers = Vec::with_capacity(pool.workers.len());
        for slot in &pool.workers {
            workers.push(slot.stats.snapshot(&slot.id).await);
        }
        let active = pool.workers.iter().filter(|w| !w.join.is_finished()).count();
        Ok(QueueStats::new(true, active, workers, tasks))
    }
}
