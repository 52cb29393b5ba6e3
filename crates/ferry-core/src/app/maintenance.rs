//! Maintenance loop - 期限切れタスクの削除と統計ログ
//!
//! # フロー
//! 1. `interval` ごとに `cleanup_older_than(retention_days)`
//! 2. store の status 別件数と worker カウンタをログ出力
//! 3. shutdown で終了

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use super::worker_loop::WorkerStats;
use crate::store::TaskStore;

pub(crate) struct Maintenance {
    pub store: Arc<dyn TaskStore>,
    pub interval: Duration,
    pub retention_days: u32,
    pub workers: Vec<(String, Arc<WorkerStats>)>,
}

impl Maintenance {
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => self.tick().await,
            }
        }
    }

    pub async fn tick(&self) {
        match self.store.cleanup_older_than(self.retention_days).await {
            Ok(0) => {}
            Ok(removed) => info!(removed, retention_days = self.retention_days, "removed expired tasks"),
            Err(err) => error!(error = %err, "task cleanup failed"),
        }

        let counts = match self.store.count_by_status().await {
            Ok(counts) => counts,
            Err(err) => {
                error!(error = %err, "failed to count tasks");
                return;
            }
        };

        let mut busy = 0;
        let mut completed = 0;
        let mut failed = 0;
        for (worker_id, stats) in &self.workers {
            let snapshot = stats.snapshot(worker_id).await;
            busy += usize::from(snapshot.current_task.is_some());
            completed += snapshot.completed;
            failed += snapshot.failed;
        }

        info!(
            pending = counts.pending,
            running = counts.running,
            retrying = counts.retrying,
            completed = counts.completed,
            failed = counts.failed,
            timeout = counts.timeout,
            cancelled = counts.cancelled,
            busy_workers = busy,
            workers = self.workers.len(),
            completed_here = completed,
            failed_here = failed,
            "task queue stats"
        );
    }
}
