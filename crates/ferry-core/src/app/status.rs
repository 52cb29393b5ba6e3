//! Status - キュー全体の統計

use serde::{Deserialize, Serialize};

use crate::domain::{StatusCounts, TaskId};

/// Counters of one worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub worker_id: String,
    pub current_task: Option<TaskId>,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub retried: u64,
}

/// Aggregate view returned by `QueueManager::get_queue_stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub running: bool,

    /// Worker tasks still alive.
    pub active_workers: usize,

    pub workers: Vec<WorkerSnapshot>,

    pub total_completed: u64,
    pub total_failed: u64,
    pub total_timed_out: u64,
    pub total_retried: u64,

    /// Store-wide counts, including tasks from earlier runs.
    pub tasks: StatusCounts,
}

impl QueueStats {
    pub fn new(
        running: bool,
        active_workers: usize,
        workers: Vec<WorkerSnapshot>,
        tasks: StatusCounts,
    ) -> Self {
        let sum = |f: fn(&WorkerSnapshot) -> u64| workers.iter().map(f).sum::<u64>();
        Self {
            running,
            active_workers,
            total_completed: sum(|w| w.completed),
            total_failed: sum(|w| w.failed),
            total_timed_out: sum(|w| w.timed_out),
            total_retried: sum(|w| w.retried),
            workers,
            tasks,
        }
    }

    /// Workers currently executing a task.
    pub fn busy_workers(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.current_task.is_some())
            .count()
    }
}
