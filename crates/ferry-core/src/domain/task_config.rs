//! Per-task configuration: priority, category and retry/timeout knobs.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::retry::RetryPolicy;

/// Scheduling priority. Higher runs first within a queue partition.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    pub fn weight(self) -> u8 {
        match self {
            TaskPriority::Low => 1,
            TaskPriority::Normal => 2,
            TaskPriority::High => 3,
            TaskPriority::Critical => 4,
        }
    }
}

/// Category tag of a task. Also the store's queue partition key.
///
/// Partitions are scanned in [`TaskType::ALL`] order; a backlog in an
/// earlier partition is always drained before a later one is looked at.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    FileDownload,
    FileUpload,
    FileProcessing,
    Cleanup,
    Notification,
    #[default]
    General,
}

impl TaskType {
    pub const ALL: [TaskType; 6] = [
        TaskType::FileDownload,
        TaskType::FileUpload,
        TaskType::FileProcessing,
        TaskType::Cleanup,
        TaskType::Notification,
        TaskType::General,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::FileDownload => "file_download",
            TaskType::FileUpload => "file_upload",
            TaskType::FileProcessing => "file_processing",
            TaskType::Cleanup => "cleanup",
            TaskType::Notification => "notification",
            TaskType::General => "general",
        }
    }

    /// Position in the scan order.
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TaskConfigError {
    #[error("retry_delay must be a finite, non-negative number of seconds (got {0})")]
    InvalidRetryDelay(f64),

    #[error("timeout must be a finite, positive number of seconds (got {0})")]
    InvalidTimeout(f64),
}

/// Execution settings attached to each task at submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// How many failed attempts may be retried. 0 = run once.
    pub max_retries: u32,

    /// Base backoff in seconds; the n-th retry waits `retry_delay * 2^(n-1)`.
    pub retry_delay: f64,

    /// Wall-clock limit per attempt, in seconds. `None` = unbounded.
    pub timeout: Option<f64>,

    pub priority: TaskPriority,

    pub task_type: TaskType,

    /// Treat a timeout like a retryable error instead of a terminal status.
    pub retry_on_timeout: bool,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: 1.0,
            timeout: None,
            priority: TaskPriority::Normal,
            task_type: TaskType::General,
            retry_on_timeout: false,
        }
    }
}

impl TaskConfig {
    /// Settings the file routes use for "download from URL" jobs:
    /// one retry, an hour to finish.
    pub fn url_download() -> Self {
        Self {
            max_retries: 1,
            timeout: Some(3600.0),
            task_type: TaskType::FileDownload,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, seconds: f64) -> Self {
        self.retry_delay = seconds;
        self
    }

    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_task_type(mut self, task_type: TaskType) -> Self {
        self.task_type = task_type;
        self
    }

    pub fn with_retry_on_timeout(mut self, retry_on_timeout: bool) -> Self {
        self.retry_on_timeout = retry_on_timeout;
        self
    }

    pub fn validate(&self) -> Result<(), TaskConfigError> {
        if !self.retry_delay.is_finite() || self.retry_delay < 0.0 {
            return Err(TaskConfigError::InvalidRetryDelay(self.retry_delay));
        }
        if let Some(timeout) = self.timeout
            && (!timeout.is_finite() || timeout <= 0.0)
        {
            return Err(TaskConfigError::InvalidTimeout(timeout));
        }
        Ok(())
    }

    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(Duration::try_from_secs_f64(self.retry_delay).unwrap_or_default())
    }
}
