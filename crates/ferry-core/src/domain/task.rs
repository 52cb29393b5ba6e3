//! Task record: identity, payload, configuration and evolving state.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::TaskId;
use super::retry::Decision;
use super::status::TaskStatus;
use super::task_config::TaskConfig;

/// Outcome stored on a task once it reaches a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,

    /// Handler return value (success only).
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub value: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Seconds spent in the last attempt.
    pub execution_time: f64,

    pub retries_used: u32,
}

/// Attempted a status change that is not an edge of the state machine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("task {id}: illegal status transition {from} -> {to}")]
pub struct TransitionError {
    pub id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// A unit of background work.
///
/// Design:
/// - Store が正本 (source of truth)。worker は claim したスナップショットを更新して save する
/// - 状態遷移はすべてここのメソッド経由 (field 直接書き換えはしない)
/// - 遷移表にない変更は `TransitionError` で拒否
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,

    /// Name of the registered handler that runs this task.
    pub handler: String,

    pub payload: Value,
    pub config: TaskConfig,
    pub status: TaskStatus,

    pub created_at: DateTime<Utc>,

    /// First time a worker picked the task up. Not reset on retry.
    pub started_at: Option<DateTime<Utc>>,

    /// Set on entering a terminal status.
    pub completed_at: Option<DateTime<Utc>>,

    /// A retrying task is not claimable before this instant.
    pub not_before: Option<DateTime<Utc>>,

    /// Failed attempts that were retried so far.
    pub retries: u32,

    /// `"attempt N: message"` per failed attempt, oldest first.
    pub error_history: Vec<String>,

    pub result: Option<TaskResult>,

    /// Worker that most recently executed the task.
    pub worker_id: Option<String>,

    /// Owner tag, opaque to the queue.
    pub user_id: Option<String>,
}

impl Task {
    pub fn new(
        handler: impl Into<String>,
        payload: Value,
        config: TaskConfig,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TaskId::generate(now),
            handler: handler.into(),
            payload,
            config,
            status: TaskStatus::Pending,
            created_at: now,
            started_at: None,
            completed_at: None,
            not_before: None,
            retries: 0,
            error_history: Vec::new(),
            result: None,
            worker_id: None,
            user_id: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    fn transition(&mut self, to: TaskStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Claimable right now: PENDING, or RETRYING with its backoff elapsed.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status.is_claimable() && self.not_before.is_none_or(|at| at <= now)
    }

    /// PENDING/RETRYING -> RUNNING on behalf of `worker_id`.
    pub fn claim(&mut self, worker_id: &str, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Running)?;
        self.started_at.get_or_insert(now);
        self.worker_id = Some(worker_id.to_string());
        self.not_before = None;
        Ok(())
    }

    /// Undo a claim whose handler never started (the worker was shutting down).
    ///
    /// Goes back to PENDING for a first attempt, RETRYING otherwise. This is
    /// not an edge of the state machine: no attempt happened.
    pub fn release(&mut self) -> Result<(), TransitionError> {
        let back = if self.retries == 0 {
            TaskStatus::Pending
        } else {
            TaskStatus::Retrying
        };
        if self.status != TaskStatus::Running {
            return Err(TransitionError {
                id: self.id,
                from: self.status,
                to: back,
            });
        }
        self.status = back;
        if back == TaskStatus::Pending {
            self.started_at = None;
        }
        self.worker_id = None;
        Ok(())
    }

    /// RUNNING -> COMPLETED.
    pub fn complete(
        &mut self,
        value: Value,
        execution_time: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Completed)?;
        self.completed_at = Some(now);
        self.result = Some(TaskResult {
            success: true,
            value,
            error: None,
            execution_time: execution_time.as_secs_f64(),
            retries_used: self.retries,
        });
        Ok(())
    }

    /// Record a failed attempt and apply the retry policy.
    ///
    /// `retryable = false` (decode error, unknown handler) skips the policy and
    /// fails the task immediately.
    pub fn record_failure(
        &mut self,
        message: &str,
        retryable: bool,
        execution_time: Duration,
        now: DateTime<Utc>,
    ) -> Result<Decision, TransitionError> {
        let decision = if retryable {
            self.config
                .retry_policy()
                .decide(self.retries, self.config.max_retries)
        } else {
            Decision::Fail
        };

        match decision {
            Decision::Retry { delay } => {
                self.transition(TaskStatus::Retrying)?;
                self.push_error(message);
                self.retries += 1;
                self.not_before = Some(after(now, delay));
            }
            Decision::Fail => {
                self.transition(TaskStatus::Failed)?;
                self.push_error(message);
                self.finish_with_error(message, execution_time, now);
            }
        }
        Ok(decision)
    }

    /// RUNNING attempt exceeded `limit`.
    ///
    /// Terminal TIMEOUT unless `retry_on_timeout` is set; then the timeout goes
    /// through the retry policy like any other error, and a task with no
    /// retries left still ends as TIMEOUT. Returns the retry decision when one
    /// was taken.
    pub fn time_out(
        &mut self,
        limit: Duration,
        execution_time: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Decision>, TransitionError> {
        let message = format!("task timed out after {:.1}s", limit.as_secs_f64());

        if self.config.retry_on_timeout && self.retries < self.config.max_retries {
            return self
                .record_failure(&message, true, execution_time, now)
                .map(Some);
        }

        self.transition(TaskStatus::Timeout)?;
        self.push_error(&message);
        self.finish_with_error(&message, execution_time, now);
        Ok(None)
    }

    /// PENDING/RETRYING -> CANCELLED. The handler never runs.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Cancelled)?;
        self.not_before = None;
        self.finish_with_error("cancelled before execution", Duration::ZERO, now);
        Ok(())
    }

    /// Bare status change along a legal edge.
    ///
    /// Terminal statuses still get `completed_at` and a `result`, so the
    /// record stays consistent even when the change bypasses the worker.
    pub fn set_status(
        &mut self,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(status)?;
        match status {
            TaskStatus::Running => {
                self.started_at.get_or_insert(now);
                self.not_before = None;
            }
            TaskStatus::Completed if self.result.is_none() => {
                self.completed_at = Some(now);
                self.result = Some(TaskResult {
                    success: true,
                    value: Value::Null,
                    error: None,
                    execution_time: 0.0,
                    retries_used: self.retries,
                });
            }
            TaskStatus::Cancelled => {
                self.not_before = None;
                self.finish_with_error("cancelled before execution", Duration::ZERO, now);
            }
            s if s.is_terminal() && self.result.is_none() => {
                self.finish_with_error(&format!("status set to {s}"), Duration::ZERO, now);
            }
            _ => {}
        }
        Ok(())
    }

    /// Error message of a terminal failure, if any.
    pub fn error(&self) -> Option<&str> {
        self.result.as_ref().and_then(|r| r.error.as_deref())
    }

    pub fn view(&self) -> TaskStatusView {
        TaskStatusView::from(self)
    }

    fn push_error(&mut self, message: &str) {
        let attempt = self.error_history.len() + 1;
        self.error_history.push(format!("attempt {attempt}: {message}"));
    }

    fn finish_with_error(&mut self, message: &str, execution_time: Duration, now: DateTime<Utc>) {
        self.completed_at = Some(now);
        self.result = Some(TaskResult {
            success: false,
            value: Value::Null,
            error: Some(message.to_string()),
            execution_time: execution_time.as_secs_f64(),
            retries_used: self.retries,
        });
    }
}

/// `now + delay`, saturating far in the future.
fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Response shape of the task polling endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusView {
    pub task_id: String,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub user_id: Option<String>,
}

impl From<&Task> for TaskStatusView {
    fn from(task: &Task) -> Self {
        let result = task
            .result
            .as_ref()
            .filter(|r| r.success)
            .map(|r| r.value.clone());
        Self {
            task_id: task.id.to_string(),
            status: task.status,
            result,
            error: task.error().map(str::to_string),
            created_at: task.created_at,
            completed_at: task.completed_at,
            user_id: task.user_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::task_config::TaskConfig;
    use serde_json::json;

    fn task(config: TaskConfig) -> Task {
        Task::new("test.echo.v1", json!({"n": 1}), config, Utc::now())
    }

    #[test]
    fn test_new_task_is_pending() {
        let t = task(TaskConfig::default());
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.retries, 0);
        assert!(t.result.is_none());
        assert!(t.is_eligible(Utc::now()));
    }

    #[test]
    fn test_claim_sets_started_at_once() {
        let mut t = task(TaskConfig::default().with_retry_delay(0.0));
        let first = Utc::now();
        t.claim("worker-1", first).unwrap();
        assert_eq!(t.started_at, Some(first));

        t.record_failure("boom", true, Duration::ZERO, first).unwrap();
        let later = first + TimeDelta::seconds(5);
        t.claim("worker-2", later).unwrap();

        assert_eq!(t.started_at, Some(first));
        assert_eq!(t.worker_id.as_deref(), Some("worker-2"));
    }

    #[test]
    fn test_release_undoes_claim() {
        let original = task(TaskConfig::default());
        let mut t = original.clone();
        t.claim("worker-1", Utc::now()).unwrap();
        t.release().unwrap();
        assert_eq!(t, original);
        assert!(t.is_eligible(Utc::now()));

        // a retry goes back to RETRYING and keeps its history
        let mut t = task(TaskConfig::default().with_retry_delay(0.0));
        let now = Utc::now();
        t.claim("worker-1", now).unwrap();
        t.record_failure("boom", true, Duration::ZERO, now).unwrap();
        t.claim("worker-2", now).unwrap();
        t.release().unwrap();
        assert_eq!(t.status, TaskStatus::Retrying);
        assert_eq!(t.started_at, Some(now));
        assert_eq!(t.retries, 1);
        assert_eq!(t.worker_id, None);

        let err = task(TaskConfig::default()).release().unwrap_err();
        assert_eq!(err.from, TaskStatus::Pending);
    }

    #[test]
    fn test_complete_fills_result() {
        let mut t = task(TaskConfig::default());
        let now = Utc::now();
        t.claim("w", now).unwrap();
        t.complete(json!("done"), Duration::from_millis(1500), now)
            .unwrap();

        let result = t.result.as_ref().unwrap();
        assert!(result.success);
        assert_eq!(result.value, json!("done"));
        assert_eq!(result.execution_time, 1.5);
        assert_eq!(t.completed_at, Some(now));
    }

    #[test]
    fn test_failure_schedules_retry_with_backoff() {
        let mut t = task(TaskConfig::default().with_retry_delay(2.0));
        let now = Utc::now();
        t.claim("w", now).unwrap();

        let decision = t.record_failure("boom", true, Duration::ZERO, now).unwrap();

        assert_eq!(
            decision,
            Decision::Retry {
                delay: Duration::from_secs(2)
            }
        );
        assert_eq!(t.status, TaskStatus::Retrying);
        assert_eq!(t.retries, 1);
        assert_eq!(t.error_history, vec!["attempt 1: boom".to_string()]);
        assert_eq!(t.not_before, Some(now + TimeDelta::seconds(2)));
        assert!(!t.is_eligible(now));
        assert!(t.is_eligible(now + TimeDelta::seconds(2)));
        assert!(t.result.is_none());
    }

    #[test]
    fn test_exhausted_retries_fail() {
        let mut t = task(TaskConfig::default().with_max_retries(1).with_retry_delay(0.0));
        let now = Utc::now();

        t.claim("w", now).unwrap();
        t.record_failure("first", true, Duration::ZERO, now).unwrap();
        t.claim("w", now).unwrap();
        let decision = t.record_failure("second", true, Duration::ZERO, now).unwrap();

        assert_eq!(decision, Decision::Fail);
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.error_history.len(), 2);
        assert_eq!(t.error_history[1], "attempt 2: second");
        let result = t.result.as_ref().unwrap();
        assert!(!result.success);
        assert_eq!(result.retries_used, 1);
        assert_eq!(result.error.as_deref(), Some("second"));
    }

    #[test]
    fn test_permanent_failure_skips_retries() {
        let mut t = task(TaskConfig::default().with_max_retries(5));
        let now = Utc::now();
        t.claim("w", now).unwrap();

        let decision = t
            .record_failure("bad payload", false, Duration::ZERO, now)
            .unwrap();

        assert_eq!(decision, Decision::Fail);
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.retries, 0);
    }

    #[test]
    fn test_timeout_is_terminal_by_default() {
        let mut t = task(TaskConfig::default().with_timeout(1.0));
        let now = Utc::now();
        t.claim("w", now).unwrap();

        let decision = t
            .time_out(Duration::from_secs(1), Duration::from_secs(1), now)
            .unwrap();

        assert_eq!(decision, None);
        assert_eq!(t.status, TaskStatus::Timeout);
        assert_eq!(t.error(), Some("task timed out after 1.0s"));
        assert!(t.completed_at.is_some());
    }

    #[test]
    fn test_timeout_can_be_retried() {
        let mut t = task(
            TaskConfig::default()
                .with_timeout(1.0)
                .with_max_retries(1)
                .with_retry_delay(0.0)
                .with_retry_on_timeout(true),
        );
        let now = Utc::now();

        t.claim("w", now).unwrap();
        let first = t.time_out(Duration::from_secs(1), Duration::ZERO, now).unwrap();
        assert!(matches!(first, Some(Decision::Retry { .. })));
        assert_eq!(t.status, TaskStatus::Retrying);

        t.claim("w", now).unwrap();
        let second = t.time_out(Duration::from_secs(1), Duration::ZERO, now).unwrap();
        assert_eq!(second, None);
        assert_eq!(t.status, TaskStatus::Timeout);
        assert_eq!(t.error_history.len(), 2);
    }

    #[test]
    fn test_cancel_only_before_running() {
        let now = Utc::now();

        let mut pending = task(TaskConfig::default());
        pending.cancel(now).unwrap();
        assert_eq!(pending.status, TaskStatus::Cancelled);
        assert!(pending.completed_at.is_some());
        assert!(pending.result.is_some());

        let mut running = task(TaskConfig::default());
        running.claim("w", now).unwrap();
        let err = running.cancel(now).unwrap_err();
        assert_eq!(err.from, TaskStatus::Running);
        assert_eq!(running.status, TaskStatus::Running);
    }

    #[test]
    fn test_terminal_task_rejects_changes() {
        let mut t = task(TaskConfig::default());
        let now = Utc::now();
        t.claim("w", now).unwrap();
        t.complete(Value::Null, Duration::ZERO, now).unwrap();

        assert!(t.claim("w", now).is_err());
        assert!(t.set_status(TaskStatus::Failed, now).is_err());
        assert_eq!(t.status, TaskStatus::Completed);
    }

    #[test]
    fn test_set_status_keeps_terminal_invariant() {
        let mut t = task(TaskConfig::default());
        let now = Utc::now();
        t.set_status(TaskStatus::Running, now).unwrap();
        t.set_status(TaskStatus::Failed, now).unwrap();

        assert_eq!(t.completed_at, Some(now));
        assert_eq!(t.error(), Some("status set to failed"));
    }

    #[test]
    fn test_view_exposes_value_only_on_success() {
        let now = Utc::now();
        let mut t = task(TaskConfig::default()).with_user("42");
        t.claim("w", now).unwrap();
        t.complete(json!({"file": "a.bin"}), Duration::ZERO, now)
            .unwrap();

        let view = t.view();
        assert_eq!(view.task_id, t.id.to_string());
        assert_eq!(view.result, Some(json!({"file": "a.bin"})));
        assert_eq!(view.error, None);
        assert_eq!(view.user_id.as_deref(), Some("42"));
    }

    #[test]
    fn test_json_round_trip_is_lossless() {
        let now = Utc::now();
        let mut t = task(TaskConfig::default().with_retry_delay(0.5));
        t.claim("w", now).unwrap();
        t.record_failure("boom", true, Duration::ZERO, now).unwrap();

        let bytes = serde_json::to_vec(&t).unwrap();
        let back: Task = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, t);
    }
}
