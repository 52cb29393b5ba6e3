//! Task status state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a task.
///
/// State transitions:
/// - Pending -> Running -> Completed
/// - Pending -> Running -> Retrying -> Running (loop until max_retries)
/// - Pending -> Running -> Failed / Timeout
/// - Pending | Retrying -> Cancelled (never started)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Waiting to be claimed by a worker.
    Pending,

    /// Currently being executed by a worker.
    Running,

    Completed,

    /// Failed permanently (retries exhausted or a permanent error).
    Failed,

    /// Failed at least once; waiting for its backoff before the next attempt.
    Retrying,

    Cancelled,

    /// Exceeded its configured timeout.
    Timeout,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Retrying,
        TaskStatus::Cancelled,
        TaskStatus::Timeout,
    ];

    /// Is this a terminal status (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Timeout
        )
    }

    /// Can a worker pick this task up (subject to `not_before`)?
    pub fn is_claimable(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Retrying)
    }

    /// Is `self -> next` an edge of the state machine?
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Retrying)
                | (Running, Failed)
                | (Running, Timeout)
                | (Retrying, Running)
                | (Retrying, Failed)
                | (Retrying, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Number of stored tasks per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub retrying: usize,
    pub cancelled: usize,
    pub timeout: usize,
}

impl StatusCounts {
    pub fn record(&mut self, status: TaskStatus) {
        self.add(status, 1);
    }

    pub fn add(&mut self, status: TaskStatus, n: usize) {
        let slot = match status {
            TaskStatus::Pending => &mut self.pending,
            TaskStatus::Running => &mut self.running,
            TaskStatus::Completed => &mut self.completed,
            TaskStatus::Failed => &mut self.failed,
            TaskStatus::Retrying => &mut self.retrying,
            TaskStatus::Cancelled => &mut self.cancelled,
            TaskStatus::Timeout => &mut self.timeout,
        };
        *slot += n;
    }

    pub fn get(&self, status: TaskStatus) -> usize {
        match status {
            TaskStatus::Pending => self.pending,
            TaskStatus::Running => self.running,
            TaskStatus::Completed => self.completed,
            TaskStatus::Failed => self.failed,
            TaskStatus::Retrying => self.retrying,
            TaskStatus::Cancelled => self.cancelled,
            TaskStatus::Timeout => self.timeout,
        }
    }

    pub fn total(&self) -> usize {
        TaskStatus::ALL.iter().map(|s| self.get(*s)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use TaskStatus::*;

    #[rstest]
    #[case(Pending, Running)]
    #[case(Pending, Cancelled)]
    #[case(Running, Completed)]
    #[case(Running, Retrying)]
    #[case(Running, Failed)]
    #[case(Running, Timeout)]
    #[case(Retrying, Running)]
    #[case(Retrying, Failed)]
    #[case(Retrying, Cancelled)]
    fn test_allowed_edges(#[case] from: TaskStatus, #[case] to: TaskStatus) {
        assert!(from.can_transition_to(to));
    }

    #[rstest]
    #[case(Pending, Completed)]
    #[case(Pending, Retrying)]
    #[case(Running, Cancelled)]
    #[case(Running, Pending)]
    #[case(Retrying, Completed)]
    #[case(Completed, Running)]
    #[case(Failed, Retrying)]
    #[case(Cancelled, Pending)]
    #[case(Timeout, Running)]
    fn test_rejected_edges(#[case] from: TaskStatus, #[case] to: TaskStatus) {
        assert!(!from.can_transition_to(to));
    }

    #[test]
    fn test_terminal_statuses_have_no_outgoing_edges() {
        for from in TaskStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in TaskStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_serializes_in_upper_case() {
        assert_eq!(serde_json::to_string(&Retrying).unwrap(), "\"RETRYING\"");
        assert_eq!(Retrying.to_string(), "retrying");
    }

    #[test]
    fn test_counts_total() {
        let mut counts = StatusCounts::default();
        counts.record(Pending);
        counts.record(Pending);
        counts.record(Failed);
        assert_eq!(counts.get(Pending), 2);
        assert_eq!(counts.total(), 3);
    }
}
