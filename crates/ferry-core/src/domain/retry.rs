//! Retry policy and the retry/fail decision.

use std::time::Duration;

/// Exponential backoff for failed tasks.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration) -> Self {
        Self {
            base_delay,
            multiplier: 2.0,
        }
    }

    /// Delay before retry number `retry` (1-indexed).
    ///
    /// delay = base_delay * multiplier^(retry - 1)
    ///
    /// base_delay=1s, multiplier=2.0 の場合:
    /// - retry 1: 1s
    /// - retry 2: 2s
    /// - retry 3: 4s
    pub fn next_delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(delay_secs).unwrap_or(Duration::MAX)
    }

    /// Decide what happens after a failed attempt.
    ///
    /// `retries_so_far` is the number of failures that were already retried.
    /// Pure function: the caller applies the decision to the task.
    pub fn decide(&self, retries_so_far: u32, max_retries: u32) -> Decision {
        if retries_so_far < max_retries {
            Decision::Retry {
                delay: self.next_delay(retries_so_far + 1),
            }
        } else {
            Decision::Fail
        }
    }
}

/// The next action for a task whose attempt failed.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Re-enqueue the task, eligible again after `delay`.
    Retry { delay: Duration },

    /// Give up: the task becomes FAILED.
    Fail,
}
