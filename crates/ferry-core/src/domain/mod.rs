//! Domain model: ids, status state machine, task config, retry policy, task record.
//!
//! このモジュールは I/O を持たない純粋なモデルです。
//! 時刻は呼び出し側から `now` として渡します（テストで固定できるように）。

pub mod ids;
pub mod retry;
pub mod status;
pub mod task;
pub mod task_config;

pub use ids::{ParseTaskIdError, TaskId};
pub use retry::{Decision, RetryPolicy};
pub use status::{StatusCounts, TaskStatus};
pub use task::{Task, TaskResult, TaskStatusView, TransitionError};
pub use task_config::{TaskConfig, TaskConfigError, TaskPriority, TaskType};
