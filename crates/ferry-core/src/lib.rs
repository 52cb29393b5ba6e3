//! ferry-core
//!
//! Background task queue: typed handlers, priority-ordered persistent
//! storage, a worker pool with timeout and exponential-backoff retries.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, status, task_config, retry, task）
//! - **typed**: 型付き handler API（Payload, Handler, HandlerRegistry）
//! - **store**: TaskStore trait と実装（in-memory, sled, sqlite）
//! - **app**: QueueBuilder, QueueManager, Worker, maintenance
//! - **config**: QueueConfig（ファイル + 環境変数）
//! - **error**: QueueError

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod store;
pub mod typed;

pub use app::{BuildError, QueueBuilder, QueueManager, QueueStats, SubmitOptions};
pub use config::{ConfigError, QueueConfig, StoreConfig};
pub use domain::{
    Task, TaskConfig, TaskId, TaskPriority, TaskResult, TaskStatus, TaskStatusView, TaskType,
};
pub use error::QueueError;
pub use store::{InMemoryTaskStore, SledTaskStore, SqliteTaskStore, StoreError, TaskStore};
pub use typed::{Handler, HandlerError, HandlerRegistry, Payload};
