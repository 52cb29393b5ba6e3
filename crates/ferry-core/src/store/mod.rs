//! TaskStore - タスクレコードの正本（source of truth）
//!
//! TaskStore は以下を管理します：
//! - レコード本体（id → JSON）
//! - TaskType ごとの優先度インデックス（claim 可能なタスクのみ）
//!
//! # 実装
//! - **InMemoryTaskStore**: プロセス内（テスト/開発用）
//! - **SledTaskStore**: 永続化（sled, パーティションごとに別 tree）。単一プロセス専用
//! - **SqliteTaskStore**: 永続化（SQLite WAL）。複数プロセスで共有できる
//!
//! # 設計原則
//! - インデックスはヒントに過ぎない。claim 時にレコード側の status を必ず再検証する
//! - 終端状態のレコードはインデックスから外す（スキャン時に見つけたら掃除する）

mod memory;
mod sled_store;
mod sqlite_store;

pub use self::memory::InMemoryTaskStore;
pub use self::sled_store::SledTaskStore;
pub use self::sqlite_store::SqliteTaskStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use crate::config::StoreConfig;
use crate::domain::{StatusCounts, Task, TaskId, TaskStatus, TransitionError};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(#[from] ::sled::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt task row: {0}")]
    CorruptRow(String),

    #[error("task record codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("corrupt index entry: {0}")]
    CorruptIndex(String),
}

/// Persistence for task records plus a per-`TaskType` priority index.
///
/// All methods take `&self`; implementations are shared by every worker.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert or overwrite a snapshot and keep the index in sync with its status.
    async fn save(&self, task: &Task) -> Result<(), StoreError>;

    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError>;

    /// Move a task to `status` along a legal edge. `Ok(false)` for an unknown id.
    async fn update_status(&self, id: TaskId, status: TaskStatus) -> Result<bool, StoreError>;

    /// Compare-and-set: change to `to` only if the current status is one of `from`.
    async fn transition_status(
        &self,
        id: TaskId,
        from: &[TaskStatus],
        to: TaskStatus,
    ) -> Result<bool, StoreError>;

    /// Up to `limit` claimable tasks in scan order, left untouched.
    ///
    /// Not atomic: two callers can receive the same task. Workers use
    /// [`TaskStore::claim_next`].
    async fn pop_pending(&self, limit: usize) -> Result<Vec<Task>, StoreError>;

    /// Atomically pick the next claimable task and flip it to RUNNING.
    async fn claim_next(&self, worker_id: &str) -> Result<Option<Task>, StoreError>;

    /// Delete every record created at or before `now - days`, whatever its status.
    async fn cleanup_older_than(&self, days: u32) -> Result<usize, StoreError>;

    async fn count_by_status(&self) -> Result<StatusCounts, StoreError>;

    /// Persist buffered writes.
    async fn flush(&self) -> Result<(), StoreError>;
}

/// Open the store selected by configuration.
pub async fn open(config: &StoreConfig) -> Result<Arc<dyn TaskStore>, StoreError> {
    match config {
        StoreConfig::Memory => Ok(Arc::new(InMemoryTaskStore::new())),
        StoreConfig::Sled { path } => Ok(Arc::new(SledTaskStore::open(path)?)),
        StoreConfig::Sqlite { path } => Ok(Arc::new(SqliteTaskStore::open(path).await?)),
    }
}

/// Position of a task inside its partition's index.
///
/// Ordering: priority weight descending, then created_at ascending, then id.
/// `to_bytes` preserves that ordering lexicographically for sled trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct QueueKey {
    rank: u8,
    created_micros: u64,
    id: TaskId,
}

impl QueueKey {
    pub(crate) const LEN: usize = 1 + 8 + 16;

    pub(crate) fn for_task(task: &Task) -> Self {
        // flip the sign bit so negative timestamps sort before positive ones
        let micros = task.created_at.timestamp_micros() as u64 ^ (1 << 63);
        Self {
            rank: u8::MAX - task.config.priority.weight(),
            created_micros: micros,
            id: task.id,
        }
    }

    pub(crate) fn to_bytes(self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0] = self.rank;
        out[1..9].copy_from_slice(&self.created_micros.to_be_bytes());
        out[9..].copy_from_slice(&self.id.to_bytes());
        out
    }
}

/// `now - days`, or `None` when the window reaches past the representable range.
pub(crate) fn retention_cutoff(now: DateTime<Utc>, days: u32) -> Option<DateTime<Utc>> {
    TimeDelta::try_days(i64::from(days)).and_then(|window| now.checked_sub_signed(window))
}
