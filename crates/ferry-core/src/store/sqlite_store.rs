//! Shared task store on top of SQLite (sqlx).
//!
//! 複数プロセスから同じ DB ファイルを開ける唯一の永続 backend です。
//! - WAL モード: 書き込み中も他プロセスの読み取り（status ポーリング）が通る
//! - claim / cancel は条件付き `UPDATE` 1 文。勝者は常に 1 人
//!
//! Layout: one `tasks` table. `record` (JSON) is the source of truth; the other
//! columns mirror the fields the claim query filters and orders on.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{ConnectOptions, Row, SqlitePool};
use tracing::debug;

use super::{StoreError, TaskStore, retention_cutoff};
use crate::domain::{StatusCounts, Task, TaskId, TaskStatus};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id          TEXT PRIMARY KEY,
        status      TEXT NOT NULL,
        type_rank   INTEGER NOT NULL,
        priority    INTEGER NOT NULL,
        created_at  INTEGER NOT NULL,
        not_before  INTEGER,
        record      TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_tasks_claim ON tasks(status, type_rank, priority DESC, created_at, id)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks(created_at)",
];

/// Claimable rows in scan order: task type partition, priority, age, id.
const ELIGIBLE: &str = r#"
    status IN ('pending', 'retrying')
    AND (not_before IS NULL OR not_before <= ?1)
    ORDER BY type_rank, priority DESC, created_at, id
"#;

/// Same fields as `Task::claim`, written in the statement that wins the row.
fn claim_sql() -> String {
    format!(
        r#"
        UPDATE tasks
        SET status = 'running',
            not_before = NULL,
            record = json_set(
                record,
                '$.status', 'RUNNING',
                '$.started_at', COALESCE(json_extract(record, '$.started_at'), ?2),
                '$.worker_id', ?3,
                '$.not_before', NULL
            )
        WHERE id = (SELECT id FROM tasks WHERE {ELIGIBLE} LIMIT 1)
          AND status IN ('pending', 'retrying')
        RETURNING record
        "#
    )
}

enum Update {
    Missing,
    Unchanged,
    Applied,
}

pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Open (creating if needed) the database file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true)
            .disable_statement_logging();

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        for statement in SCHEMA {
            sqlx::query(*statement).execute(&pool).await?;
        }
        debug!(path = %path.as_ref().display(), "opened sqlite task store");
        Ok(Self { pool })
    }

    fn key(id: TaskId) -> String {
        id.to_string()
    }

    fn decode(record: &str) -> Result<Task, StoreError> {
        Ok(serde_json::from_str(record)?)
    }

    /// Read-modify-write of one row. The write only lands if the record is
    /// still the one that was read; otherwise re-read and apply again.
    async fn update_record(
        &self,
        id: TaskId,
        mut apply: impl FnMut(&mut Task) -> Result<bool, StoreError> + Send,
    ) -> Result<Update, StoreError> {
        let key = Self::key(id);
        loop {
            let Some(row) = sqlx::query("SELECT record FROM tasks WHERE id = ?1")
                .bind(&key)
                .fetch_optional(&self.pool)
                .await?
            else {
                return Ok(Update::Missing);
            };
            let current: String = row.try_get("record")?;
            let mut task = Self::decode(&current)?;
            if !apply(&mut task)? {
                return Ok(Update::Unchanged);
            }

            let written = sqlx::query(
                "UPDATE tasks SET status = ?1, not_before = ?2, record = ?3 \
                 WHERE id = ?4 AND record = ?5",
            )
            .bind(task.status.as_str())
            .bind(micros(task.not_before))
            .bind(serde_json::to_string(&task)?)
            .bind(&key)
            .bind(&current)
            .execute(&self.pool)
            .await?
            .rows_affected();
            if written == 1 {
                return Ok(Update::Applied);
            }
            debug!(task_id = %id, "concurrent update, retrying");
        }
    }
}

fn micros(at: Option<DateTime<Utc>>) -> Option<i64> {
    at.map(|at| at.timestamp_micros())
}

fn parse_status(raw: &str) -> Result<TaskStatus, StoreError> {
    TaskStatus::ALL
        .into_iter()
        .find(|status| status.as_str() == raw)
        .ok_or_else(|| StoreError::CorruptRow(format!("unknown status {raw:?}")))
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn save(&self, task: &Task) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO tasks (id, status, type_rank, priority, created_at, not_before, record)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                type_rank = excluded.type_rank,
                priority = excluded.priority,
                not_before = excluded.not_before,
                record = excluded.record
            "#,
        )
        .bind(Self::key(task.id))
        .bind(task.status.as_str())
        .bind(task.config.task_type.index() as i64)
        .bind(i64::from(task.config.priority.weight()))
        .bind(task.created_at.timestamp_micros())
        .bind(micros(task.not_before))
        .bind(serde_json::to_string(task)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query("SELECT record FROM tasks WHERE id = ?1")
            .bind(Self::key(id))
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(Self::decode(row.try_get("record")?)?)),
            None => Ok(None),
        }
    }

    async fn update_status(&self, id: TaskId, status: TaskStatus) -> Result<bool, StoreError> {
        let now = Utc::now();
        let update = self
            .update_record(id, |task| {
                task.set_status(status, now)?;
                Ok(true)
            })
            .await?;
        Ok(matches!(update, Update::Applied))
    }

    async fn transition_status(
        &self,
        id: TaskId,
        from: &[TaskStatus],
        to: TaskStatus,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let update = self
            .update_record(id, |task| {
                if !from.contains(&task.status) {
                    return Ok(false);
                }
                task.set_status(to, now)?;
                Ok(true)
            })
            .await?;
        Ok(matches!(update, Update::Applied))
    }

    async fn pop_pending(&self, limit: usize) -> Result<Vec<Task>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let sql = format!("SELECT record FROM tasks WHERE {ELIGIBLE} LIMIT ?2");
        let rows = sqlx::query(&sql)
            .bind(Utc::now().timestamp_micros())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| Self::decode(row.try_get("record")?))
            .collect()
    }

    async fn claim_next(&self, worker_id: &str) -> Result<Option<Task>, StoreError> {
        let now = Utc::now();
        let sql = claim_sql();
        let row = sqlx::query(&sql)
            .bind(now.timestamp_micros())
            .bind(now.to_rfc3339_opts(SecondsFormat::Micros, true))
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(Self::decode(row.try_get("record")?)?)),
            None => Ok(None),
        }
    }

    async fn cleanup_older_than(&self, days: u32) -> Result<usize, StoreError> {
        let Some(cutoff) = retention_cutoff(Utc::now(), days) else {
            return Ok(0);
        };
        let removed = sqlx::query("DELETE FROM tasks WHERE created_at <= ?1")
            .bind(cutoff.timestamp_micros())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(usize::try_from(removed).unwrap_or(usize::MAX))
    }

    async fn count_by_status(&self) -> Result<StatusCounts, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM tasks GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = StatusCounts::default();
        for row in rows {
            let status = parse_status(row.try_get("status")?)?;
            let n: i64 = row.try_get("n")?;
            counts.add(status, usize::try_from(n).unwrap_or_default());
        }
        Ok(counts)
    }

    /// Commits are already durable; this folds the WAL back into the main file.
    async fn flush(&self) -> Result<(), StoreError> {
        sqlx::query("PRAGMA wal_checkpoint(PASSIVE)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
