//! App - アプリケーション層
//!
//! domain / typed / store を組み合わせてキューを動かします。
//!
//! # 主要コンポーネント
//! - **QueueBuilder**: handler 登録と起動時検証
//! - **QueueManager**: ワーカープール、submit / status / cancel / stats
//! - **Worker**: タスク実行ループ（claim→handle→decide→save）
//! - **Maintenance**: 期限切れタスクの削除と統計ログ

pub mod builder;
pub mod manager;
pub mod status;
pub mod worker_loop;

mod maintenance;

pub use self::builder::{BuildError, QueueBuilder};
pub use self::manager::{QueueManager, SubmitOptions};
pub use self::status::{QueueStats, WorkerSnapshot};
pub use self::worker_loop::{Worker, WorkerStats};
