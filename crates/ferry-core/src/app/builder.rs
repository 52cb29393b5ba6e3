//! QueueBuilder - キューの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）

use std::sync::Arc;

use super::manager::QueueManager;
use crate::config::QueueConfig;
use crate::store::{self, StoreError, TaskStore};
use crate::typed::{Handler, HandlerRegistry, Payload, RegistryError};

/// QueueBuilder は handler 登録・設定・store をまとめて QueueManager を作る
///
/// # 使用例
/// ```ignore
/// let manager = QueueBuilder::new()
///     .register::<DownloadUrl, _>(UrlDownloader::new(client))?
///     .expect_handlers(&[DownloadUrl::NAME])
///     .config(QueueConfig::load(None)?)
///     .build()
///     .await?;
/// ```
///
/// # Fail-fast 設計
/// - expect_handlers() で必要な handler 名を宣言
/// - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
/// - 不足があれば BuildError を返す（worker が起動してから気付くのを防ぐ）
pub struct QueueBuilder {
    registry: HandlerRegistry,
    expected_handlers: Option<Vec<String>>,
    config: QueueConfig,
    store: Option<Arc<dyn TaskStore>>,
}

/// BuildError はキュー構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing handlers: {0:?}. These handlers were expected but not registered.")]
    MissingHandlers(Vec<String>),

    #[error("failed to open task store: {0}")]
    Store(#[from] StoreError),
}

impl QueueBuilder {
    pub fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(),
            expected_handlers: None,
            config: QueueConfig::default(),
            store: None,
        }
    }

    /// Handler を登録
    pub fn register<P: Payload, H: Handler<P> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<P, H>(handler)?;
        Ok(self)
    }

    /// 起動に必要な handler 名のリストを設定
    pub fn expect_handlers(mut self, names: &[&str]) -> Self {
        self.expected_handlers = Some(names.iter().map(|name| name.to_string()).collect());
        self
    }

    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Use an already opened store instead of the one named by the config.
    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// # 検証
    /// - expect_handlers() の名前が全て登録されているかチェック
    /// - store が未指定なら config.store から開く
    pub async fn build(self) -> Result<QueueManager, BuildError> {
        if let Some(expected) = &self.expected_handlers {
            let missing: Vec<String> = expected
                .iter()
                .filter(|name| !self.registry.contains(name))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingHandlers(missing));
            }
        }

        let store = match self.store {
            Some(store) => store,
            None => store::open(&self.config.store).await?,
        };
        Ok(QueueManager::new(store, self.registry, self.config))
    }
}

impl Default for QueueBuilder {
    fn default() -> Self {
        Self::new()
    }
}
