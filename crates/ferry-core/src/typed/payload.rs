//! Payload trait - handler 名と型の対応付け
//!
//! # 学習ポイント
//! - Associated Constants (`const NAME`)
//! - Associated Types (`type Output`)

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Payload ties a serde type to the name of the handler that runs it.
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Resize {
///     file_id: String,
///     width: u32,
/// }
///
/// impl Payload for Resize {
///     const NAME: &'static str = "files.resize.v1";
///     type Output = ResizedFile;
/// }
/// ```
///
/// # Trait Bounds
/// - `Serialize`: submit 時に JSON として store に保存するため
/// - `DeserializeOwned`: worker が store から復元するため
/// - `Send + Sync + 'static`: worker タスク間で共有するため
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Handler name stored on the task.
    ///
    /// # 命名規約
    /// - `{domain}.{action}.v{major}`
    /// - 例: `files.download_url.v1`
    const NAME: &'static str;

    /// Value the handler returns; stored as the task result.
    type Output: Serialize + Send;
}
