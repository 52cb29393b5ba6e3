//! Typed - 型付き handler API
//!
//! このモジュールは handler 名の typo を型で排除し、
//! Payload と Handler の対応付けを静的に保証します。
//!
//! # 二層構造
//! - **表層（Typed）**: `Payload` trait, `Handler<P>` trait - 型安全
//! - **内部（Dyn）**: `DynHandler` trait - object-safe, type erasure

pub mod downloads;
pub mod handler;
pub mod payload;
pub mod registry;

pub use self::downloads::{DownloadTelegramFile, DownloadUrl, DownloadedFile};
pub use self::handler::{DynHandler, Handler, HandlerError, TypedHandler};
pub use self::payload::Payload;
pub use self::registry::{HandlerRegistry, RegistryError};
