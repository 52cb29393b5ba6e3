//! Handler trait - Payload を実行する Handler の定義
//!
//! # 学習ポイント
//! - ジェネリック trait (Handler<P>)
//! - Object-safe trait (DynHandler)
//! - Type erasure パターン (TypedHandler<P, H> → DynHandler)

use std::marker::PhantomData;

use async_trait::async_trait;
use serde_json::Value;

use super::payload::Payload;

/// Error returned by a task handler.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The handler ran and failed. Subject to the retry policy.
    #[error("{0}")]
    Failed(String),

    #[error("handler '{handler}' could not decode payload: {source}")]
    Decode {
        handler: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("handler '{handler}' could not encode its output: {source}")]
    Encode {
        handler: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("no handler registered under '{0}'")]
    UnknownHandler(String),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    /// Worth another attempt? Decode/encode errors and unknown handlers
    /// fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Failed(_) | HandlerError::Panicked(_))
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError::Failed(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError::Failed(message.to_string())
    }
}

/// Handler は Payload を受け取って Output を返す
///
/// # 使用例
/// ```ignore
/// struct ResizeHandler;
///
/// #[async_trait]
/// impl Handler<Resize> for ResizeHandler {
///     async fn handle(&self, payload: Resize) -> Result<ResizedFile, HandlerError> {
///         ...
///     }
/// }
/// ```
///
/// # ジェネリクスによる型安全性
/// - `Handler<Resize>` は `Resize` しか受け取れない
/// - コンパイル時に Payload と Handler の対応が保証される
#[async_trait]
pub trait Handler<P: Payload>: Send + Sync {
    async fn handle(&self, payload: P) -> Result<P::Output, HandlerError>;
}

/// DynHandler は object-safe な Handler の抽象化
///
/// TypedHandler<P, H> を DynHandler に変換することで、
/// HashMap<String, Arc<dyn DynHandler>> に格納可能にします。
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(&self, payload: Value) -> Result<Value, HandlerError>;
    fn name(&self) -> &'static str;
}

pub struct TypedHandler<P: Payload, H: Handler<P>> {
    handler: H,
    _marker: PhantomData<fn(P)>,
}

impl<P: Payload, H: Handler<P>> TypedHandler<P, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<P: Payload, H: Handler<P>> DynHandler for TypedHandler<P, H> {
    async fn handle_dyn(&self, payload: Value) -> Result<Value, HandlerError> {
        let payload: P = serde_json::from_value(payload).map_err(|source| HandlerError::Decode {
            handler: P::NAME,
            source,
        })?;
        let output = self.handler.handle(payload).await?;
        serde_json::to_value(output).map_err(|source| HandlerError::Encode {
            handler: P::NAME,
            source,
        })
    }

    fn name(&self) -> &'static str {
        P::NAME
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_typed_handler_round_trips_json() {
        let handler = TypedHandler::<Add, _>::new(AddHandler);

        let output = handler.handle_dyn(json!({"a": 2, "b": 40})).await.unwrap();
        assert_eq!(output, json!(42));
        assert_eq!(handler.name(), "test.add.v1");
    }

    #[tokio::test]
    async fn test_bad_payload_is_a_permanent_error() {
        let handler = TypedHandler::<Add, _>::new(AddHandler);

        let err = handler.handle_dyn(json!({"a": "two"})).await.unwrap_err();
        assert!(matches!(err, HandlerError::Decode { handler: "test.add.v1", .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_handler_failure_is_retryable() {
        let handler = TypedHandler::<Fail, _>::new(FailHandler);

        let err = handler.handle_dyn(json!({"reason": "disk full"})).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "disk full");
    }
}
