use thiserror::Error;

use crate::domain::TaskConfigError;
use crate::store::StoreError;

/// Errors surfaced by `QueueManager` operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("task store failure: {0}")]
    Store(#[from] StoreError),

    #[error("no handler registered under '{0}'")]
    UnknownHandler(String),

    #[error("invalid task config: {0}")]
    InvalidConfig(#[from] TaskConfigError),

    #[error("could not encode payload for '{handler}': {source}")]
    Encode {
        handler: String,
        #[source]
        source: serde_json::Error,
    },
}
