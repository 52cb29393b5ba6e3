//! Task identifiers.
//!
//! ULID ベースの ID を使います。
//! - **時刻でソート可能**: timestamp が先頭にあるため、生成順序でソートできる
//! - **複数プロセスで生成可能**: 調整なしで別プロセスからも衝突しない
//! - 128-bit なので store のキー (16 bytes) にそのまま使える

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

const PREFIX: &str = "task-";

/// Identifier of a submitted task.
///
/// Display は `task-<ULID>` 形式。外部（HTTP/bot）に返すのもこの形式です。
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Ulid);

impl TaskId {
    /// Generate a fresh id stamped with `now`.
    pub fn generate(now: DateTime<Utc>) -> Self {
        let timestamp_ms = u64::try_from(now.timestamp_millis()).unwrap_or_default();
        Self(Ulid::from_parts(timestamp_ms, rand::random()))
    }

    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    pub fn as_ulid(&self) -> Ulid {
        self.0
    }

    /// Big-endian bytes, used as the record key in persistent stores.
    pub fn to_bytes(&self) -> [u8; 16] {
        self.0.to_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Ulid::from_bytes(bytes))
    }
}

impl From<Ulid> for TaskId {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PREFIX}{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid task id '{input}': {source}")]
pub struct ParseTaskIdError {
    input: String,
    #[source]
    source: ulid::DecodeError,
}

impl FromStr for TaskId {
    type Err = ParseTaskIdError;

    /// `task-` プレフィックスは省略可
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(PREFIX).unwrap_or(s);
        Ulid::from_string(raw)
            .map(Self)
            .map_err(|source| ParseTaskIdError {
                input: s.to_string(),
                source,
            })
    }
}
