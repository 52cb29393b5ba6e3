//! File download payloads.
//!
//! The queue only defines the payload/output contract here; the download
//! executor registers a `Handler` for each of them.

use serde::{Deserialize, Serialize};

use super::payload::Payload;
use crate::domain::TaskConfig;

/// Download a file from a public URL into the user's storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadUrl {
    pub url: String,

    /// Overrides the name derived from the URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

impl DownloadUrl {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            file_name: None,
        }
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    /// Config the file routes submit URL downloads with.
    pub fn default_config() -> TaskConfig {
        TaskConfig::url_download()
    }
}

impl Payload for DownloadUrl {
    const NAME: &'static str = "files.download_url.v1";
    type Output = DownloadedFile;
}

/// Fetch a file the user sent to the bot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadTelegramFile {
    pub file_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

impl Payload for DownloadTelegramFile {
    const NAME: &'static str = "files.download_telegram.v1";
    type Output = DownloadedFile;
}

/// Where a finished download ended up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadedFile {
    pub file_name: String,
    pub file_path: String,
    pub file_size: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}
