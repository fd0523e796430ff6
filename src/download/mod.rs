//! HTTP downloads with progress, integrity checks and a filename-keyed cache.

mod cache;
mod checksum;
mod manager;

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use checksum::Checksums;
pub use manager::DownloadManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    Idle,
    Downloading,
    DownloadingUnknownSize,
    Error,
    ErrorInvalidSize,
    ErrorBadChecksum,
    Done,
    Canceled,
    Cached,
}

impl DownloadState {
    pub fn is_success(self) -> bool {
        matches!(self, DownloadState::Done | DownloadState::Cached)
    }

    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            DownloadState::Idle | DownloadState::Downloading | DownloadState::DownloadingUnknownSize
        )
    }
}

/// What to fetch and how to verify it.
#[derive(Debug, Clone, Default)]
pub struct DownloadRequest {
    pub url: String,
    pub checksums: Checksums,
    /// Logical file name; when set the result is cached under it.
    pub cache_key: Option<String>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn checksums(mut self, checksums: Checksums) -> Self {
        self.checksums = checksums;
        self
    }

    pub fn cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }
}

/// Progress snapshot handed to progress callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadProgress {
    pub state: DownloadState,
    pub downloaded: u64,
    pub total: Option<u64>,
    pub percent: Option<u8>,
}

pub type ProgressCallback = Arc<dyn Fn(&DownloadProgress) + Send + Sync>;

/// Result of `download_file`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadOutcome {
    pub state: DownloadState,
    /// Final location; only set on success.
    pub path: Option<PathBuf>,
    /// Bytes transferred over the network by this call.
    pub downloaded: u64,
}

/// A cache entry found on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedFile {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}
