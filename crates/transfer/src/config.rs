//! Transfer configuration.
//!
//! Reads/writes camelCase JSON. Every field is optional on disk; missing
//! fields fall back to the protocol defaults.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use lakeflow_protocol::constants::{
    BULK_BLOCK_SIZE, DEFAULT_BLOCK_SIZE, DEFAULT_DOWNLOAD_RETRY_BUDGET, DEFAULT_MAX_CONCURRENCY,
    DEFAULT_SPEED_WINDOW, LARGE_FILE_THRESHOLD, MAX_APPEND_SIZE,
};
use lakeflow_protocol::{Preconditions, TransferRange};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::TransferError;
use crate::progress::ProgressCallback;
use crate::validation::{validate_block_size, validate_concurrency, validate_read_range};

/// Engine-wide limits and defaults, passed explicitly into every transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransferConfig {
    /// Explicit block size. When unset the planner picks one per transfer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_size: Option<u64>,
    pub max_concurrency: usize,
    /// Hard per-append byte limit of the remote service.
    pub max_append_size: u64,
    pub default_block_size: u64,
    pub bulk_block_size: u64,
    /// Known-length sources above this size use `bulk_block_size`.
    pub large_file_threshold: u64,
    pub download_retry_budget: u32,
    pub speed_window_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            block_size: None,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_append_size: MAX_APPEND_SIZE,
            default_block_size: DEFAULT_BLOCK_SIZE,
            bulk_block_size: BULK_BLOCK_SIZE,
            large_file_threshold: LARGE_FILE_THRESHOLD,
            download_retry_budget: DEFAULT_DOWNLOAD_RETRY_BUDGET,
            speed_window_ms: DEFAULT_SPEED_WINDOW.as_millis() as u64,
        }
    }
}

impl TransferConfig {
    /// Loads configuration from a JSON file.
    ///
    /// A missing file yields defaults. A file that cannot be parsed is
    /// logged and also yields defaults; only I/O failures are errors.
    pub fn load(path: &Path) -> Result<Self, TransferError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no transfer config file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        match serde_json::from_str::<TransferConfig>(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse transfer config, using defaults"
                );
                Ok(Self::default())
            }
        }
    }

    /// Saves configuration to disk as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<(), TransferError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, json)?;
        tracing::debug!(path = %path.display(), "transfer config saved");
        Ok(())
    }

    /// Checks the limits themselves, independent of any transfer.
    pub fn validate(&self) -> Result<(), TransferError> {
        validate_concurrency(self.max_concurrency)?;
        validate_block_size(self.default_block_size, self.max_append_size)?;
        validate_block_size(self.bulk_block_size, self.max_append_size)?;
        if let Some(block_size) = self.block_size {
            validate_block_size(block_size, self.max_append_size)?;
        }
        Ok(())
    }

    pub fn speed_window(&self) -> Duration {
        Duration::from_millis(self.speed_window_ms)
    }
}

/// Callback type shared by upload and download options.
pub type SharedProgress = Option<ProgressCallback>;

/// Per-upload options. `None` fields fall back to [`TransferConfig`].
#[derive(Clone, Default)]
pub struct UploadOptions {
    pub block_size: Option<u64>,
    pub max_concurrency: Option<usize>,
    /// Replace an existing object. When `false`, creation fails with
    /// `PreconditionFailed` if the object already exists.
    pub overwrite: bool,
    pub lease_id: Option<String>,
    pub progress: SharedProgress,
    pub cancel: CancellationToken,
}

impl fmt::Debug for UploadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadOptions")
            .field("block_size", &self.block_size)
            .field("max_concurrency", &self.max_concurrency)
            .field("overwrite", &self.overwrite)
            .field("lease_id", &self.lease_id)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl UploadOptions {
    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = Some(block_size);
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Preconditions for the initial create call.
    pub(crate) fn create_preconditions(&self) -> Preconditions {
        let base = if self.overwrite {
            Preconditions::default()
        } else {
            Preconditions::no_overwrite()
        };
        base.with_lease(self.lease_id.clone())
    }

    /// Resolves the concurrency budget against the config.
    pub(crate) fn resolve_concurrency(&self, config: &TransferConfig) -> Result<usize, TransferError> {
        validate_concurrency(self.max_concurrency.unwrap_or(config.max_concurrency))
    }
}

/// Per-download options. `None` fields fall back to [`TransferConfig`].
#[derive(Clone, Default)]
pub struct DownloadOptions {
    /// Byte range to read; the whole object when `None`.
    pub range: Option<TransferRange>,
    pub retry_budget: Option<u32>,
    /// Compare the MD5 of the delivered bytes with the object's stored hash.
    /// Only applies when the read covers the whole object.
    pub verify_hash: bool,
    pub preconditions: Preconditions,
    pub progress: SharedProgress,
    pub cancel: CancellationToken,
}

impl fmt::Debug for DownloadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadOptions")
            .field("range", &self.range)
            .field("retry_budget", &self.retry_budget)
            .field("verify_hash", &self.verify_hash)
            .field("preconditions", &self.preconditions)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl DownloadOptions {
    pub fn with_range(mut self, offset: u64, length: u64) -> Result<Self, TransferError> {
        validate_read_range(offset, Some(length))?;
        self.range = Some(TransferRange { offset, length });
        Ok(self)
    }

    pub fn with_retry_budget(mut self, retry_budget: u32) -> Self {
        self.retry_budget = Some(retry_budget);
        self
    }

    pub fn with_verify_hash(mut self, verify_hash: bool) -> Self {
        self.verify_hash = verify_hash;
        self
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub(crate) fn resolve_retry_budget(&self, config: &TransferConfig) -> u32 {
        self.retry_budget.unwrap_or(config.download_retry_budget)
    }
}

/// Shared progress callback constructor.
pub fn progress_callback<F>(f: F) -> ProgressCallback
where
    F: Fn(crate::progress::ProgressEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}
