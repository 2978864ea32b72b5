//! Per-path transfer client.

use std::sync::Arc;

use crate::TransferError;
use crate::config::TransferConfig;
use crate::store::PathStore;

/// Uploads to and downloads from one object path.
///
/// Cheap to clone; every transfer builds its own state, so one client can
/// run several transfers at once. Upload methods live in `upload.rs`,
/// download methods in `download.rs`.
#[derive(Clone)]
pub struct FileTransferClient {
    pub(crate) store: Arc<dyn PathStore>,
    pub(crate) path: Arc<str>,
    pub(crate) config: Arc<TransferConfig>,
}

impl FileTransferClient {
    /// Creates a client with the default configuration.
    pub fn new(store: Arc<dyn PathStore>, path: &str) -> Self {
        Self {
            store,
            path: Arc::from(path),
            config: Arc::new(TransferConfig::default()),
        }
    }

    /// Replaces the configuration after validating it.
    pub fn with_config(mut self, config: TransferConfig) -> Result<Self, TransferError> {
        config.validate()?;
        self.config = Arc::new(config);
        Ok(self)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn PathStore> {
        &self.store
    }
}

impl std::fmt::Debug for FileTransferClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileTransferClient")
            .field("path", &self.path)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
