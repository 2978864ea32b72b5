//! Commit coordinator: the single flush that makes appended data visible.

use std::sync::Arc;

use lakeflow_protocol::{ObjectInfo, Preconditions};
use tracing::{debug, info};

use crate::error::{Operation, TransferError};
use crate::store::{CommitOptions, PathStore};
use crate::types::{TransferState, TransferStatus};

/// Issues the commit call for one logical transfer.
///
/// [`commit`](Self::commit) consumes the coordinator, so a transfer can
/// commit at most once.
pub struct CommitCoordinator {
    store: Arc<dyn PathStore>,
    path: String,
    options: CommitOptions,
}

impl CommitCoordinator {
    pub fn new(store: Arc<dyn PathStore>, path: &str, lease_id: Option<String>) -> Self {
        Self {
            store,
            path: path.to_string(),
            options: CommitOptions {
                retain_uncommitted: false,
                close: true,
                preconditions: Preconditions::default().with_lease(lease_id),
            },
        }
    }

    /// Commits at the total staged length, once every append succeeded.
    ///
    /// Refuses to commit a transfer that recorded a failure or that has
    /// unacknowledged bytes; the remote object then keeps its previous state.
    pub async fn commit(self, state: &TransferState) -> Result<ObjectInfo, TransferError> {
        if state.has_failed() {
            return Err(TransferError::InvalidState(
                "refusing to commit a transfer with a failed append",
            ));
        }
        if state.status() == TransferStatus::Cancelled {
            return Err(TransferError::Cancelled);
        }

        let final_length = state.bytes_staged();
        if state.bytes_acknowledged() != final_length || state.acknowledged_end() != final_length
        {
            return Err(TransferError::InvalidState(
                "refusing to commit before every append was acknowledged",
            ));
        }

        state.begin_commit();
        debug!(path = %self.path, final_length, "committing");

        let info = self
            .store
            .commit(&self.path, final_length, &self.options)
            .await
            .map_err(|e| TransferError::from_remote(Operation::Commit { final_length }, e))?;

        info!(
            path = %self.path,
            length = info.content_length,
            etag = %info.etag,
            "commit complete"
        );
        Ok(info)
    }
}
