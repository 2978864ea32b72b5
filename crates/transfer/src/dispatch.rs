//! Bounded-concurrency append dispatcher.
//!
//! Admission goes through the transfer's semaphore: when every slot is busy
//! the producer waits in [`Dispatcher::admit`], which is what keeps staged
//! blocks from piling up ahead of the network.

use std::collections::HashMap;
use std::sync::Arc;

use lakeflow_protocol::{RemoteError, TransferRange};
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::progress::ProgressAccumulator;
use crate::store::PathStore;
use crate::types::{StagedBlock, TransferState};

/// Why the dispatcher refused new work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Halt {
    /// An append failed; the failure is recorded in the transfer state.
    Failed,
    Cancelled,
}

/// An append that has been spawned and not yet reaped.
///
/// The block bytes are owned by the spawned task. Appends are never re-sent,
/// so there is no attempt counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingAppend {
    pub range: TransferRange,
}

/// Issues append calls against a fixed concurrency budget.
pub struct Dispatcher {
    store: Arc<dyn PathStore>,
    path: Arc<str>,
    lease_id: Option<Arc<str>>,
    state: Arc<TransferState>,
    progress: Arc<ProgressAccumulator>,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
    pending: HashMap<Id, PendingAppend>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn PathStore>,
        path: &str,
        lease_id: Option<&str>,
        state: Arc<TransferState>,
        progress: Arc<ProgressAccumulator>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            path: Arc::from(path),
            lease_id: lease_id.map(Arc::from),
            state,
            progress,
            cancel,
            tasks: JoinSet::new(),
            pending: HashMap::new(),
        }
    }

    /// Waits for a free append slot.
    ///
    /// Fails fast once an append has failed or the transfer is cancelled;
    /// both are checked again after the wait.
    pub async fn admit(&mut self) -> Result<OwnedSemaphorePermit, Halt> {
        self.reap_finished();
        self.check_halted()?;

        let admission = self.state.admission();
        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Halt::Cancelled),
            permit = admission.acquire_owned() => {
                // The semaphore is never closed while the dispatcher lives.
                permit.map_err(|_| Halt::Cancelled)?
            }
        };

        self.reap_finished();
        self.check_halted()?;
        Ok(permit)
    }

    /// Spawns the append for `block`, holding `permit` until it completes.
    pub fn dispatch(&mut self, permit: OwnedSemaphorePermit, block: StagedBlock) {
        let StagedBlock { range, data } = block;
        self.state.record_dispatched(range);

        let store = Arc::clone(&self.store);
        let path = Arc::clone(&self.path);
        let lease_id = self.lease_id.clone();
        let state = Arc::clone(&self.state);
        let body = self.progress.reporting_stream(data);

        trace!(offset = range.offset, length = range.length, "dispatching append");
        let handle = self.tasks.spawn(async move {
            let _permit = permit;
            match store.append(&path, range, body, lease_id.as_deref()).await {
                Ok(()) => {
                    trace!(offset = range.offset, length = range.length, "append acknowledged");
                    state.record_success(range);
                }
                Err(e) => {
                    if state.record_failure(range, e.clone()) {
                        warn!(
                            offset = range.offset,
                            length = range.length,
                            error = %e,
                            "append failed, halting dispatch"
                        );
                    } else {
                        debug!(offset = range.offset, error = %e, "append failed after first failure");
                    }
                }
            }
        });
        self.pending.insert(handle.id(), PendingAppend { range });
    }

    /// Admits and dispatches one block.
    pub async fn submit(&mut self, block: StagedBlock) -> Result<(), Halt> {
        let permit = self.admit().await?;
        self.dispatch(permit, block);
        Ok(())
    }

    /// Waits for every dispatched append to finish.
    ///
    /// In-flight appends are never aborted, even after a failure or a
    /// cancellation, so the remote side is not left with half a block.
    pub async fn drain(mut self) {
        while let Some(joined) = self.tasks.join_next_with_id().await {
            self.handle_join(joined);
        }
    }

    /// Appends spawned but not yet reaped, in no particular order.
    pub fn pending(&self) -> impl Iterator<Item = &PendingAppend> {
        self.pending.values()
    }

    fn check_halted(&self) -> Result<(), Halt> {
        if self.state.has_failed() {
            return Err(Halt::Failed);
        }
        if self.cancel.is_cancelled() {
            return Err(Halt::Cancelled);
        }
        Ok(())
    }

    fn reap_finished(&mut self) {
        while let Some(joined) = self.tasks.try_join_next_with_id() {
            self.handle_join(joined);
        }
    }

    fn handle_join(&mut self, joined: Result<(Id, ()), JoinError>) {
        match joined {
            Ok((id, ())) => {
                self.pending.remove(&id);
            }
            Err(e) => {
                // A panicking store counts as a failed append.
                let Some(PendingAppend { range }) = self.pending.remove(&e.id()) else {
                    return;
                };
                warn!(offset = range.offset, error = %e, "append task did not complete");
                self.state.record_failure(
                    range,
                    RemoteError::other(format!("append task did not complete: {e}")),
                );
            }
        }
    }
}
