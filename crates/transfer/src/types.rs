use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use bytes::Bytes;
use lakeflow_protocol::{RemoteError, TransferRange};
use tokio::sync::Semaphore;

use crate::error::TransferError;
use crate::validation::validate_read_range;

/// A sealed block ready for one append call.
///
/// Owned by exactly one in-flight append task at a time.
#[derive(Debug, Clone)]
pub struct StagedBlock {
    /// Where the block lands in the logical file.
    pub range: TransferRange,
    pub data: Bytes,
}

/// Lifecycle of a single transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    InProgress,
    Committing,
    Completed,
    Failed,
    Cancelled,
}

/// The first append failure of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendFailure {
    pub range: TransferRange,
    pub error: RemoteError,
}

/// Per-transfer shared state (thread-safe).
///
/// The counters and the first-error slot are the only state that concurrent
/// append tasks mutate; every mutation goes through one mutex.
pub struct TransferState {
    inner: Mutex<StateInner>,
    admission: Arc<Semaphore>,
}

struct StateInner {
    status: TransferStatus,
    bytes_staged: u64,
    bytes_acknowledged: u64,
    /// Running max of `offset + length` over successful appends.
    acknowledged_end: u64,
    appends_dispatched: usize,
    appends_succeeded: usize,
    first_failure: Option<AppendFailure>,
    started_at: Option<Instant>,
    completed_at: Option<Instant>,
}

impl TransferState {
    /// Creates a pending transfer with `max_concurrency` append slots.
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            inner: Mutex::new(StateInner {
                status: TransferStatus::Pending,
                bytes_staged: 0,
                bytes_acknowledged: 0,
                acknowledged_end: 0,
                appends_dispatched: 0,
                appends_succeeded: 0,
                first_failure: None,
                started_at: None,
                completed_at: None,
            }),
            admission: Arc::new(Semaphore::new(max_concurrency)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admission control for append dispatch.
    pub fn admission(&self) -> Arc<Semaphore> {
        Arc::clone(&self.admission)
    }

    /// Marks the transfer as in-progress.
    pub fn start(&self) {
        let mut s = self.lock();
        s.status = TransferStatus::InProgress;
        s.started_at = Some(Instant::now());
    }

    /// Records a block handed to the dispatcher.
    pub fn record_dispatched(&self, range: TransferRange) {
        let mut s = self.lock();
        s.bytes_staged += range.length;
        s.appends_dispatched += 1;
    }

    /// Records a successful append. Completion order does not matter.
    pub fn record_success(&self, range: TransferRange) {
        let mut s = self.lock();
        s.bytes_acknowledged += range.length;
        s.acknowledged_end = s.acknowledged_end.max(range.end());
        s.appends_succeeded += 1;
    }

    /// Records a failed append. Returns `true` if it was the first failure;
    /// later failures are dropped.
    pub fn record_failure(&self, range: TransferRange, error: RemoteError) -> bool {
        let mut s = self.lock();
        if s.first_failure.is_some() {
            return false;
        }
        s.first_failure = Some(AppendFailure { range, error });
        true
    }

    /// Returns `true` once any append has failed.
    pub fn has_failed(&self) -> bool {
        self.lock().first_failure.is_some()
    }

    pub fn first_failure(&self) -> Option<AppendFailure> {
        self.lock().first_failure.clone()
    }

    /// Marks the transfer as committing.
    pub fn begin_commit(&self) {
        self.lock().status = TransferStatus::Committing;
    }

    /// Marks the transfer as completed.
    pub fn complete(&self) {
        self.finish(TransferStatus::Completed);
    }

    /// Marks the transfer as failed.
    pub fn fail(&self) {
        self.finish(TransferStatus::Failed);
    }

    /// Marks the transfer as cancelled.
    pub fn cancel(&self) {
        self.finish(TransferStatus::Cancelled);
    }

    fn finish(&self, status: TransferStatus) {
        let mut s = self.lock();
        s.status = status;
        s.completed_at = Some(Instant::now());
    }

    pub fn status(&self) -> TransferStatus {
        self.lock().status
    }

    /// Sum of all block lengths handed to the dispatcher.
    pub fn bytes_staged(&self) -> u64 {
        self.lock().bytes_staged
    }

    /// Sum of all acknowledged block lengths.
    pub fn bytes_acknowledged(&self) -> u64 {
        self.lock().bytes_acknowledged
    }

    /// Highest end offset among acknowledged appends.
    pub fn acknowledged_end(&self) -> u64 {
        self.lock().acknowledged_end
    }

    pub fn appends_dispatched(&self) -> usize {
        self.lock().appends_dispatched
    }

    pub fn appends_succeeded(&self) -> usize {
        self.lock().appends_succeeded
    }

    /// Wall time between `start` and the terminal status, if both happened.
    pub fn elapsed(&self) -> Option<std::time::Duration> {
        let s = self.lock();
        match (s.started_at, s.completed_at) {
            (Some(start), Some(end)) => Some(end.duration_since(start)),
            _ => None,
        }
    }
}

/// Position of a ranged read.
///
/// Mutated only by the resilient reader; a retry resumes at
/// `[last_offset_acked, requested_end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadCursor {
    pub requested_offset: u64,
    /// Exclusive end, `None` until the object's length is known.
    pub requested_end: Option<u64>,
    pub bytes_delivered: u64,
    pub last_offset_acked: u64,
}

impl DownloadCursor {
    /// Rejects an empty range and one whose end overflows `u64`.
    pub fn new(offset: u64, length: Option<u64>) -> Result<Self, TransferError> {
        validate_read_range(offset, length)?;
        let requested_end = match length {
            Some(len) => Some(offset.checked_add(len).ok_or_else(|| {
                TransferError::Configuration(format!("read range {offset}+{len} overflows"))
            })?),
            None => None,
        };
        Ok(Self {
            requested_offset: offset,
            requested_end,
            bytes_delivered: 0,
            last_offset_acked: offset,
        })
    }

    /// Length still to deliver, if the end is known.
    pub fn remaining(&self) -> Option<u64> {
        self.requested_end
            .map(|end| end.saturating_sub(self.last_offset_acked))
    }

    /// Records `n` bytes handed to the caller.
    pub fn advance(&mut self, n: u64) {
        self.bytes_delivered += n;
        self.last_offset_acked += n;
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == Some(0)
    }
}
