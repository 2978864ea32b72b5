//! Upload orchestration: create, stage, append, commit.

use std::io;
use std::path::Path;
use std::pin::pin;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use lakeflow_protocol::ObjectInfo;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunked::ChunkReader;
use crate::client::FileTransferClient;
use crate::commit::CommitCoordinator;
use crate::config::UploadOptions;
use crate::dispatch::{Dispatcher, Halt};
use crate::error::{Operation, TransferError};
use crate::planner::{ChunkPlanner, PlannedRanges};
use crate::progress::ProgressAccumulator;
use crate::staging::StagingAggregator;
use crate::types::{AppendFailure, TransferState};

/// Why staging stopped early.
enum Stop {
    Halted(Halt),
    Source(TransferError),
}

impl From<Halt> for Stop {
    fn from(halt: Halt) -> Self {
        Stop::Halted(halt)
    }
}

/// Everything one upload shares between staging and completion.
struct UploadSession {
    client: FileTransferClient,
    state: Arc<TransferState>,
    progress: Arc<ProgressAccumulator>,
    dispatcher: Dispatcher,
    cancel: CancellationToken,
    lease_id: Option<String>,
}

impl FileTransferClient {
    /// Uploads a byte stream of unknown or hinted length.
    ///
    /// Fragments of any size are coalesced into planned blocks; the stream
    /// is not polled while every append slot is busy.
    pub async fn upload_stream<S>(
        &self,
        source: S,
        len_hint: Option<u64>,
        options: UploadOptions,
    ) -> Result<ObjectInfo, TransferError>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let planner = ChunkPlanner::resolve(&self.config, options.block_size, len_hint)?;
        let mut session = self.begin(&planner, len_hint, &options).await?;

        let outcome = stage_stream(&mut session, source, &planner).await;
        session.finish(outcome).await
    }

    /// Uploads a local file.
    ///
    /// Ranges are planned from the file size up front and each block is read
    /// only after it has been admitted, so at most `max_concurrency` blocks
    /// are held in memory.
    pub async fn upload_file(
        &self,
        local: &Path,
        options: UploadOptions,
    ) -> Result<ObjectInfo, TransferError> {
        let reader = ChunkReader::open(local)?;
        let total = reader.file_size();
        let planner = ChunkPlanner::resolve(&self.config, options.block_size, Some(total))?;
        debug!(
            local = %local.display(),
            total,
            blocks = planner.range_count(total),
            "planned file upload"
        );
        let mut session = self.begin(&planner, Some(total), &options).await?;

        let outcome = stage_file(&mut session, reader, planner.ranges(total)).await;
        session.finish(outcome).await
    }

    /// Uploads an in-memory buffer.
    pub async fn upload_bytes(
        &self,
        data: Bytes,
        options: UploadOptions,
    ) -> Result<ObjectInfo, TransferError> {
        let len = data.len() as u64;
        let source = futures_util::stream::once(async move { Ok(data) });
        self.upload_stream(source, Some(len), options).await
    }

    /// Validates options, creates the remote object and sets up dispatch.
    async fn begin(
        &self,
        planner: &ChunkPlanner,
        total: Option<u64>,
        options: &UploadOptions,
    ) -> Result<UploadSession, TransferError> {
        let concurrency = options.resolve_concurrency(&self.config)?;
        if options.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let preconditions = options.create_preconditions();
        self.store
            .create(&self.path, &preconditions)
            .await
            .map_err(|e| TransferError::from_remote(Operation::Create, e))?;

        info!(
            path = %self.path,
            block_size = planner.block_size(),
            concurrency,
            total = ?total,
            "upload started"
        );

        let state = Arc::new(TransferState::new(concurrency));
        state.start();
        let progress = Arc::new(ProgressAccumulator::new(
            total,
            options.progress.clone(),
            self.config.speed_window(),
        ));
        let dispatcher = Dispatcher::new(
            Arc::clone(&self.store),
            &self.path,
            options.lease_id.as_deref(),
            Arc::clone(&state),
            Arc::clone(&progress),
            options.cancel.clone(),
        );

        Ok(UploadSession {
            client: self.clone(),
            state,
            progress,
            dispatcher,
            cancel: options.cancel.clone(),
            lease_id: options.lease_id.clone(),
        })
    }
}

async fn stage_stream<S>(
    session: &mut UploadSession,
    source: S,
    planner: &ChunkPlanner,
) -> Result<(), Stop>
where
    S: Stream<Item = io::Result<Bytes>> + Send,
{
    let mut source = pin!(source);
    let mut staging = StagingAggregator::new(planner.block_len());

    loop {
        let next = tokio::select! {
            biased;
            _ = session.cancel.cancelled() => return Err(Stop::Halted(Halt::Cancelled)),
            next = source.next() => next,
        };
        match next {
            Some(Ok(fragment)) => {
                for block in staging.push(fragment) {
                    session.dispatcher.submit(block).await?;
                }
            }
            Some(Err(e)) => {
                warn!(staged = staging.staged_bytes(), error = %e, "upload source failed");
                return Err(Stop::Source(TransferError::Io(e)));
            }
            None => break,
        }
    }

    if let Some(block) = staging.finish() {
        session.dispatcher.submit(block).await?;
    }
    Ok(())
}

async fn stage_file(
    session: &mut UploadSession,
    mut reader: ChunkReader,
    ranges: PlannedRanges,
) -> Result<(), Stop> {
    for range in ranges {
        let permit = session.dispatcher.admit().await?;
        let (next, block) = reader
            .read_block_async(range)
            .await
            .map_err(Stop::Source)?;
        reader = next;
        session.dispatcher.dispatch(permit, block);
    }
    Ok(())
}

impl UploadSession {
    /// Drains in-flight appends, then commits or reports why it cannot.
    async fn finish(self, outcome: Result<(), Stop>) -> Result<ObjectInfo, TransferError> {
        let UploadSession {
            client,
            state,
            progress,
            dispatcher,
            cancel,
            lease_id,
        } = self;

        dispatcher.drain().await;

        if let Some(failure) = state.first_failure() {
            state.fail();
            return Err(abandoned(&client, &state, failure));
        }
        match outcome {
            Ok(()) => {}
            Err(Stop::Source(e)) => {
                state.fail();
                return Err(e);
            }
            Err(Stop::Halted(Halt::Cancelled)) => {
                state.cancel();
                info!(path = %client.path, staged = state.bytes_staged(), "upload cancelled");
                return Err(TransferError::Cancelled);
            }
            Err(Stop::Halted(Halt::Failed)) => {
                state.fail();
                return Err(TransferError::InvalidState("dispatch halted without a failure"));
            }
        }
        if cancel.is_cancelled() {
            state.cancel();
            return Err(TransferError::Cancelled);
        }

        let coordinator = CommitCoordinator::new(Arc::clone(&client.store), &client.path, lease_id);
        match coordinator.commit(&state).await {
            Ok(info) => {
                state.complete();
                info!(
                    path = %client.path,
                    bytes = progress.transferred(),
                    appends = state.appends_succeeded(),
                    elapsed_ms = state.elapsed().map(|d| d.as_millis() as u64).unwrap_or_default(),
                    "upload complete"
                );
                Ok(info)
            }
            Err(e) => {
                state.fail();
                Err(e)
            }
        }
    }
}

fn abandoned(
    client: &FileTransferClient,
    state: &TransferState,
    failure: AppendFailure,
) -> TransferError {
    let succeeded = state.appends_succeeded();
    warn!(
        path = %client.path,
        range = %failure.range,
        succeeded,
        "upload abandoned, object left uncommitted"
    );
    if succeeded > 0 {
        TransferError::PartialUploadAbandoned {
            range: failure.range,
            succeeded,
            source: failure.error,
        }
    } else {
        TransferError::from_remote(Operation::Append(failure.range), failure.error)
    }
}
