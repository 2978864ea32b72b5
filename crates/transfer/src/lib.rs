//! Chunked upload and resumable download engine for hierarchical object stores.
//!
//! The remote service is abstracted behind [`PathStore`]: create an empty
//! object, append byte ranges to its uncommitted area, commit at a final
//! length, and read ranges back. This crate holds the transfer logic only.
//!
//! # Upload pipeline
//!
//! 1. **Plan**: pick a block size ([`ChunkPlanner`])
//! 2. **Create**: create the object, refusing to overwrite unless asked
//! 3. **Stage**: coalesce source fragments into blocks ([`StagingAggregator`])
//! 4. **Append**: issue appends under a concurrency budget ([`Dispatcher`])
//! 5. **Commit**: flush once at the total length ([`CommitCoordinator`])
//!
//! Downloads go through [`ResilientReader`], which resumes a dropped
//! stream from the last delivered byte.

pub mod blocking;
pub mod chunked;
pub mod client;
pub mod commit;
pub mod config;
pub mod dispatch;
pub mod download;
pub mod error;
pub mod planner;
pub mod progress;
pub mod reader;
pub mod staging;
pub mod store;
pub mod types;
pub mod upload;
pub mod validation;

#[cfg(test)]
mod test_support;

// Re-export primary types for convenience.
pub use blocking::BlockingTransferClient;
pub use chunked::{ChunkReader, content_md5, file_md5};
pub use client::FileTransferClient;
pub use commit::CommitCoordinator;
pub use config::{DownloadOptions, TransferConfig, UploadOptions, progress_callback};
pub use dispatch::{Dispatcher, Halt, PendingAppend};
pub use error::{ErrorKind, Operation, TransferError};
pub use planner::{ChunkPlanner, PlannedRanges};
pub use progress::{ProgressAccumulator, ProgressCallback, ProgressEvent, SpeedCalculator};
pub use reader::{ReaderOptions, ResilientReader};
pub use staging::StagingAggregator;
pub use store::{
    ByteStream, CommitOptions, PathStore, ReadResponse, StoreFuture, collect_stream, once_stream,
};
pub use types::{AppendFailure, DownloadCursor, StagedBlock, TransferState, TransferStatus};
