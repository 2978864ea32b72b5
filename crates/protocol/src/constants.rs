//! Protocol limits and engine defaults.
//!
//! These are only defaults: the engine never reads them directly, they seed
//! `TransferConfig` which is passed explicitly to every transfer.

use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Block size used when the caller does not request one (4 MiB).
pub const DEFAULT_BLOCK_SIZE: u64 = 4 * MIB;

/// Block size used for large known-length sources when the caller did not
/// request one (8 MiB). Halves the number of round trips on huge files.
pub const BULK_BLOCK_SIZE: u64 = 8 * MIB;

/// Known-length sources strictly above this size get [`BULK_BLOCK_SIZE`].
pub const LARGE_FILE_THRESHOLD: u64 = 100 * MIB;

/// Hard per-append byte limit imposed by the remote service (4000 MiB).
pub const MAX_APPEND_SIZE: u64 = 4000 * MIB;

/// Default number of appends allowed in flight at once.
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// Default number of resumptions a ranged read may perform.
pub const DEFAULT_DOWNLOAD_RETRY_BUDGET: u32 = 5;

/// Granularity at which an append's payload is fed to the store, and
/// therefore the granularity of upload progress (64 KiB).
pub const PROGRESS_SLICE_SIZE: usize = 64 * 1024;

/// Sliding window used to derive transfer speed from progress samples.
pub const DEFAULT_SPEED_WINDOW: Duration = Duration::from_secs(5);

/// `If-None-Match` value meaning "only if the object does not exist".
pub const ETAG_WILDCARD: &str = "*";
