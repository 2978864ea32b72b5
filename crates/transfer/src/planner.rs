//! Chunk planning: block size resolution and range layout.

use lakeflow_protocol::TransferRange;
use tracing::debug;

use crate::TransferError;
use crate::config::TransferConfig;
use crate::validation::validate_block_size;

/// Decides how a logical file is split into append ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlanner {
    block_size: u64,
}

impl ChunkPlanner {
    /// Resolves the block size for one transfer.
    ///
    /// An explicit `requested` size (or the config's `block_size`) always
    /// wins. Otherwise a known `total` above the large-file threshold gets
    /// the bulk size, and everything else gets the default size.
    pub fn resolve(
        config: &TransferConfig,
        requested: Option<u64>,
        total: Option<u64>,
    ) -> Result<Self, TransferError> {
        let block_size = match requested.or(config.block_size) {
            Some(explicit) => explicit,
            None => match total {
                Some(total) if total > config.large_file_threshold => {
                    debug!(
                        total,
                        block_size = config.bulk_block_size,
                        "large source, using bulk block size"
                    );
                    config.bulk_block_size
                }
                _ => config.default_block_size,
            },
        };
        validate_block_size(block_size, config.max_append_size)?;
        Ok(Self { block_size })
    }

    /// Creates a planner with a fixed block size.
    pub fn with_block_size(block_size: u64, max_append_size: u64) -> Result<Self, TransferError> {
        validate_block_size(block_size, max_append_size)?;
        Ok(Self { block_size })
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Block size as a buffer capacity.
    ///
    /// Construction already checked that the size fits in `usize`.
    pub fn block_len(&self) -> usize {
        self.block_size as usize
    }

    /// Lazily yields the ranges covering `[0, total)`.
    pub fn ranges(&self, total: u64) -> PlannedRanges {
        PlannedRanges {
            next_offset: 0,
            total,
            block_size: self.block_size,
        }
    }

    /// Number of ranges needed for `total` bytes.
    pub fn range_count(&self, total: u64) -> u64 {
        total.div_ceil(self.block_size)
    }
}

/// Iterator over the contiguous ranges of a planned transfer.
#[derive(Debug, Clone)]
pub struct PlannedRanges {
    next_offset: u64,
    total: u64,
    block_size: u64,
}

impl Iterator for PlannedRanges {
    type Item = TransferRange;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_offset >= self.total {
            return None;
        }
        let length = self.block_size.min(self.total - self.next_offset);
        let range = TransferRange {
            offset: self.next_offset,
            length,
        };
        self.next_offset += length;
        Some(range)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.total - self.next_offset.min(self.total)).div_ceil(self.block_size);
        let remaining = usize::try_from(remaining).unwrap_or(usize::MAX);
        (remaining, Some(remaining))
    }
}
