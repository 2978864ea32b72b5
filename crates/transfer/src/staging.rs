//! Staging aggregator: irregular fragments in, fixed-size blocks out.

use bytes::{Bytes, BytesMut};
use lakeflow_protocol::TransferRange;

use crate::types::StagedBlock;

/// Buffers source fragments into blocks of exactly `block_len` bytes.
///
/// Accumulation is strictly sequential; offsets are assigned from the
/// running total of bytes sealed so far, so the source never needs to be
/// seekable or replayable.
#[derive(Debug)]
pub struct StagingAggregator {
    block_len: usize,
    buffer: BytesMut,
    /// Bytes sealed into blocks so far (offset of the next block).
    staged: u64,
}

impl StagingAggregator {
    pub fn new(block_len: usize) -> Self {
        Self {
            block_len,
            buffer: BytesMut::new(),
            staged: 0,
        }
    }

    /// Accepts one fragment and returns every block it completed.
    ///
    /// When nothing is buffered, whole blocks are sliced out of `fragment`
    /// without copying.
    pub fn push(&mut self, mut fragment: Bytes) -> Vec<StagedBlock> {
        let mut sealed = Vec::new();

        while !fragment.is_empty() {
            if self.buffer.is_empty() && fragment.len() >= self.block_len {
                let data = fragment.split_to(self.block_len);
                sealed.push(self.seal(data));
                continue;
            }

            let take = (self.block_len - self.buffer.len()).min(fragment.len());
            self.buffer.extend_from_slice(&fragment.split_to(take));
            if self.buffer.len() == self.block_len {
                let data = self.buffer.split().freeze();
                sealed.push(self.seal(data));
            }
        }

        sealed
    }

    /// Flushes the partial buffer as the final, possibly short, block.
    ///
    /// Returns `None` when nothing is buffered; an empty source therefore
    /// produces no block at all.
    pub fn finish(&mut self) -> Option<StagedBlock> {
        if self.buffer.is_empty() {
            return None;
        }
        let data = self.buffer.split().freeze();
        Some(self.seal(data))
    }

    /// Total bytes sealed into blocks so far.
    pub fn staged_bytes(&self) -> u64 {
        self.staged
    }

    fn seal(&mut self, data: Bytes) -> StagedBlock {
        let range = TransferRange {
            offset: self.staged,
            length: data.len() as u64,
        };
        self.staged += range.length;
        StagedBlock { range, data }
    }
}
