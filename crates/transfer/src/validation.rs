use lakeflow_protocol::TransferRange;

use crate::TransferError;

/// Validates a block size against the remote per-append limit.
///
/// Rejects:
/// - Zero
/// - Sizes above `max_append_size`
/// - Sizes that do not fit in memory addressing (`usize`)
pub fn validate_block_size(block_size: u64, max_append_size: u64) -> Result<usize, TransferError> {
    if block_size == 0 {
        return Err(TransferError::Configuration(
            "block size must be greater than zero".into(),
        ));
    }

    if block_size > max_append_size {
        return Err(TransferError::Configuration(format!(
            "block size {block_size} exceeds the per-append limit of {max_append_size} bytes"
        )));
    }

    usize::try_from(block_size).map_err(|_| {
        TransferError::Configuration(format!(
            "block size {block_size} does not fit in this platform's address space"
        ))
    })
}

/// Validates the number of appends allowed in flight.
pub fn validate_concurrency(max_concurrency: usize) -> Result<usize, TransferError> {
    if max_concurrency == 0 {
        return Err(TransferError::Configuration(
            "max concurrency must be greater than zero".into(),
        ));
    }
    // tokio's semaphore refuses more permits than this.
    if max_concurrency > tokio::sync::Semaphore::MAX_PERMITS {
        return Err(TransferError::Configuration(format!(
            "max concurrency {max_concurrency} is too large"
        )));
    }
    Ok(max_concurrency)
}

/// Validates a caller-supplied read range.
pub fn validate_read_range(offset: u64, length: Option<u64>) -> Result<(), TransferError> {
    if let Some(length) = length {
        TransferRange::new(offset, length)
            .map_err(|e| TransferError::Configuration(format!("invalid read range: {e}")))?;
    }
    Ok(())
}
