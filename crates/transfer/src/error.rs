//! Transfer error types.

use std::fmt;

use lakeflow_protocol::{RemoteError, RemoteErrorKind, TransferRange};

/// Remote call that produced an error, with the range it covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Append(TransferRange),
    Commit { final_length: u64 },
    Read { offset: u64, length: Option<u64> },
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create => write!(f, "create"),
            Operation::Append(range) => write!(f, "append {range}"),
            Operation::Commit { final_length } => write!(f, "commit at length {final_length}"),
            Operation::Read {
                offset,
                length: Some(length),
            } => write!(f, "read [{offset}, {})", offset + length),
            Operation::Read {
                offset,
                length: None,
            } => write!(f, "read [{offset}, end)"),
        }
    }
}

/// Errors produced by the transfer engine.
///
/// Callers get exactly one of these per transfer; per-block failures are
/// collapsed into the first one observed.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("precondition failed during {operation}: {source}")]
    PreconditionFailed {
        operation: Operation,
        #[source]
        source: RemoteError,
    },

    #[error("transport failure during {operation}: {source}")]
    Transport {
        operation: Operation,
        #[source]
        source: RemoteError,
    },

    #[error("remote error during {operation}: {source}")]
    Remote {
        operation: Operation,
        #[source]
        source: RemoteError,
    },

    #[error("content hash mismatch: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    #[error("upload abandoned after {succeeded} successful appends, {range} failed: {source}")]
    PartialUploadAbandoned {
        range: TransferRange,
        succeeded: usize,
        #[source]
        source: RemoteError,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

/// Coarse classification of a [`TransferError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    PreconditionFailed,
    TransientTransport,
    Integrity,
    PartialUploadAbandoned,
    Cancelled,
    Remote,
    Io,
    InvalidState,
}

impl TransferError {
    /// Classifies a failed remote call.
    pub fn from_remote(operation: Operation, source: RemoteError) -> Self {
        match source.kind {
            RemoteErrorKind::PreconditionFailed => Self::PreconditionFailed { operation, source },
            _ if source.is_retryable() => Self::Transport { operation, source },
            _ => Self::Remote { operation, source },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::PreconditionFailed { .. } => ErrorKind::PreconditionFailed,
            Self::Transport { .. } => ErrorKind::TransientTransport,
            Self::Remote { .. } => ErrorKind::Remote,
            Self::Integrity { .. } => ErrorKind::Integrity,
            Self::PartialUploadAbandoned { .. } => ErrorKind::PartialUploadAbandoned,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Io(_) => ErrorKind::Io,
            Self::InvalidState(_) => ErrorKind::InvalidState,
        }
    }

    /// The range of the failing remote call, when there is one.
    pub fn failed_range(&self) -> Option<TransferRange> {
        match self {
            Self::PartialUploadAbandoned { range, .. } => Some(*range),
            Self::PreconditionFailed { operation, .. }
            | Self::Transport { operation, .. }
            | Self::Remote { operation, .. } => match operation {
                Operation::Append(range) => Some(*range),
                Operation::Read {
                    offset,
                    length: Some(length),
                } => TransferRange::new(*offset, *length).ok(),
                _ => None,
            },
            _ => None,
        }
    }
}
