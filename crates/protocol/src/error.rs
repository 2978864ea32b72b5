//! Errors reported by a remote store.

use serde::{Deserialize, Serialize};

/// Classification of a failed remote call.
///
/// The engine never inspects status codes or wire payloads; collaborators
/// translate their transport failures into one of these kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RemoteErrorKind {
    /// A conditional header did not hold (existing object, stale ETag, lease).
    PreconditionFailed,
    /// Credentials were rejected.
    Unauthorized,
    /// The target object does not exist.
    NotFound,
    /// Offset or length did not match the object's uncommitted state.
    InvalidRange,
    /// Connection reset, dropped stream, 5xx-class failure.
    Transient,
    /// A per-call deadline expired.
    Timeout,
    /// Anything else.
    Other,
}

/// Error returned by a remote store call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn precondition_failed(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::PreconditionFailed, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::NotFound, message)
    }

    pub fn invalid_range(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::InvalidRange, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Transient, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Timeout, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Other, message)
    }

    /// Returns `true` for failures a reader may resume after.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            RemoteErrorKind::Transient | RemoteErrorKind::Timeout
        )
    }
}

impl From<std::io::Error> for RemoteError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let kind = match err.kind() {
            ErrorKind::NotFound => RemoteErrorKind::NotFound,
            ErrorKind::AlreadyExists => RemoteErrorKind::PreconditionFailed,
            ErrorKind::PermissionDenied => RemoteErrorKind::Unauthorized,
            ErrorKind::TimedOut => RemoteErrorKind::Timeout,
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::Interrupted => RemoteErrorKind::Transient,
            _ => RemoteErrorKind::Other,
        };
        Self::new(kind, err.to_string())
    }
}
