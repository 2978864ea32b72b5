pub mod constants;
pub mod error;
pub mod types;

// Re-export primary types for convenience.
pub use error::{RemoteError, RemoteErrorKind};
pub use types::{
    ContentRange, ObjectInfo, ObjectProperties, Preconditions, RangeError, TransferRange,
};
