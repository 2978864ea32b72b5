//! `PathStore` implementations.
//!
//! - [`MemoryPathStore`]: in-process store with fault hooks, for tests and demos
//! - [`LocalPathStore`]: objects as files under a root directory
//!
//! Both follow the service's visibility rules: appended bytes are invisible
//! until a commit covers them, and a commit fails on gaps.

pub mod conditions;
pub mod local;
pub mod memory;
pub mod path;

pub use conditions::{ObjectMeta, check_lease, evaluate, next_etag};
pub use local::LocalPathStore;
pub use memory::MemoryPathStore;
pub use path::{InvalidPath, validate_object_path};

/// Directory under a local store's root reserved for metadata and staging.
pub const RESERVED_DIR: &str = ".lakeflow";
