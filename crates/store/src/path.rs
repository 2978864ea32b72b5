use std::path::{Component, Path};

/// Errors from object path validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid object path: {0}")]
pub struct InvalidPath(pub String);

impl From<InvalidPath> for lakeflow_protocol::RemoteError {
    fn from(e: InvalidPath) -> Self {
        lakeflow_protocol::RemoteError::other(e.to_string())
    }
}

/// Validates that an object path stays inside the store root.
///
/// Rejects:
/// - Empty paths
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
/// - The store's reserved `.lakeflow` directory
pub fn validate_object_path(object_path: &str) -> Result<(), InvalidPath> {
    if object_path.is_empty() {
        return Err(InvalidPath("empty path".into()));
    }

    let path = Path::new(object_path);

    if path.is_absolute() {
        return Err(InvalidPath(format!(
            "absolute path not allowed: {object_path}"
        )));
    }

    let mut normal = 0usize;
    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(InvalidPath(format!(
                    "parent directory traversal not allowed: {object_path}"
                )));
            }
            Component::Prefix(_) => {
                return Err(InvalidPath(format!(
                    "path prefix not allowed: {object_path}"
                )));
            }
            Component::RootDir => {
                return Err(InvalidPath(format!(
                    "absolute path not allowed: {object_path}"
                )));
            }
            Component::Normal(name) => {
                if normal == 0 && name == crate::RESERVED_DIR {
                    return Err(InvalidPath(format!(
                        "reserved directory not allowed: {object_path}"
                    )));
                }
                normal += 1;
            }
            Component::CurDir => {}
        }
    }

    if normal == 0 {
        return Err(InvalidPath(format!("path names no object: {object_path}")));
    }
    Ok(())
}
