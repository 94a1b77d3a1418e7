//! Workspace and lease error types.

use std::path::PathBuf;

/// Errors raised by the workspace manager and lease backends.
///
/// Lock contention is not an error: `acquire_lock` reports it as `false`.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("workspace already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("refusing to remove {} outside {}", .path.display(), .base.display())]
    OutsideBase { path: PathBuf, base: PathBuf },

    #[error("failed to persist lease {}: {detail}", .path.display())]
    Persist { path: PathBuf, detail: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("lease task failed: {0}")]
    Blocking(String),
}

/// Result alias for workspace operations.
pub type WorkspaceResult<T> = std::result::Result<T, WorkspaceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outside_base_names_both_paths() {
        let err = WorkspaceError::OutsideBase {
            path: PathBuf::from("/etc"),
            base: PathBuf::from("/srv/heal/workspaces"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/etc"));
        assert!(msg.contains("/srv/heal/workspaces"));
    }
}
