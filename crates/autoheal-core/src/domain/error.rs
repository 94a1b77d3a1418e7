//! Domain-level error taxonomy for autoheal.

use super::job::JobStatus;

/// Healing core errors.
///
/// Skip conditions (throttled, lock-timeout) and per-job step failures are
/// outcomes, not errors; these variants cover misuse and infrastructure.
#[derive(Debug, thiserror::Error)]
pub enum HealError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("report has no repository key")]
    MissingRepoKey,

    #[error("invalid job transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("workspace error: {0}")]
    Workspace(#[from] crate::workspace::WorkspaceError),

    #[error("storage error: {0}")]
    Storage(#[from] autoheal_state::StorageError),

    #[error("collaborator error: {0}")]
    Collaborator(#[from] crate::collaborators::CollaboratorError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for healing core operations.
pub type Result<T> = std::result::Result<T, HealError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heal_error_display() {
        let err = HealError::InvalidConfig("concurrency must be at least 1".to_string());
        assert!(err.to_string().contains("invalid configuration"));

        let err = HealError::InvalidTransition {
            from: JobStatus::Succeeded,
            to: JobStatus::Running,
        };
        assert_eq!(err.to_string(), "invalid job transition: succeeded -> running");
    }

    #[test]
    fn test_storage_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err: HealError = autoheal_state::StorageError::Io(io).into();
        assert!(err.to_string().contains("disk full"));
    }
}
