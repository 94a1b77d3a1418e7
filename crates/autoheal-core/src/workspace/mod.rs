//! Workspace Manager: isolated job directories and repository leases.

pub mod error;
pub mod lease;
pub mod manager;

pub use error::{WorkspaceError, WorkspaceResult};
pub use lease::{FsLeaseMutex, Lease, LeaseMutex, MemoryLeaseMutex, StalenessPolicy};
pub use manager::{WorkspaceManager, WorkspaceMetadata, METADATA_FILE};
