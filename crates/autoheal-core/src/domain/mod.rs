//! Domain model: reports, jobs, and the error taxonomy.

pub mod error;
pub mod job;
pub mod report;

pub use error::{HealError, Result};
pub use job::{HealingJob, JobId, JobStatus, SkipReason};
pub use report::{compute_signature, is_well_formed_signature, ErrorReport, Platform};
