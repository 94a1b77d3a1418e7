//! autoheal Core Library
//!
//! Healing Orchestration Core: turns a stream of CI/CD error reports into a
//! deduplicated, rate-limited, lock-disjoint set of remediation jobs, each
//! run in its own workspace with its outcome durably recorded.

pub mod collaborators;
pub mod config;
pub mod dedup;
pub mod domain;
pub mod events;
pub mod fakes;
pub mod healer;
pub mod metrics;
pub mod obs;
pub mod pipeline;
pub mod retry;
pub mod scheduler;
pub mod telemetry;
pub mod throttle;
pub mod workspace;

pub use collaborators::{
    CollaboratorError, CommandFixAgent, FixAgent, FixRequest, FixResponse, GitCliHost,
    LogNotifier, Notifier, PullRequest, PullRequestSpec, RepoHost, WebhookNotifier,
};
pub use config::{FixAgentConfig, HealerConfig, RepoHostConfig};
pub use dedup::group_by_repository;
pub use domain::{
    compute_signature, is_well_formed_signature, ErrorReport, HealError, HealingJob, JobId,
    JobStatus, Platform, Result, SkipReason,
};
pub use events::{EventDispatcher, HealingEvent};
pub use healer::{Healer, JobOutcome, RunPlan, RunSummary};
pub use metrics::METRICS;
pub use pipeline::{
    HealingPipeline, JobReport, PipelineOptions, FIX_AGENT_UNAVAILABLE, NO_CHANGES_ERROR,
    REPO_HOST_UNAVAILABLE, SIMULATED_STRATEGY,
};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use scheduler::create_batches;
pub use telemetry::init_tracing;
pub use throttle::{SafetyThrottle, ThrottleDecision, ThrottlePolicy};
pub use workspace::{
    FsLeaseMutex, Lease, LeaseMutex, MemoryLeaseMutex, StalenessPolicy, WorkspaceError,
    WorkspaceManager,
};

pub use autoheal_state::{
    FsThrottleLedger, HealingResult, HistoryQuery, HistoryStore, JsonlHistoryStore,
    OutcomeRecord, OutcomeStatus, ThrottleEntry, ThrottleLedger,
};
