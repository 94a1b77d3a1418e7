//! autoheal-state: durable ledgers for the healing core
//!
//! ## Layer 0 - Persistence
//!
//! Focus: append-only outcome history and crash-safe throttle snapshots.
//!
//! ## Key Components
//!
//! - `HistoryStore` / `JsonlHistoryStore`: outcome ledger, one JSON line per job
//! - `ThrottleLedger` / `FsThrottleLedger`: per-signature attempt ledger
//! - `fakes`: in-memory implementations for tests

mod error;
pub mod fakes;
mod fs_ledger;
mod jsonl_history;
pub mod storage_traits;

pub use error::StorageError;
pub use fs_ledger::FsThrottleLedger;
pub use jsonl_history::JsonlHistoryStore;
pub use storage_traits::{
    HealingResult, HistoryQuery, HistoryStore, OutcomeRecord, OutcomeStatus, StorageResult,
    ThrottleEntry, ThrottleLedger,
};
