//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryHistoryStore` and `MemoryThrottleLedger` that satisfy the
//! trait contracts without touching the filesystem.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryHistoryStore
// ---------------------------------------------------------------------------

/// In-memory history store backed by a `Vec` in append order.
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    records: Mutex<Vec<OutcomeRecord>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with existing records.
    pub fn with_records(records: Vec<OutcomeRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }

    /// Snapshot of every record in append order.
    pub fn snapshot(&self) -> Vec<OutcomeRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn append(&self, record: OutcomeRecord) -> StorageResult<()> {
        let mut records = self.records.lock().unwrap();
        records.push(record);
        Ok(())
    }

    async fn query(&self, query: &HistoryQuery) -> StorageResult<Vec<OutcomeRecord>> {
        let records = self.records.lock().unwrap();
        Ok(query.select(records.iter()))
    }

    async fn len(&self) -> StorageResult<usize> {
        Ok(self.records.lock().unwrap().len())
    }
}

// ---------------------------------------------------------------------------
// MemoryThrottleLedger
// ---------------------------------------------------------------------------

/// In-memory throttle ledger. Counts saves so tests can assert flushes.
#[derive(Debug, Default)]
pub struct MemoryThrottleLedger {
    entries: Mutex<Vec<ThrottleEntry>>,
    saves: Mutex<usize>,
}

impl MemoryThrottleLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: Vec<ThrottleEntry>) -> Self {
        Self {
            entries: Mutex::new(entries),
            saves: Mutex::new(0),
        }
    }

    /// Number of `save` calls observed.
    pub fn save_count(&self) -> usize {
        self.saves.lock().map(|n| *n).unwrap_or(0)
    }
}

#[async_trait]
impl ThrottleLedger for MemoryThrottleLedger {
    async fn load(&self) -> StorageResult<Vec<ThrottleEntry>> {
        Ok(self.entries.lock().unwrap().clone())
    }

    async fn save(&self, entries: &[ThrottleEntry]) -> StorageResult<()> {
        *self.entries.lock().unwrap() = entries.to_vec();
        *self.saves.lock().unwrap() += 1;
        Ok(())
    }
}
