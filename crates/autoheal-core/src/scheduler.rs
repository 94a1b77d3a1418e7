//! Batch scheduling: partition reports into lock-disjoint, width-bounded batches.
//!
//! Batches run strictly one after another; the reports inside a batch target
//! distinct repositories and so may heal concurrently without lock contention.

use std::collections::HashSet;

use crate::domain::ErrorReport;

/// Split `reports` into ordered batches.
///
/// Walks the input once. A report closes the current batch and opens a new
/// one when its repository key is already in the current batch or the batch
/// has reached `batch_size`. A `batch_size` of zero is treated as one.
/// Unkeyed reports are skipped.
pub fn create_batches(reports: Vec<ErrorReport>, batch_size: usize) -> Vec<Vec<ErrorReport>> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::new();
    let mut current: Vec<ErrorReport> = Vec::new();
    let mut keys: HashSet<String> = HashSet::new();

    for report in reports {
        let Some(key) = report.key().map(str::to_string) else {
            continue;
        };

        if keys.contains(&key) || current.len() >= batch_size {
            if !current.is_empty() {
                batches.push(std::mem::take(&mut current));
            }
            keys.clear();
        }

        keys.insert(key);
        current.push(report);
    }

    if !current.is_empty() {
        batches.push(current);
    }
    batches
}
