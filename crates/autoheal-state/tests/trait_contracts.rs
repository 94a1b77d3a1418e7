//! Trait contract tests for HistoryStore and ThrottleLedger.
//!
//! Each contract runs against the in-memory fake and the durable backend;
//! any conforming implementation must pass these.

use autoheal_state::fakes::{MemoryHistoryStore, MemoryThrottleLedger};
use autoheal_state::storage_traits::*;
use autoheal_state::{FsThrottleLedger, JsonlHistoryStore};
use chrono::{Duration, Utc};

fn outcome(job: &str, repo: &str, sig: &str, status: OutcomeStatus) -> OutcomeRecord {
    let now = Utc::now();
    OutcomeRecord {
        job_id: job.to_string(),
        repo_key: repo.to_string(),
        signature: sig.to_string(),
        branch: Some("main".to_string()),
        platform: "deploy-platform".to_string(),
        error_type: "deploy".to_string(),
        status,
        reason: None,
        result: None,
        started_at: now,
        finished_at: now,
    }
}

// ===========================================================================
// HistoryStore contract
// ===========================================================================

async fn history_contract(store: &dyn HistoryStore) {
    assert!(store.is_empty().await.unwrap());

    store
        .append(outcome("j1", "a/b", "s1", OutcomeStatus::Failed))
        .await
        .unwrap();
    store
        .append(outcome("j2", "a/b", "s2", OutcomeStatus::Succeeded))
        .await
        .unwrap();
    store
        .append(outcome("j3", "c/d", "s1", OutcomeStatus::Skipped))
        .await
        .unwrap();

    assert_eq!(store.len().await.unwrap(), 3);

    let by_sig = store.query(&HistoryQuery::for_signature("s1")).await.unwrap();
    let ids: Vec<_> = by_sig.iter().map(|r| r.job_id.as_str()).collect();
    assert_eq!(ids, vec!["j3", "j1"], "newest first");

    let by_repo = store.query(&HistoryQuery::for_repo("a/b")).await.unwrap();
    assert_eq!(by_repo.len(), 2);

    let future = HistoryQuery {
        since: Some(Utc::now() + Duration::hours(1)),
        ..Default::default()
    };
    assert!(store.query(&future).await.unwrap().is_empty());
}

#[tokio::test]
async fn memory_history_satisfies_contract() {
    history_contract(&MemoryHistoryStore::new()).await;
}

#[tokio::test]
async fn jsonl_history_satisfies_contract() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonlHistoryStore::open(dir.path().join("history.jsonl"))
        .await
        .unwrap();
    history_contract(&store).await;
}

#[tokio::test]
async fn history_records_are_never_rewritten() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.jsonl");
    let store = JsonlHistoryStore::open(&path).await.unwrap();

    store
        .append(outcome("j1", "a/b", "s1", OutcomeStatus::Failed))
        .await
        .unwrap();
    let first = std::fs::read_to_string(&path).unwrap();

    store
        .append(outcome("j2", "a/b", "s1", OutcomeStatus::Failed))
        .await
        .unwrap();
    let second = std::fs::read_to_string(&path).unwrap();

    assert!(second.starts_with(&first), "append must preserve prior bytes");
}

// ===========================================================================
// ThrottleLedger contract
// ===========================================================================

async fn ledger_contract(ledger: &dyn ThrottleLedger) {
    assert!(ledger.load().await.unwrap().is_empty());

    let t0 = Utc::now();
    let mut entry = ThrottleEntry::new("sig", t0);
    entry.push_attempt(t0 + Duration::minutes(10), Duration::hours(24));
    ledger.save(&[entry.clone()]).await.unwrap();

    let loaded = ledger.load().await.unwrap();
    assert_eq!(loaded, vec![entry]);

    ledger.save(&[]).await.unwrap();
    assert!(ledger.load().await.unwrap().is_empty());
}

#[tokio::test]
async fn memory_ledger_satisfies_contract() {
    let ledger = MemoryThrottleLedger::new();
    ledger_contract(&ledger).await;
    assert_eq!(ledger.save_count(), 2);
}

#[tokio::test]
async fn fs_ledger_satisfies_contract() {
    let dir = tempfile::tempdir().unwrap();
    ledger_contract(&FsThrottleLedger::new(dir.path().join("throttle.json"))).await;
}
