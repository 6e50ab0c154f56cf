//! Exclusive claiming on the filesystem store.

use std::sync::{Arc, Barrier};
use std::time::Duration;

use relay::core::TaskStatus;
use relay::orchestration::LockManager;
use relay::state::{ClaimStore, FsStore, TaskRepository};

use crate::fixtures::{id, task, TestRepo};

fn manager(repo: &TestRepo, stale: Duration) -> (Arc<FsStore>, Arc<LockManager>) {
    let store = Arc::new(repo.store());
    let locks = Arc::new(LockManager::new(store.clone(), store.clone(), stale));
    (store, locks)
}

/// Test: Racing claims
/// Given one backlog task and sixteen workers
/// When they all claim it at once
/// Then exactly one wins and every other attempt is contention
#[test]
fn test_racing_claims_have_one_winner() {
    let repo = TestRepo::new();
    let (store, locks) = manager(&repo, Duration::from_secs(60));
    store.insert(&task("api", &[])).unwrap();

    let barrier = Arc::new(Barrier::new(16));
    let handles: Vec<_> = (0..16)
        .map(|n| {
            let locks = locks.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                locks.claim(&id("api"), &format!("worker-{}", n))
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| e.is_contention()));

    let claim = store.get(&id("api")).unwrap().unwrap();
    assert_eq!(&claim, winners[0]);
    assert_eq!(store.list(TaskStatus::InProgress).unwrap().tasks.len(), 1);
    assert!(store.list(TaskStatus::Backlog).unwrap().tasks.is_empty());
}

/// Test: Concurrent reclamation
/// Given a stale claim seen by two observers
/// When both reclaim it
/// Then the task returns to the backlog exactly once
#[test]
fn test_concurrent_reclaim_requeues_once() {
    let repo = TestRepo::new();
    let (store, locks) = manager(&repo, Duration::from_millis(50));
    store.insert(&task("api", &[])).unwrap();
    let claim = locks.claim(&id("api"), "crashed").unwrap();
    std::thread::sleep(Duration::from_millis(80));

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let locks = locks.clone();
            let barrier = barrier.clone();
            let claim = claim.clone();
            std::thread::spawn(move || {
                barrier.wait();
                locks.reclaim(&claim).unwrap()
            })
        })
        .collect();
    let wins = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count();

    assert_eq!(wins, 1);
    assert_eq!(store.list(TaskStatus::Backlog).unwrap().tasks.len(), 1);
    assert!(store.list(TaskStatus::InProgress).unwrap().tasks.is_empty());
    assert!(store.get(&id("api")).unwrap().is_none());
    assert!(locks.heartbeat(&claim).unwrap_err().is_contention());
}

/// Test: Moving a record twice reports the second move as contention
#[test]
fn test_repeated_transition_is_non_fatal() {
    let repo = TestRepo::new();
    let store = repo.store();
    store.insert(&task("api", &[])).unwrap();

    store
        .move_state(&id("api"), TaskStatus::Backlog, TaskStatus::InProgress)
        .unwrap();
    let err = store
        .move_state(&id("api"), TaskStatus::Backlog, TaskStatus::InProgress)
        .unwrap_err();
    assert!(err.is_contention());
    assert_eq!(store.snapshot().unwrap().tasks.len(), 1);
}

/// Test: Claim files live next to the in-progress record
#[test]
fn test_claim_record_is_on_disk() {
    let repo = TestRepo::new();
    let (store, locks) = manager(&repo, Duration::from_secs(60));
    store.insert(&task("api", &[])).unwrap();
    let claim = locks.claim(&id("api"), "w1").unwrap();

    let path = store.claim_path(&id("api"));
    assert!(path.starts_with(repo.path.join(".relay/tasks/in_progress")));
    let on_disk: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(on_disk["worker_id"], "w1");

    locks.release(&claim).unwrap();
    assert!(!path.exists());
}
