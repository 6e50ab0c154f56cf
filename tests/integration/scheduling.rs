//! Dependency-ordered dispatch.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use relay::core::TaskStatus;
use relay::orchestration::SchedulerEvent;
use relay::state::{ClaimStore, FsStore, TaskRepository};

use crate::fixtures::{drain_events, id, scheduler, settings, task, DirWorkspaces, ScriptedExecutor};

fn diamond(store: &FsStore) {
    for t in [
        task("a", &[]),
        task("b", &["a"]),
        task("c", &["a"]),
        task("d", &["b", "c"]),
    ] {
        store.insert(&t).unwrap();
    }
}

fn store() -> (tempfile::TempDir, Arc<FsStore>) {
    let dir = tempfile::TempDir::new().unwrap();
    let store = FsStore::new(dir.path());
    store.init().unwrap();
    (dir, Arc::new(store))
}

/// Test: Diamond dependencies, one pass at a time
/// Given tasks {a, b:[a], c:[a], d:[b,c]}
/// When the scheduler ticks and waits for its sessions between ticks
/// Then a runs alone, b and c run together, and d runs last
#[tokio::test]
async fn test_diamond_is_scheduled_in_waves() {
    let (_dir, store) = store();
    diamond(&store);
    let (mut scheduler, _events) = scheduler(
        store.clone(),
        Duration::from_secs(60),
        Arc::new(DirWorkspaces::new()),
        Arc::new(ScriptedExecutor::new()),
        settings(4),
    );

    let first = scheduler.tick().await.unwrap();
    assert_eq!(first.claimed, vec![id("a")]);
    assert_eq!(first.waiting, vec![id("b"), id("c"), id("d")]);
    assert!(store.get(&id("a")).unwrap().is_some());
    assert_eq!(scheduler.settle().await.completed, vec![id("a")]);
    assert!(store.get(&id("a")).unwrap().is_none());

    let second = scheduler.tick().await.unwrap();
    assert_eq!(second.claimed, vec![id("b"), id("c")]);
    assert_eq!(second.waiting, vec![id("d")]);
    let mut done = scheduler.settle().await.completed;
    done.sort();
    assert_eq!(done, vec![id("b"), id("c")]);

    let third = scheduler.tick().await.unwrap();
    assert_eq!(third.claimed, vec![id("d")]);
    scheduler.settle().await;

    let last = scheduler.tick().await.unwrap();
    assert!(last.ready.is_empty() && last.waiting.is_empty());
    assert_eq!(store.list(TaskStatus::Completed).unwrap().tasks.len(), 4);
    assert!(store.list_claims().unwrap().is_empty());
}

/// Test: Full run never claims a task before its dependencies complete
#[tokio::test]
async fn test_run_claims_dependents_only_after_dependencies_complete() {
    let (_dir, store) = store();
    diamond(&store);
    let executor = Arc::new(ScriptedExecutor::new());
    let (mut scheduler, mut events) = scheduler(
        store.clone(),
        Duration::from_secs(60),
        Arc::new(DirWorkspaces::new()),
        executor.clone(),
        settings(4),
    );

    let report = scheduler.run(CancellationToken::new()).await.unwrap();
    assert_eq!(report.completed.len(), 4);
    assert!(!report.idle_timeout);
    assert_eq!(executor.executed().first(), Some(&id("a")));
    assert_eq!(executor.executed().last(), Some(&id("d")));

    let events = drain_events(&mut events);
    let position = |wanted: &SchedulerEvent| events.iter().position(|e| e == wanted).unwrap();
    let claimed = |name: &str| {
        events
            .iter()
            .position(|e| matches!(e, SchedulerEvent::TaskClaimed { task_id, .. } if task_id == &id(name)))
            .unwrap()
    };
    let completed = |name: &str| position(&SchedulerEvent::TaskCompleted { task_id: id(name) });

    assert!(claimed("b") > completed("a"));
    assert!(claimed("c") > completed("a"));
    assert!(claimed("d") > completed("b"));
    assert!(claimed("d") > completed("c"));
}

/// Test: Pool size caps concurrency
/// Given five independent tasks and a pool of two
/// When one pass runs
/// Then exactly the first two ready tasks (by id) are claimed
#[tokio::test]
async fn test_pool_size_limits_claims_per_pass() {
    let (_dir, store) = store();
    for name in ["e", "d", "c", "b", "a"] {
        store.insert(&task(name, &[])).unwrap();
    }
    let (mut scheduler, _events) = scheduler(
        store.clone(),
        Duration::from_secs(60),
        Arc::new(DirWorkspaces::new()),
        Arc::new(ScriptedExecutor::new()),
        settings(2),
    );

    let tick = scheduler.tick().await.unwrap();
    assert_eq!(tick.claimed, vec![id("a"), id("b")]);
    assert_eq!(scheduler.active_count(), 2);

    let again = scheduler.tick().await.unwrap();
    assert!(again.claimed.is_empty(), "no capacity until sessions finish");

    scheduler.settle().await;
    let report = scheduler.run(CancellationToken::new()).await.unwrap();
    assert_eq!(report.completed.len(), 3);
    assert_eq!(store.list(TaskStatus::Completed).unwrap().tasks.len(), 5);
}

/// Test: Validation errors abort the pass without claiming anything
#[tokio::test]
async fn test_unknown_dependency_aborts_before_claiming() {
    let (_dir, store) = store();
    store.insert(&task("a", &[])).unwrap();
    store.insert(&task("b", &["ghost"])).unwrap();
    let (mut scheduler, mut events) = scheduler(
        store.clone(),
        Duration::from_secs(60),
        Arc::new(DirWorkspaces::new()),
        Arc::new(ScriptedExecutor::new()),
        settings(4),
    );

    let err = scheduler.tick().await.unwrap_err();
    assert!(err.is_validation());
    assert!(err.to_string().contains("ghost"));
    assert!(store.list_claims().unwrap().is_empty());
    assert_eq!(store.list(TaskStatus::Backlog).unwrap().tasks.len(), 2);
    assert!(matches!(
        drain_events(&mut events).as_slice(),
        [SchedulerEvent::PassAborted { .. }]
    ));

    assert!(scheduler.run(CancellationToken::new()).await.is_err());
}
