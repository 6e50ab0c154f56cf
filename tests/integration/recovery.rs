//! Blocked tasks, stale claims and resets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use relay::core::{Task, TaskId, TaskStatus};
use relay::orchestration::{LockManager, SchedulerEvent, StatusReport};
use relay::state::{ArchiveSummary, Claim, ClaimStore, FsStore, Listing, TaskRepository};
use relay::Result;

use crate::fixtures::{
    drain_events, id, scheduler, settings, task, DirWorkspaces, ScriptedExecutor, Step, TestRepo,
};

/// Test: A failed dependency leaves its dependents unreachable
/// Given b depends on a, c is independent, and a fails
/// When the schedule runs to the end
/// Then a is blocked with its reason, b stays in the backlog unclaimed
/// and is reported unreachable, and c completes
#[tokio::test]
async fn test_blocked_dependency_makes_dependents_unreachable() {
    let repo = TestRepo::new();
    let store = Arc::new(repo.store());
    for t in [task("a", &[]), task("b", &["a"]), task("c", &[])] {
        store.insert(&t).unwrap();
    }
    let executor =
        Arc::new(ScriptedExecutor::new().script("a", vec![Step::Fail("migration does not apply")]));
    let (mut scheduler, mut events) = scheduler(
        store.clone(),
        Duration::from_secs(60),
        Arc::new(DirWorkspaces::new()),
        executor.clone(),
        settings(2),
    );

    let report = scheduler.run(CancellationToken::new()).await.unwrap();

    assert_eq!(report.completed, vec![id("c")]);
    assert_eq!(report.blocked.len(), 1);
    assert_eq!(report.blocked[0].0, id("a"));
    assert!(report.blocked[0].1.contains("migration does not apply"));
    assert_eq!(report.unreachable.len(), 1);
    assert_eq!(report.unreachable[0].task, id("b"));
    assert!(!executor.executed().contains(&id("b")));

    let backlog = store.list(TaskStatus::Backlog).unwrap().tasks;
    assert_eq!(backlog.len(), 1);
    assert_eq!(backlog[0].id, id("b"));

    let status = StatusReport::collect(store.as_ref(), store.as_ref(), Duration::from_secs(60))
        .unwrap();
    assert_eq!(status.remaining, 0);
    assert_eq!(status.unreachable[0].chain, vec![id("a"), id("b")]);
    assert!(status.blocked[0]
        .reason
        .as_deref()
        .unwrap()
        .contains("migration does not apply"));
    let text = status.to_string();
    assert!(text.contains("b (blocked via a -> b)"));

    let events = drain_events(&mut events);
    assert!(events
        .iter()
        .any(|e| matches!(e, SchedulerEvent::TasksUnreachable { tasks } if tasks[0].task == id("b"))));
}

/// Test: A crashed worker's claim is taken over
/// Given a task claimed by a worker that never heartbeats
/// When the stale threshold passes and the scheduler ticks
/// Then the claim is reclaimed and a different worker claims and completes the task
#[tokio::test]
async fn test_stale_claim_is_reclaimed_and_reclaimed_task_runs() {
    let repo = TestRepo::new();
    let store = Arc::new(repo.store());
    store.insert(&task("api", &[])).unwrap();

    let stale = Duration::from_millis(200);
    let crashed = LockManager::new(store.clone(), store.clone(), stale)
        .claim(&id("api"), "crashed-worker")
        .unwrap();

    let (mut scheduler, mut events) = scheduler(
        store.clone(),
        stale,
        Arc::new(DirWorkspaces::new()),
        Arc::new(ScriptedExecutor::new()),
        settings(2),
    );

    let early = scheduler.tick().await.unwrap();
    assert!(early.reclaimed.is_empty());
    assert!(early.claimed.is_empty());

    tokio::time::sleep(Duration::from_millis(300)).await;
    let tick = scheduler.tick().await.unwrap();
    assert_eq!(tick.reclaimed.len(), 1);
    assert_eq!(tick.reclaimed[0].worker_id, "crashed-worker");
    assert!(tick.reclaimed[0].idle >= stale);
    assert_eq!(tick.claimed, vec![id("api")]);

    let takeover = store.get(&id("api")).unwrap().unwrap();
    assert_ne!(takeover.worker_id, "crashed-worker");

    let finished = scheduler.settle().await;
    assert_eq!(finished.completed, vec![id("api")]);
    assert!(store.heartbeat(&crashed).unwrap_err().is_contention());

    let events = drain_events(&mut events);
    assert!(matches!(
        &events[0],
        SchedulerEvent::ClaimReclaimed { task_id, worker_id, .. }
            if task_id == &id("api") && worker_id == "crashed-worker"
    ));
}

/// Test: Cancelling a run returns in-flight tasks to the backlog
#[tokio::test]
async fn test_cancelled_run_requeues_running_tasks() {
    let repo = TestRepo::new();
    let store = Arc::new(repo.store());
    store.insert(&task("slow", &[])).unwrap();
    let (mut scheduler, _events) = scheduler(
        store.clone(),
        Duration::from_secs(60),
        Arc::new(DirWorkspaces::new()),
        Arc::new(ScriptedExecutor::new().script("slow", vec![Step::Hang])),
        settings(1),
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        trigger.cancel();
    });
    let report = scheduler.run(cancel).await.unwrap();

    assert!(report.cancelled);
    assert_eq!(report.requeued, vec![id("slow")]);
    assert_eq!(store.list(TaskStatus::Backlog).unwrap().tasks.len(), 1);
    assert!(store.list_claims().unwrap().is_empty());
}

/// Test: Reset returns every unfinished task to the backlog
/// Given one claimed task, one blocked task and one completed task
/// When reset runs
/// Then claims are gone, the claimed and blocked tasks are in the backlog,
/// and the completed task is untouched
#[test]
fn test_reset_requeues_unfinished_work() {
    let repo = TestRepo::new();
    let store = Arc::new(repo.store());
    for name in ["held", "failed", "done"] {
        store.insert(&task(name, &[])).unwrap();
    }
    let locks = LockManager::new(store.clone(), store.clone(), Duration::from_secs(60));
    locks.claim(&id("held"), "w1").unwrap();
    store
        .move_state(&id("failed"), TaskStatus::Backlog, TaskStatus::Blocked)
        .unwrap();
    store.record_reason(&id("failed"), "boom").unwrap();
    store
        .move_state(&id("done"), TaskStatus::Backlog, TaskStatus::Completed)
        .unwrap();

    let summary = locks.force_reclaim_all().unwrap();

    assert_eq!(summary.revoked, vec![id("held")]);
    assert_eq!(summary.requeued, vec![id("failed"), id("held")]);
    assert!(store.list_claims().unwrap().is_empty());
    let backlog = store.list(TaskStatus::Backlog).unwrap().tasks;
    assert_eq!(backlog.len(), 2);
    assert!(backlog.iter().all(|t| t.blocked_reason.is_none()));
    assert_eq!(store.list(TaskStatus::Completed).unwrap().tasks.len(), 1);
}

/// An `FsStore` where another worker finishes `task` just after the
/// in-progress collection is first listed.
struct FinishedElsewhere {
    inner: FsStore,
    task: TaskId,
    pending: AtomicBool,
}

impl TaskRepository for FinishedElsewhere {
    fn list(&self, status: TaskStatus) -> Result<Listing> {
        let listing = self.inner.list(status)?;
        if status == TaskStatus::InProgress && self.pending.swap(false, Ordering::SeqCst) {
            self.inner
                .move_state(&self.task, TaskStatus::InProgress, TaskStatus::Completed)?;
        }
        Ok(listing)
    }
    fn insert(&self, task: &Task) -> Result<()> {
        self.inner.insert(task)
    }
    fn move_state(&self, id: &TaskId, from: TaskStatus, to: TaskStatus) -> Result<()> {
        self.inner.move_state(id, from, to)
    }
    fn record_reason(&self, id: &TaskId, reason: &str) -> Result<()> {
        self.inner.record_reason(id, reason)
    }
    fn clear_reason(&self, id: &TaskId) -> Result<()> {
        self.inner.clear_reason(id)
    }
    fn archive(&self, label: &str) -> Result<ArchiveSummary> {
        self.inner.archive(label)
    }
}

impl ClaimStore for FinishedElsewhere {
    fn try_acquire(&self, task: &TaskId, worker: &str) -> Result<Claim> {
        self.inner.try_acquire(task, worker)
    }
    fn heartbeat(&self, claim: &Claim) -> Result<Claim> {
        self.inner.heartbeat(claim)
    }
    fn release(&self, claim: &Claim) -> Result<()> {
        self.inner.release(claim)
    }
    fn revoke(&self, claim: &Claim) -> Result<bool> {
        self.inner.revoke(claim)
    }
    fn get(&self, task: &TaskId) -> Result<Option<Claim>> {
        self.inner.get(task)
    }
    fn list_claims(&self) -> Result<Vec<Claim>> {
        self.inner.list_claims()
    }
}

/// Test: Another worker finishing a task mid-pass does not end the run
/// Given a in progress elsewhere and b depending on a
/// When a moves to completed while the scheduler is reading the collections
/// Then the pass sees a as completed and b is scheduled and completes
#[tokio::test]
async fn test_completion_during_snapshot_is_not_fatal() {
    let repo = TestRepo::new();
    let inner = repo.store();
    inner.insert(&task("a", &[])).unwrap();
    inner.insert(&task("b", &["a"])).unwrap();
    inner
        .move_state(&id("a"), TaskStatus::Backlog, TaskStatus::InProgress)
        .unwrap();
    let store = Arc::new(FinishedElsewhere {
        inner,
        task: id("a"),
        pending: AtomicBool::new(true),
    });
    let (mut scheduler, mut events) = scheduler(
        store.clone(),
        Duration::from_secs(60),
        Arc::new(DirWorkspaces::new()),
        Arc::new(ScriptedExecutor::new()),
        settings(2),
    );

    let report = scheduler.run(CancellationToken::new()).await.unwrap();

    assert_eq!(report.completed, vec![id("b")]);
    assert_eq!(store.list(TaskStatus::Completed).unwrap().tasks.len(), 2);
    assert!(!drain_events(&mut events)
        .iter()
        .any(|e| matches!(e, SchedulerEvent::PassAborted { .. })));
}

/// Test: Archiving keeps the records live dependents still need
/// Given a completed and b in the backlog depending on it
/// When archive runs
/// Then it is refused and a later run still schedules b
#[tokio::test]
async fn test_archive_refusal_keeps_dependents_schedulable() {
    let repo = TestRepo::new();
    let store = Arc::new(repo.store());
    store.insert(&task("a", &[])).unwrap();
    store.insert(&task("b", &["a"])).unwrap();
    store
        .move_state(&id("a"), TaskStatus::Backlog, TaskStatus::Completed)
        .unwrap();

    let err = store.archive("sprint").unwrap_err();
    assert!(err.to_string().contains("b needs a"));

    let (mut scheduler, _events) = scheduler(
        store.clone(),
        Duration::from_secs(60),
        Arc::new(DirWorkspaces::new()),
        Arc::new(ScriptedExecutor::new()),
        settings(1),
    );
    let report = scheduler.run(CancellationToken::new()).await.unwrap();
    assert_eq!(report.completed, vec![id("b")]);

    let summary = store.archive("sprint").unwrap();
    assert_eq!(summary.completed, vec![id("a"), id("b")]);
}
