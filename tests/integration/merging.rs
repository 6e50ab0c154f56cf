//! Integrating completed workspaces into a real git baseline.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use relay::config::Config;
use relay::git::GitWorkspaces;
use relay::orchestration::{Integration, MergeCoordinator, Resolution, WorkspaceProvider};
use relay::state::{FsStore, TaskRepository};

use crate::fixtures::{id, scheduler, settings, task, ScriptedExecutor, Step, TestRepo};

/// Run `tasks` to completion with `executor`, one session at a time.
async fn complete(
    repo: &TestRepo,
    names: &[&str],
    executor: ScriptedExecutor,
) -> (Arc<FsStore>, Arc<GitWorkspaces>) {
    let store = Arc::new(repo.store());
    for name in names {
        store.insert(&task(name, &[])).unwrap();
    }
    let workspaces = Arc::new(
        GitWorkspaces::new(&repo.path, repo.path.join(".relay/worktrees"), "relay/").unwrap(),
    );
    let (mut scheduler, _events) = scheduler(
        store.clone(),
        Duration::from_secs(60),
        workspaces.clone(),
        Arc::new(executor),
        settings(1),
    );
    let report = scheduler.run(CancellationToken::new()).await.unwrap();
    assert_eq!(report.completed.len(), names.len(), "{:?}", report.blocked);
    (store, workspaces)
}

/// Test: An unresolvable conflict is recorded and skipped
/// Given t1 edits shared.txt, t2 deletes it, and t3 adds a file
/// When the completed tasks are merged with a verification suite
/// Then t1 and t3 are integrated, t2's conflict is recorded for review,
/// and the baseline passes verification with t1's and t3's changes
#[tokio::test]
async fn test_conflicting_task_is_skipped_and_the_rest_merge() {
    let repo = TestRepo::new();
    let executor = ScriptedExecutor::new()
        .script(
            "t1",
            vec![
                Step::Write("shared.txt", "from t1\n"),
                Step::Write("t1.txt", "one\n"),
            ],
        )
        .script("t2", vec![Step::Remove("shared.txt")])
        .script("t3", vec![Step::Write("t3.txt", "three\n")]);
    let (store, workspaces) = complete(&repo, &["t1", "t2", "t3"], executor).await;

    let coordinator = MergeCoordinator::new(
        store,
        workspaces.clone(),
        vec!["test -f t1.txt && grep -q 'from t1' shared.txt".to_string()],
        Duration::from_secs(30),
    )
    .with_report_path(Config::merge_report_path(&repo.path));
    let report = coordinator.run().await.unwrap();

    assert_eq!(report.order, vec![id("t1"), id("t2"), id("t3")]);
    assert!(report.is_success(), "{:?}", report.failure);
    assert_eq!(report.merged_ids(), vec![&id("t1"), &id("t3")]);
    assert_eq!(report.skipped, vec![id("t2")]);
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].task_id, id("t2"));
    assert_eq!(report.conflicts[0].resolution, Resolution::Skipped);
    assert_eq!(report.conflicts[0].paths, vec!["shared.txt".to_string()]);

    assert_eq!(repo.read("shared.txt").as_deref(), Some("from t1\n"));
    assert_eq!(repo.read("t1.txt").as_deref(), Some("one\n"));
    assert_eq!(repo.read("t3.txt").as_deref(), Some("three\n"));
    assert_eq!(repo.head_parents(), 2, "t3 lands as a merge commit");

    assert_eq!(report.discarded, vec![id("t1"), id("t3")]);
    assert!(!workspaces.exists(&id("t1")));
    assert!(workspaces.exists(&id("t2")), "conflicted work is kept for review");

    let saved: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(Config::merge_report_path(&repo.path)).unwrap(),
    )
    .unwrap();
    assert_eq!(saved["conflicts"][0]["resolution"], "skipped");
}

/// Test: Content conflicts resolve in favor of the later task
#[tokio::test]
async fn test_content_conflict_prefers_later_task() {
    let repo = TestRepo::new();
    let executor = ScriptedExecutor::new()
        .script("t1", vec![Step::Write("shared.txt", "from t1\n")])
        .script("t2", vec![Step::Write("shared.txt", "from t2\n")]);
    let (store, workspaces) = complete(&repo, &["t1", "t2"], executor).await;

    let report = MergeCoordinator::new(store, workspaces, vec![], Duration::from_secs(30))
        .run()
        .await
        .unwrap();

    assert!(matches!(report.merged[0].integration, Integration::FastForward { .. }));
    assert!(matches!(
        &report.merged[1].integration,
        Integration::Merged { conflicts, .. } if conflicts == &vec!["shared.txt".to_string()]
    ));
    assert_eq!(report.conflicts[0].resolution, Resolution::FavoredIncoming);
    assert_eq!(repo.read("shared.txt").as_deref(), Some("from t2\n"));
}

/// Test: Verification failure halts the merge
/// Given three completed tasks and a suite that breaks once t2 is merged
/// When the merge runs
/// Then t1 and t2 stay merged, t3 is left unmerged, t2 is named as the
/// breaking integration, and no workspace is discarded
#[tokio::test]
async fn test_verification_failure_halts_merging() {
    let repo = TestRepo::new();
    let (store, workspaces) = complete(&repo, &["t1", "t2", "t3"], ScriptedExecutor::new()).await;

    let report = MergeCoordinator::new(
        store.clone(),
        workspaces.clone(),
        vec!["test ! -f t2.txt".to_string()],
        Duration::from_secs(30),
    )
    .run()
    .await
    .unwrap();

    let failure = report.failure.clone().unwrap();
    assert_eq!(failure.task_id, id("t2"));
    assert_eq!(report.merged_ids(), vec![&id("t1"), &id("t2")]);
    assert_eq!(report.remaining, vec![id("t3")]);
    assert!(report.discarded.is_empty());
    assert!(repo.read("t2.txt").is_some());
    assert!(repo.read("t3.txt").is_none());
    for name in ["t1", "t2", "t3"] {
        assert!(workspaces.exists(&id(name)));
    }
    assert_eq!(store.list(relay::core::TaskStatus::Completed).unwrap().tasks.len(), 3);
}

/// Test: A dirty baseline is refused before anything is merged
#[tokio::test]
async fn test_dirty_baseline_is_refused() {
    let repo = TestRepo::new();
    let (store, workspaces) = complete(&repo, &["t1"], ScriptedExecutor::new()).await;
    std::fs::write(repo.path.join("shared.txt"), "uncommitted\n").unwrap();

    let err = MergeCoordinator::new(store, workspaces.clone(), vec![], Duration::from_secs(30))
        .run()
        .await
        .unwrap_err();
    assert!(err.to_string().contains("uncommitted changes"));
    assert!(workspaces.exists(&id("t1")));
    assert!(repo.read("t1.txt").is_none());
}
