//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories with a relay state directory
//! - A scripted task executor
//! - A directory-backed workspace provider for tests that do not need git

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use git2::{IndexAddOption, Repository, Signature};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use relay::config::Config;
use relay::core::{Task, TaskId};
use relay::orchestration::{
    ExecutionOutcome, Integration, LockManager, Scheduler, SchedulerEvent, SchedulerSettings,
    SessionSettings, TaskExecutor, WorkspaceProvider,
};
use relay::state::{FsStore, TaskRepository};
use relay::{Error, Result};

pub fn id(s: &str) -> TaskId {
    TaskId::new(s).expect("valid task id")
}

pub fn task(name: &str, deps: &[&str]) -> Task {
    Task::new(id(name), &format!("Task {}", name)).with_dependencies(deps.iter().map(|d| id(d)))
}

/// A git repository in a temporary directory, with `.relay/` initialised.
pub struct TestRepo {
    /// The temporary directory containing the repo.
    pub temp_dir: TempDir,
    /// Path to the repository root.
    pub path: PathBuf,
}

impl TestRepo {
    /// Create a repository whose first commit holds `shared.txt`.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();

        let repo = Repository::init(&path).expect("Failed to init git");
        {
            let mut config = repo.config().expect("Failed to open git config");
            config.set_str("user.name", "Test User").unwrap();
            config.set_str("user.email", "test@test.com").unwrap();
        }
        std::fs::write(path.join("shared.txt"), "base\n").unwrap();
        std::fs::write(path.join(".gitignore"), ".relay/\n").unwrap();
        commit_all(&repo, "Initial commit");

        Config::ensure_state_dir(&path).expect("Failed to create state dir");
        let this = Self { temp_dir, path };
        this.store().init().expect("Failed to init task store");
        this
    }

    pub fn store(&self) -> FsStore {
        FsStore::new(&self.path)
    }

    pub fn read(&self, file: &str) -> Option<String> {
        std::fs::read_to_string(self.path.join(file)).ok()
    }

    pub fn head_parents(&self) -> usize {
        let repo = Repository::open(&self.path).unwrap();
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        head.parent_count()
    }
}

fn commit_all(repo: &Repository, message: &str) {
    let mut index = repo.index().unwrap();
    index
        .add_all(["."].iter(), IndexAddOption::DEFAULT, None)
        .unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    let sig = Signature::now("Test User", "test@test.com").unwrap();
    let parents = match repo.head() {
        Ok(head) => vec![head.peel_to_commit().unwrap()],
        Err(_) => vec![],
    };
    let parents: Vec<&git2::Commit> = parents.iter().collect();
    repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
        .unwrap();
}

/// What the scripted executor does for one task.
#[derive(Debug, Clone)]
pub enum Step {
    Write(&'static str, &'static str),
    Remove(&'static str),
    Fail(&'static str),
    /// Never finishes on its own.
    Hang,
}

/// Executes a fixed script per task and records what it ran.
///
/// Tasks without a script write `<id>.txt` and pass.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: HashMap<TaskId, Vec<Step>>,
    pub executed: Mutex<Vec<TaskId>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(mut self, task: &str, steps: Vec<Step>) -> Self {
        self.scripts.insert(id(task), steps);
        self
    }

    pub fn executed(&self) -> Vec<TaskId> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        task: &Task,
        workspace: &Path,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome> {
        self.executed.lock().unwrap().push(task.id.clone());
        let default = vec![Step::Write("", "done\n")];
        for step in self.scripts.get(&task.id).unwrap_or(&default) {
            match step {
                Step::Write("", contents) => {
                    std::fs::write(workspace.join(format!("{}.txt", task.id)), contents)?
                }
                Step::Write(file, contents) => std::fs::write(workspace.join(file), contents)?,
                Step::Remove(file) => std::fs::remove_file(workspace.join(file))?,
                Step::Fail(reason) => return Ok(ExecutionOutcome::failed(*reason)),
                Step::Hang => {
                    cancel.cancelled().await;
                    return Err(Error::Executor(format!("{} cancelled", task.id)));
                }
            }
        }
        Ok(ExecutionOutcome::Passed)
    }
}

/// Plain directories as workspaces; a workspace counts as changed once it
/// holds any file.
pub struct DirWorkspaces {
    dir: TempDir,
}

impl DirWorkspaces {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }
}

impl WorkspaceProvider for DirWorkspaces {
    fn baseline(&self) -> &Path {
        self.dir.path()
    }

    fn path(&self, task: &TaskId) -> PathBuf {
        self.dir.path().join("workspaces").join(task.as_str())
    }

    fn create(&self, task: &TaskId) -> Result<PathBuf> {
        let path = self.path(task);
        if path.exists() {
            std::fs::remove_dir_all(&path)?;
        }
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    fn commit(&self, task: &TaskId, _message: &str) -> Result<bool> {
        Ok(std::fs::read_dir(self.path(task))?.next().is_some())
    }

    fn check_baseline(&self) -> Result<()> {
        Ok(())
    }

    fn integrate(&self, _task: &TaskId) -> Result<Integration> {
        Ok(Integration::UpToDate)
    }

    fn discard(&self, task: &TaskId) -> Result<()> {
        std::fs::remove_dir_all(self.path(task))?;
        Ok(())
    }
}

pub fn settings(pool_size: usize) -> SchedulerSettings {
    SchedulerSettings {
        pool_size,
        poll_interval: Duration::from_millis(10),
        idle_shutdown: Duration::from_millis(300),
        session: SessionSettings {
            budget: Duration::from_secs(10),
            heartbeat_interval: Duration::from_millis(50),
            check_timeout: Duration::from_secs(10),
        },
    }
}

/// A scheduler wired to `store`, plus the receiving end of its events.
pub fn scheduler<S>(
    store: Arc<S>,
    stale_threshold: Duration,
    workspaces: Arc<dyn WorkspaceProvider>,
    executor: Arc<dyn TaskExecutor>,
    settings: SchedulerSettings,
) -> (Scheduler, mpsc::Receiver<SchedulerEvent>)
where
    S: TaskRepository + relay::state::ClaimStore + 'static,
{
    let locks = Arc::new(LockManager::new(
        store.clone(),
        store.clone(),
        stale_threshold,
    ));
    let (tx, rx) = mpsc::channel(256);
    let scheduler = Scheduler::new(store, locks, workspaces, executor, settings).with_events(tx);
    (scheduler, rx)
}

pub fn drain_events(rx: &mut mpsc::Receiver<SchedulerEvent>) -> Vec<SchedulerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
