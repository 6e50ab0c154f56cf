//! One claimed task, from workspace creation to `completed` or `blocked`.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::executor::{ExecutionOutcome, TaskExecutor};
use super::lock::LockManager;
use super::workspace::WorkspaceProvider;
use crate::config::Config;
use crate::core::{Task, TaskId, TaskStatus};
use crate::state::{Claim, TaskRepository};
use crate::util::{blocking, run_checks};
use crate::{rlog, rlog_debug, rlog_warn, Error};

/// How long cancelled work gets to wind down before it is dropped.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Running,
    Succeeded,
    Failed,
}

/// Where the task record ended up when the session finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Completed,
    Blocked,
    /// Cancelled before finishing; the task went back to `backlog`.
    Requeued,
    /// The claim was reclaimed by someone else; the record was left alone.
    ClaimLost,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionOutcome {
    pub task_id: TaskId,
    pub worker_id: String,
    pub state: SessionState,
    pub disposition: Disposition,
    pub reason: Option<String>,
    pub workspace: Option<PathBuf>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub budget: Duration,
    pub heartbeat_interval: Duration,
    pub check_timeout: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            budget: config.task_budget(),
            heartbeat_interval: config.heartbeat_interval(),
            check_timeout: config.check_timeout(),
        }
    }
}

/// Why a running phase stopped early.
enum Interrupt {
    Lost,
    Cancelled,
}

pub struct WorkerSession {
    task: Task,
    claim: Claim,
    state: SessionState,
    tasks: Arc<dyn TaskRepository>,
    locks: Arc<LockManager>,
    workspaces: Arc<dyn WorkspaceProvider>,
    executor: Arc<dyn TaskExecutor>,
    settings: SessionSettings,
}

impl WorkerSession {
    pub fn new(
        task: Task,
        claim: Claim,
        tasks: Arc<dyn TaskRepository>,
        locks: Arc<LockManager>,
        workspaces: Arc<dyn WorkspaceProvider>,
        executor: Arc<dyn TaskExecutor>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            task,
            claim,
            state: SessionState::Starting,
            tasks,
            locks,
            workspaces,
            executor,
            settings,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task.id
    }

    /// Drive the session to completion. Never returns an error: every
    /// failure is turned into a disposition of the task.
    pub async fn run(mut self, cancel: CancellationToken) -> SessionOutcome {
        let started = Instant::now();
        let id = self.task.id.clone();

        let workspace = {
            let workspaces = Arc::clone(&self.workspaces);
            let id = id.clone();
            blocking(move || workspaces.create(&id)).await
        };
        let workspace = match workspace {
            Ok(path) => path,
            Err(e) => {
                let reason = format!("could not create workspace: {}", e);
                return self.finish_failed(reason, None, started);
            }
        };

        self.state = SessionState::Running;
        rlog!("{} started {} in {}", self.claim.worker_id, id, workspace.display());

        let verdict = match self.run_phases(&workspace, &cancel).await {
            Ok(verdict) => verdict,
            Err(Interrupt::Lost) => return self.finish_lost(Some(workspace), started),
            Err(Interrupt::Cancelled) => return self.finish_requeued(Some(workspace), started),
        };

        // Someone may have reclaimed the task while the last phase ran.
        match self.locks.heartbeat(&self.claim) {
            Ok(claim) => self.claim = claim,
            Err(e) if e.is_contention() => return self.finish_lost(Some(workspace), started),
            Err(e) => rlog_warn!("final heartbeat for {} failed: {}", id, e),
        }

        match verdict {
            None => self.finish_succeeded(workspace, started),
            Some(reason) => self.finish_failed(reason, Some(workspace), started),
        }
    }

    /// Execute, commit, verify. `Ok(None)` means success, `Ok(Some(reason))` failure.
    async fn run_phases(
        &mut self,
        workspace: &Path,
        cancel: &CancellationToken,
    ) -> std::result::Result<Option<String>, Interrupt> {
        let exec_cancel = cancel.child_token();
        let executor = Arc::clone(&self.executor);
        let task = self.task.clone();
        let budget = self.settings.budget;
        let path = workspace.to_path_buf();
        let token = exec_cancel.clone();
        let execution = async move {
            tokio::time::timeout(budget, executor.execute(&task, &path, token)).await
        };

        let result = self.heartbeating(execution, &exec_cancel).await;
        let result = match result {
            Ok(r) => r,
            Err(interrupt) => {
                exec_cancel.cancel();
                return Err(interrupt);
            }
        };
        match result {
            Err(_) => {
                return Ok(Some(format!(
                    "exceeded execution budget of {:?}",
                    budget
                )))
            }
            Ok(Err(_)) if cancel.is_cancelled() => return Err(Interrupt::Cancelled),
            Ok(Err(e)) => return Ok(Some(format!("executor error: {}", e))),
            Ok(Ok(ExecutionOutcome::Failed { reason })) => return Ok(Some(reason)),
            Ok(Ok(ExecutionOutcome::Passed)) => {}
        }

        let committed = {
            let workspaces = Arc::clone(&self.workspaces);
            let id = self.task.id.clone();
            let message = format!("{}: {}", self.task.id, self.task.title);
            blocking(move || workspaces.commit(&id, &message)).await
        };
        match committed {
            Ok(true) => {}
            Ok(false) => return Ok(Some("executor produced no changes".to_string())),
            Err(e) => return Ok(Some(format!("could not commit workspace: {}", e))),
        }

        if self.task.verification.is_empty() {
            return Ok(None);
        }
        let commands = self.task.verification.clone();
        let limit = self.settings.check_timeout;
        let path = workspace.to_path_buf();
        let checks = async move { run_checks(&commands, &path, limit).await };
        let checked = self.heartbeating(checks, cancel).await?;
        match checked {
            Ok(None) => Ok(None),
            Ok(Some(failure)) => Ok(Some(format!("verification failed: {}", failure.summary()))),
            Err(Error::Timeout(limit)) => Ok(Some(format!(
                "verification timed out after {}s",
                limit.as_secs()
            ))),
            Err(e) => Ok(Some(format!("verification could not run: {}", e))),
        }
    }

    /// Await `work` while refreshing the claim every heartbeat interval.
    async fn heartbeating<F: Future>(
        &mut self,
        work: F,
        cancel: &CancellationToken,
    ) -> std::result::Result<F::Output, Interrupt> {
        tokio::pin!(work);
        let mut ticker = tokio::time::interval(self.settings.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                output = &mut work => return Ok(output),
                _ = ticker.tick() => match self.locks.heartbeat(&self.claim) {
                    Ok(claim) => self.claim = claim,
                    Err(e) if e.is_contention() => {
                        rlog_warn!("{} lost its claim on {}", self.claim.worker_id, self.task.id);
                        return Err(Interrupt::Lost);
                    }
                    Err(e) => rlog_warn!("heartbeat for {} failed: {}", self.task.id, e),
                },
                _ = cancel.cancelled() => {
                    let _ = tokio::time::timeout(CANCEL_GRACE, &mut work).await;
                    return Err(Interrupt::Cancelled);
                }
            }
        }
    }

    fn outcome(
        &self,
        disposition: Disposition,
        reason: Option<String>,
        workspace: Option<PathBuf>,
        started: Instant,
    ) -> SessionOutcome {
        SessionOutcome {
            task_id: self.task.id.clone(),
            worker_id: self.claim.worker_id.clone(),
            state: self.state,
            disposition,
            reason,
            workspace,
            elapsed: started.elapsed(),
        }
    }

    fn release(&self) {
        if let Err(e) = self.locks.release(&self.claim) {
            rlog_warn!("failed to release claim on {}: {}", self.task.id, e);
        }
    }

    fn finish_succeeded(mut self, workspace: PathBuf, started: Instant) -> SessionOutcome {
        let id = self.task.id.clone();
        match self
            .tasks
            .move_state(&id, TaskStatus::InProgress, TaskStatus::Completed)
        {
            Ok(()) => {
                self.state = SessionState::Succeeded;
                self.release();
                rlog!("{} completed in {}s", id, started.elapsed().as_secs());
                self.outcome(Disposition::Completed, None, Some(workspace), started)
            }
            Err(e) if e.is_contention() => self.finish_lost(Some(workspace), started),
            Err(e) => {
                let reason = format!("could not record completion: {}", e);
                self.finish_failed(reason, Some(workspace), started)
            }
        }
    }

    fn finish_failed(
        mut self,
        reason: String,
        workspace: Option<PathBuf>,
        started: Instant,
    ) -> SessionOutcome {
        self.state = SessionState::Failed;
        let id = self.task.id.clone();
        if let Err(e) = self.tasks.record_reason(&id, &reason) {
            rlog_warn!("failed to record reason for {}: {}", id, e);
        }
        match self
            .tasks
            .move_state(&id, TaskStatus::InProgress, TaskStatus::Blocked)
        {
            Ok(()) => {
                self.release();
                rlog_warn!("{} blocked: {}", id, reason);
                self.outcome(Disposition::Blocked, Some(reason), workspace, started)
            }
            Err(e) => {
                let _ = self.tasks.clear_reason(&id);
                if e.is_contention() {
                    return self.finish_lost(workspace, started);
                }
                self.release();
                rlog_warn!("{} failed but could not be blocked: {}", id, e);
                self.outcome(Disposition::Blocked, Some(reason), workspace, started)
            }
        }
    }

    fn finish_requeued(mut self, workspace: Option<PathBuf>, started: Instant) -> SessionOutcome {
        self.state = SessionState::Failed;
        let id = self.task.id.clone();
        match self
            .tasks
            .move_state(&id, TaskStatus::InProgress, TaskStatus::Backlog)
        {
            Ok(()) => {}
            Err(e) if e.is_contention() => return self.finish_lost(workspace, started),
            Err(e) => rlog_warn!("failed to requeue {}: {}", id, e),
        }
        self.release();
        rlog!("{} cancelled and returned to backlog", id);
        self.outcome(
            Disposition::Requeued,
            Some("cancelled".to_string()),
            workspace,
            started,
        )
    }

    fn finish_lost(mut self, workspace: Option<PathBuf>, started: Instant) -> SessionOutcome {
        self.state = SessionState::Failed;
        rlog_debug!("{} gave up {} after losing the claim", self.claim.worker_id, self.task.id);
        self.outcome(
            Disposition::ClaimLost,
            Some("claim was reclaimed".to_string()),
            workspace,
            started,
        )
    }
}
