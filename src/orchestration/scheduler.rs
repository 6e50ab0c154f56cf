//! The scheduling control loop.
//!
//! Every tick rebuilds the dependency graph from a fresh store snapshot,
//! reclaims stale claims, and claims ready tasks up to the free capacity of
//! the pool, starting a [`WorkerSession`] for each. Finished sessions free
//! their slot and the next tick recomputes readiness, which is how a newly
//! completed dependency unblocks its dependents.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::executor::TaskExecutor;
use super::lock::{LockManager, Reclaimed};
use super::session::{Disposition, SessionOutcome, SessionSettings, WorkerSession};
use super::workspace::WorkspaceProvider;
use crate::config::Config;
use crate::core::{TaskGraph, TaskId, TaskStatus, Unreachable};
use crate::state::TaskRepository;
use crate::{rlog, rlog_debug, rlog_error, rlog_trace, rlog_warn, Result};

/// Events emitted as the schedule progresses.
///
/// Receivers must keep draining the channel; the scheduler awaits capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// A task was claimed and its session started.
    TaskClaimed { task_id: TaskId, worker_id: String },
    TaskCompleted { task_id: TaskId },
    TaskBlocked { task_id: TaskId, reason: String },
    /// A cancelled session put its task back in the backlog.
    TaskRequeued { task_id: TaskId },
    /// A stale claim was revoked and its task returned to the backlog.
    ClaimReclaimed {
        task_id: TaskId,
        worker_id: String,
        idle: Duration,
    },
    /// Backlog tasks that can never run because something they depend on is blocked.
    TasksUnreachable { tasks: Vec<Unreachable> },
    /// The task set failed validation; nothing was scheduled this pass.
    PassAborted { error: String },
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub pool_size: usize,
    pub poll_interval: Duration,
    pub idle_shutdown: Duration,
    pub session: SessionSettings,
}

impl SchedulerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            pool_size: config.pool_size,
            poll_interval: config.poll_interval(),
            idle_shutdown: config.idle_shutdown(),
            session: SessionSettings::from_config(config),
        }
    }
}

/// What one scheduling pass saw and did.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub reclaimed: Vec<Reclaimed>,
    /// Ready tasks not already running in this scheduler, in claim order.
    pub ready: Vec<TaskId>,
    pub claimed: Vec<TaskId>,
    pub unreachable: Vec<Unreachable>,
    /// Backlog tasks that are neither ready nor unreachable.
    pub waiting: Vec<TaskId>,
    pub invalid_records: usize,
    /// The store was changing under the pass; nothing was decided.
    pub contended: bool,
}

/// Summary of a whole [`Scheduler::run`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScheduleReport {
    pub completed: Vec<TaskId>,
    pub blocked: Vec<(TaskId, String)>,
    pub requeued: Vec<TaskId>,
    pub lost: Vec<TaskId>,
    pub reclaimed: Vec<TaskId>,
    pub unreachable: Vec<Unreachable>,
    /// Tasks still waiting when the loop gave up after the idle timeout.
    pub waiting: Vec<TaskId>,
    pub cancelled: bool,
    pub idle_timeout: bool,
}

impl ScheduleReport {
    fn record(&mut self, outcome: &SessionOutcome) {
        let id = outcome.task_id.clone();
        match outcome.disposition {
            Disposition::Completed => self.completed.push(id),
            Disposition::Blocked => self
                .blocked
                .push((id, outcome.reason.clone().unwrap_or_default())),
            Disposition::Requeued => self.requeued.push(id),
            Disposition::ClaimLost => self.lost.push(id),
        }
    }
}

pub struct Scheduler {
    tasks: Arc<dyn TaskRepository>,
    locks: Arc<LockManager>,
    workspaces: Arc<dyn WorkspaceProvider>,
    executor: Arc<dyn TaskExecutor>,
    settings: SchedulerSettings,
    events: Option<mpsc::Sender<SchedulerEvent>>,
    sessions: JoinSet<SessionOutcome>,
    active: HashMap<tokio::task::Id, TaskId>,
    /// Cancels every running session; a child of the token passed to `run`.
    session_cancel: CancellationToken,
    worker_prefix: String,
    spawned: u64,
    last_unreachable: Vec<TaskId>,
}

impl Scheduler {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        locks: Arc<LockManager>,
        workspaces: Arc<dyn WorkspaceProvider>,
        executor: Arc<dyn TaskExecutor>,
        settings: SchedulerSettings,
    ) -> Self {
        let worker_prefix = format!("worker-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        Self {
            tasks,
            locks,
            workspaces,
            executor,
            settings,
            events: None,
            sessions: JoinSet::new(),
            active: HashMap::new(),
            session_cancel: CancellationToken::new(),
            worker_prefix,
            spawned: 0,
            last_unreachable: Vec::new(),
        }
    }

    pub fn with_events(mut self, events: mpsc::Sender<SchedulerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn active_tasks(&self) -> HashSet<TaskId> {
        self.active.values().cloned().collect()
    }

    async fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }

    fn next_worker_id(&mut self) -> String {
        self.spawned += 1;
        format!("{}-{}", self.worker_prefix, self.spawned)
    }

    /// One scheduling pass.
    ///
    /// # Errors
    /// Validation errors (unknown or cyclic dependencies) abort the pass
    /// before anything is claimed. Contention is never an error.
    pub async fn tick(&mut self) -> Result<TickReport> {
        let mut report = TickReport::default();

        report.reclaimed = self.locks.reclaim_stale()?;
        for r in &report.reclaimed {
            self.emit(SchedulerEvent::ClaimReclaimed {
                task_id: r.task_id.clone(),
                worker_id: r.worker_id.clone(),
                idle: r.idle,
            })
            .await;
        }

        let snapshot = match self.tasks.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) if e.is_contention() => {
                rlog_debug!("skipping pass: {}", e);
                report.contended = true;
                return Ok(report);
            }
            Err(e) => return Err(e),
        };
        report.invalid_records = snapshot.invalid.len();
        let graph = match TaskGraph::build(&snapshot.tasks) {
            Ok(graph) => graph,
            Err(e) => {
                rlog_error!("scheduling pass aborted: {}", e);
                self.emit(SchedulerEvent::PassAborted {
                    error: e.to_string(),
                })
                .await;
                return Err(e);
            }
        };
        let states = snapshot.states();

        report.unreachable = graph.unreachable(&states);
        let unreachable_ids: Vec<TaskId> =
            report.unreachable.iter().map(|u| u.task.clone()).collect();
        if !report.unreachable.is_empty() && unreachable_ids != self.last_unreachable {
            for u in &report.unreachable {
                rlog_warn!("unreachable: {}", u);
            }
            self.emit(SchedulerEvent::TasksUnreachable {
                tasks: report.unreachable.clone(),
            })
            .await;
        }
        self.last_unreachable = unreachable_ids;

        let running = self.active_tasks();
        report.ready = graph
            .ready_set(&states)
            .into_iter()
            .filter(|id| !running.contains(id))
            .collect();

        rlog_trace!("ready set: {:?}", report.ready);
        let available = self.settings.pool_size.saturating_sub(self.active.len());
        for id in report.ready.clone() {
            if report.claimed.len() >= available {
                break;
            }
            let Some(task) = snapshot.get(&id).cloned() else {
                continue;
            };
            let worker = self.next_worker_id();
            let claim = match self.locks.claim(&id, &worker) {
                Ok(claim) => claim,
                Err(e) if e.is_contention() => {
                    rlog_debug!("skipping {}: {}", id, e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let session = WorkerSession::new(
                task.with_status(TaskStatus::InProgress),
                claim,
                Arc::clone(&self.tasks),
                Arc::clone(&self.locks),
                Arc::clone(&self.workspaces),
                Arc::clone(&self.executor),
                self.settings.session.clone(),
            );
            let handle = self
                .sessions
                .spawn(session.run(self.session_cancel.child_token()));
            self.active.insert(handle.id(), id.clone());
            rlog!("{} claimed {}", worker, id);
            self.emit(SchedulerEvent::TaskClaimed {
                task_id: id.clone(),
                worker_id: worker,
            })
            .await;
            report.claimed.push(id);
        }

        let claimed: HashSet<&TaskId> = report.claimed.iter().collect();
        let unreachable: HashSet<&TaskId> = report.unreachable.iter().map(|u| &u.task).collect();
        report.waiting = snapshot
            .with_status(TaskStatus::Backlog)
            .map(|t| &t.id)
            .filter(|id| !claimed.contains(id) && !unreachable.contains(id))
            .cloned()
            .collect();

        rlog_debug!(
            "tick: ready={} claimed={} active={} waiting={} unreachable={}",
            report.ready.len(),
            report.claimed.len(),
            self.active.len(),
            report.waiting.len(),
            report.unreachable.len()
        );
        Ok(report)
    }

    async fn on_finished(
        &mut self,
        joined: std::result::Result<(tokio::task::Id, SessionOutcome), tokio::task::JoinError>,
        report: &mut ScheduleReport,
    ) {
        match joined {
            Ok((task, outcome)) => {
                self.active.remove(&task);
                report.record(&outcome);
                let event = match outcome.disposition {
                    Disposition::Completed => SchedulerEvent::TaskCompleted {
                        task_id: outcome.task_id,
                    },
                    Disposition::Blocked => SchedulerEvent::TaskBlocked {
                        task_id: outcome.task_id,
                        reason: outcome.reason.unwrap_or_default(),
                    },
                    Disposition::Requeued => SchedulerEvent::TaskRequeued {
                        task_id: outcome.task_id,
                    },
                    Disposition::ClaimLost => return,
                };
                self.emit(event).await;
            }
            Err(e) => {
                // The claim stops heartbeating and is reclaimed once stale.
                if let Some(id) = self.active.remove(&e.id()) {
                    rlog_error!("session for {} panicked: {}", id, e);
                }
            }
        }
    }

    /// Run until every task is completed, blocked or unreachable, the idle
    /// timeout passes without progress, or `cancel` fires.
    ///
    /// On cancellation the running sessions are cancelled too and their
    /// tasks go back to the backlog.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<ScheduleReport> {
        self.session_cancel = cancel.child_token();
        let mut report = ScheduleReport::default();
        let mut last_progress = Instant::now();

        loop {
            while let Some(joined) = self.sessions.try_join_next_with_id() {
                self.on_finished(joined, &mut report).await;
                last_progress = Instant::now();
            }
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let tick = match self.tick().await {
                Ok(tick) => tick,
                Err(e) if e.is_validation() && !self.active.is_empty() => {
                    // running sessions may still finish; nothing new starts
                    TickReport::default()
                }
                Err(e) => {
                    self.drain(&mut report).await;
                    return Err(e);
                }
            };
            if !tick.claimed.is_empty() || !tick.reclaimed.is_empty() {
                last_progress = Instant::now();
            }
            report
                .reclaimed
                .extend(tick.reclaimed.iter().map(|r| r.task_id.clone()));
            if !tick.contended {
                report.unreachable = tick.unreachable.clone();
            }

            if self.active.is_empty() && !tick.contended {
                if tick.ready.is_empty() && tick.waiting.is_empty() {
                    rlog!("schedule exhausted");
                    break;
                }
                if last_progress.elapsed() >= self.settings.idle_shutdown {
                    rlog_warn!(
                        "no progress for {:?}, stopping with {} tasks waiting",
                        self.settings.idle_shutdown,
                        tick.waiting.len()
                    );
                    report.waiting = tick.waiting;
                    report.idle_timeout = true;
                    break;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {}
                Some(joined) = self.sessions.join_next_with_id(), if !self.sessions.is_empty() => {
                    self.on_finished(joined, &mut report).await;
                    last_progress = Instant::now();
                }
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }

        self.drain(&mut report).await;
        Ok(report)
    }

    /// Wait for every running session to finish on its own.
    ///
    /// Together with [`tick`](Self::tick) this lets callers step the
    /// schedule one pass at a time.
    pub async fn settle(&mut self) -> ScheduleReport {
        let mut report = ScheduleReport::default();
        while let Some(joined) = self.sessions.join_next_with_id().await {
            self.on_finished(joined, &mut report).await;
        }
        report
    }

    /// Cancel and wait for every running session.
    async fn drain(&mut self, report: &mut ScheduleReport) {
        if self.sessions.is_empty() {
            return;
        }
        rlog!("stopping {} running sessions", self.sessions.len());
        self.session_cancel.cancel();
        while let Some(joined) = self.sessions.join_next_with_id().await {
            self.on_finished(joined, report).await;
        }
    }
}
