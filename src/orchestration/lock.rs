//! Claim lifecycle on top of a [`ClaimStore`] and a [`TaskRepository`].
//!
//! A claim is taken in two steps: exclusive creation of the claim record,
//! then the `backlog -> in_progress` move. Either step can lose a race; the
//! loser backs out and reports contention. Reclamation is the inverse:
//! revoke the claim (one winner), then move the task back to `backlog`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use crate::core::{TaskId, TaskStatus};
use crate::state::{Claim, ClaimStore, TaskRepository};
use crate::{rlog_debug, rlog_warn, Result};

/// A claim taken away from a worker that stopped heartbeating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reclaimed {
    pub task_id: TaskId,
    pub worker_id: String,
    /// Time since the last heartbeat when the claim was revoked.
    pub idle: Duration,
}

/// What a forced reset did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResetSummary {
    pub revoked: Vec<TaskId>,
    pub requeued: Vec<TaskId>,
}

pub struct LockManager {
    tasks: Arc<dyn TaskRepository>,
    claims: Arc<dyn ClaimStore>,
    stale_threshold: Duration,
}

impl LockManager {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        claims: Arc<dyn ClaimStore>,
        stale_threshold: Duration,
    ) -> Self {
        Self {
            tasks,
            claims,
            stale_threshold,
        }
    }

    pub fn stale_threshold(&self) -> Duration {
        self.stale_threshold
    }

    pub fn claims(&self) -> &Arc<dyn ClaimStore> {
        &self.claims
    }

    /// Take exclusive ownership of a backlog task and move it to `in_progress`.
    ///
    /// Of N concurrent callers exactly one succeeds; the rest get an error
    /// for which [`crate::Error::is_contention`] holds.
    pub fn claim(&self, task: &TaskId, worker: &str) -> Result<Claim> {
        let claim = self.claims.try_acquire(task, worker)?;
        if let Err(e) = self
            .tasks
            .move_state(task, TaskStatus::Backlog, TaskStatus::InProgress)
        {
            rlog_debug!("claim of {} by {} backed out: {}", task, worker, e);
            if let Err(release_err) = self.claims.release(&claim) {
                rlog_warn!("failed to drop claim on {}: {}", task, release_err);
            }
            return Err(e);
        }
        rlog_debug!("{} claimed {}", worker, task);
        Ok(claim)
    }

    pub fn heartbeat(&self, claim: &Claim) -> Result<Claim> {
        self.claims.heartbeat(claim)
    }

    pub fn release(&self, claim: &Claim) -> Result<()> {
        self.claims.release(claim)
    }

    /// Revoke `claim` and return its task to `backlog`.
    ///
    /// Returns `false` when another observer got there first or the claim
    /// has been refreshed or replaced since it was read.
    pub fn reclaim(&self, claim: &Claim) -> Result<bool> {
        if !self.claims.revoke(claim)? {
            rlog_debug!("reclaim of {} lost to another observer", claim.task_id);
            return Ok(false);
        }
        match self
            .tasks
            .move_state(&claim.task_id, TaskStatus::InProgress, TaskStatus::Backlog)
        {
            Ok(()) => {}
            // the record never left backlog, or the worker finished after all
            Err(e) if e.is_contention() => {
                rlog_debug!("reclaimed {} without moving it: {}", claim.task_id, e);
            }
            Err(e) => return Err(e),
        }
        rlog_warn!(
            "reclaimed task {} from {} after {}s without a heartbeat (held {}s)",
            claim.task_id,
            claim.worker_id,
            claim.heartbeat_age(Utc::now()).as_secs(),
            claim.age(Utc::now()).as_secs()
        );
        Ok(true)
    }

    /// Reclaim every claim whose heartbeat is older than the stale threshold.
    pub fn reclaim_stale(&self) -> Result<Vec<Reclaimed>> {
        let now = Utc::now();
        let mut reclaimed = Vec::new();
        for claim in self.claims.list_stale(self.stale_threshold)? {
            if self.reclaim(&claim)? {
                reclaimed.push(Reclaimed {
                    idle: claim.heartbeat_age(now),
                    task_id: claim.task_id,
                    worker_id: claim.worker_id,
                });
            }
        }
        Ok(reclaimed)
    }

    /// Revoke all claims regardless of age and return every task that is
    /// not completed to `backlog`.
    pub fn force_reclaim_all(&self) -> Result<ResetSummary> {
        let mut summary = ResetSummary::default();
        for claim in self.claims.list_claims()? {
            if self.claims.revoke(&claim)? {
                rlog_warn!("reset revoked claim on {} held by {}", claim.task_id, claim.worker_id);
                summary.revoked.push(claim.task_id);
            }
        }

        for status in [TaskStatus::InProgress, TaskStatus::Blocked] {
            for task in self.tasks.list(status)?.tasks {
                match self.tasks.move_state(&task.id, status, TaskStatus::Backlog) {
                    Ok(()) => summary.requeued.push(task.id),
                    Err(e) if e.is_contention() => {}
                    Err(e) => return Err(e),
                }
            }
        }
        summary.requeued.sort();
        Ok(summary)
    }
}
