//! Read-only view of the task store for humans.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::{TaskGraph, TaskId, TaskStatus, Unreachable};
use crate::state::{ClaimStore, InvalidRecord, TaskRepository};
use crate::Result;

#[derive(Debug, Clone, Serialize)]
pub struct ActiveClaim {
    pub task_id: TaskId,
    pub worker_id: String,
    pub age_secs: u64,
    pub heartbeat_age_secs: u64,
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockedTask {
    pub task_id: TaskId,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub counts: BTreeMap<TaskStatus, usize>,
    pub active: Vec<ActiveClaim>,
    pub blocked: Vec<BlockedTask>,
    pub unreachable: Vec<Unreachable>,
    /// In-progress tasks nobody holds a claim on; `reset` returns them to the backlog.
    pub orphaned: Vec<TaskId>,
    pub invalid: Vec<InvalidRecord>,
    /// Why the dependency graph could not be built, if it could not.
    pub graph_error: Option<String>,
    /// Backlog tasks that can still run.
    pub remaining: usize,
}

impl StatusReport {
    pub fn collect(
        tasks: &dyn TaskRepository,
        claims: &dyn ClaimStore,
        stale_threshold: Duration,
    ) -> Result<Self> {
        let now = Utc::now();
        let snapshot = tasks.snapshot()?;

        let counts = TaskStatus::ALL
            .iter()
            .map(|s| (*s, snapshot.count(*s)))
            .collect();

        let mut active: Vec<ActiveClaim> = claims
            .list_claims()?
            .into_iter()
            .map(|c| ActiveClaim {
                age_secs: c.age(now).as_secs(),
                heartbeat_age_secs: c.heartbeat_age(now).as_secs(),
                stale: c.is_stale(now, stale_threshold),
                task_id: c.task_id,
                worker_id: c.worker_id,
            })
            .collect();
        active.sort_by(|a, b| a.task_id.cmp(&b.task_id));

        let claimed: HashSet<&TaskId> = active.iter().map(|c| &c.task_id).collect();
        let orphaned = snapshot
            .with_status(TaskStatus::InProgress)
            .filter(|t| !claimed.contains(&t.id))
            .map(|t| t.id.clone())
            .collect();

        let blocked = snapshot
            .with_status(TaskStatus::Blocked)
            .map(|t| BlockedTask {
                task_id: t.id.clone(),
                reason: t.blocked_reason.clone(),
            })
            .collect();

        let (unreachable, graph_error) = match TaskGraph::build(&snapshot.tasks) {
            Ok(graph) => (graph.unreachable(&snapshot.states()), None),
            Err(e) => (Vec::new(), Some(e.to_string())),
        };
        let remaining = snapshot
            .count(TaskStatus::Backlog)
            .saturating_sub(unreachable.len());

        Ok(Self {
            generated_at: now,
            counts,
            active,
            blocked,
            unreachable,
            orphaned,
            invalid: snapshot.invalid,
            graph_error,
            remaining,
        })
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    /// Whether anything needs a human.
    pub fn needs_attention(&self) -> bool {
        !self.blocked.is_empty()
            || !self.unreachable.is_empty()
            || !self.invalid.is_empty()
            || !self.orphaned.is_empty()
            || self.graph_error.is_some()
            || self.active.iter().any(|c| c.stale)
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: Vec<String> = TaskStatus::ALL
            .iter()
            .map(|s| format!("{} {}", s, self.count(*s)))
            .collect();
        writeln!(f, "Tasks: {}", counts.join(", "))?;
        writeln!(f, "Remaining work: {} task(s)", self.remaining)?;

        if let Some(error) = &self.graph_error {
            writeln!(f, "\nDependency graph is invalid: {}", error)?;
        }

        if !self.active.is_empty() {
            writeln!(f, "\nActive claims:")?;
            for claim in &self.active {
                write!(
                    f,
                    "  {:<24} {:<20} age {}s, heartbeat {}s ago",
                    claim.task_id.as_str(),
                    claim.worker_id,
                    claim.age_secs,
                    claim.heartbeat_age_secs
                )?;
                if claim.stale {
                    write!(f, " (stale)")?;
                }
                writeln!(f)?;
            }
        }

        if !self.blocked.is_empty() {
            writeln!(f, "\nBlocked:")?;
            for task in &self.blocked {
                let reason = task.reason.as_deref().unwrap_or("no reason recorded");
                writeln!(f, "  {}: {}", task.task_id, reason)?;
            }
        }

        if !self.unreachable.is_empty() {
            writeln!(f, "\nUnreachable:")?;
            for entry in &self.unreachable {
                writeln!(f, "  {}", entry)?;
            }
        }

        if !self.orphaned.is_empty() {
            writeln!(f, "\nIn progress without a claim (run `relay reset`):")?;
            for id in &self.orphaned {
                writeln!(f, "  {}", id)?;
            }
        }

        if !self.invalid.is_empty() {
            writeln!(f, "\nInvalid records:")?;
            for record in &self.invalid {
                writeln!(f, "  {}", record.reason)?;
            }
        }
        Ok(())
    }
}
