//! Durable task and claim state.
//!
//! The scheduler, lock manager and merge coordinator never touch storage
//! directly; they go through [`TaskRepository`] and [`ClaimStore`]. The
//! filesystem implementation ([`FsStore`]) is what runs in production; the
//! in-memory one ([`MemoryStore`]) backs tests.

mod fs;
mod memory;

pub use fs::FsStore;
pub use memory::MemoryStore;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{Task, TaskId, TaskStatus};
use crate::{Error, Result};

/// A record that exists in a collection but could not be parsed.
///
/// These are excluded from scheduling and always surfaced by `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidRecord {
    pub status: TaskStatus,
    pub path: PathBuf,
    pub reason: String,
}

/// Contents of one collection.
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub tasks: Vec<Task>,
    pub invalid: Vec<InvalidRecord>,
}

/// Contents of all four collections at one point in time.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub tasks: Vec<Task>,
    pub invalid: Vec<InvalidRecord>,
}

impl Snapshot {
    pub fn states(&self) -> HashMap<TaskId, TaskStatus> {
        self.tasks
            .iter()
            .map(|t| (t.id.clone(), t.status))
            .collect()
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    pub fn with_status(&self, status: TaskStatus) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(move |t| t.status == status)
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.with_status(status).count()
    }
}

/// Result of moving finished records out of the live collections.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ArchiveSummary {
    /// Where the records went, for stores that have a location.
    pub location: Option<PathBuf>,
    pub completed: Vec<TaskId>,
    pub blocked: Vec<TaskId>,
}

impl ArchiveSummary {
    pub fn total(&self) -> usize {
        self.completed.len() + self.blocked.len()
    }
}

const SNAPSHOT_ATTEMPTS: usize = 5;

fn read_collections<R: TaskRepository + ?Sized>(repo: &R) -> Result<Snapshot> {
    let mut snapshot = Snapshot::default();
    for status in TaskStatus::ALL {
        let listing = repo.list(status)?;
        snapshot.tasks.extend(listing.tasks);
        snapshot.invalid.extend(listing.invalid);
    }
    Ok(snapshot)
}

/// Live tasks that depend on a completed or blocked record, as
/// `(dependent, dependency)` pairs.
///
/// Archiving is refused while any exist, since the dependents would be
/// left pointing at ids the graph no longer knows.
pub fn finished_dependencies(snapshot: &Snapshot) -> Vec<(TaskId, TaskId)> {
    let states = snapshot.states();
    let mut pairs = Vec::new();
    for task in snapshot.tasks.iter().filter(|t| !t.status.is_terminal()) {
        for dep in &task.dependencies {
            if states.get(dep).is_some_and(|s| s.is_terminal()) {
                pairs.push((task.id.clone(), dep.clone()));
            }
        }
    }
    pairs
}

/// Fails unless every completed and blocked record can leave the live
/// collections without orphaning a dependent.
pub fn ensure_archivable<R: TaskRepository + ?Sized>(repo: &R) -> Result<()> {
    let pairs = finished_dependencies(&repo.snapshot()?);
    if pairs.is_empty() {
        return Ok(());
    }
    let listed: Vec<String> = pairs
        .iter()
        .map(|(task, dep)| format!("{} needs {}", task, dep))
        .collect();
    Err(Error::Validation(format!(
        "cannot archive while unfinished tasks depend on finished ones: {}",
        listed.join(", ")
    )))
}

/// The four task collections.
pub trait TaskRepository: Send + Sync {
    /// Parsed records of one collection, sorted by id.
    fn list(&self, status: TaskStatus) -> Result<Listing>;

    fn list_backlog(&self) -> Result<Listing> {
        self.list(TaskStatus::Backlog)
    }

    /// All four collections, read until two consecutive passes agree.
    ///
    /// A record moved while the collections are listed shows up twice or
    /// not at all. Such a pass is discarded and the read repeated.
    ///
    /// # Errors
    /// [`crate::Error::UnsettledSnapshot`] if the collections never hold
    /// still, which callers treat as contention.
    fn snapshot(&self) -> Result<Snapshot> {
        let mut previous: Option<HashMap<TaskId, TaskStatus>> = None;
        for _ in 0..SNAPSHOT_ATTEMPTS {
            let pass = read_collections(self)?;
            let states = pass.states();
            if states.len() == pass.tasks.len() && previous.as_ref() == Some(&states) {
                return Ok(pass);
            }
            previous = Some(states);
        }
        Err(Error::UnsettledSnapshot {
            attempts: SNAPSHOT_ATTEMPTS,
        })
    }

    /// Add a new task to the backlog. Fails if the id exists in any collection.
    fn insert(&self, task: &Task) -> Result<()>;

    /// Atomically move a record between collections.
    ///
    /// Fails with [`crate::Error::ConcurrentTransition`] when the record is no
    /// longer in `from`; a record is never absent from every collection.
    fn move_state(&self, id: &TaskId, from: TaskStatus, to: TaskStatus) -> Result<()>;

    /// Attach a failure reason to a blocked task.
    fn record_reason(&self, id: &TaskId, reason: &str) -> Result<()>;

    fn clear_reason(&self, id: &TaskId) -> Result<()>;

    /// Move every completed and blocked record into a durable archive.
    ///
    /// Refused (see [`ensure_archivable`]) while a backlog or in-progress
    /// task still depends on one of those records.
    fn archive(&self, label: &str) -> Result<ArchiveSummary>;
}

/// Exclusive, heartbeated ownership of one task by one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub task_id: TaskId,
    pub worker_id: String,
    pub acquired_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl Claim {
    pub fn new(task_id: TaskId, worker_id: &str) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            worker_id: worker_id.to_string(),
            acquired_at: now,
            last_heartbeat: now,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.acquired_at).to_std().unwrap_or_default()
    }

    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_heartbeat).to_std().unwrap_or_default()
    }

    /// Live means `now - last_heartbeat < threshold`.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.heartbeat_age(now) >= threshold
    }

    /// Same claim instance (not just the same task).
    pub fn same_holder(&self, other: &Claim) -> bool {
        self.task_id == other.task_id
            && self.worker_id == other.worker_id
            && self.acquired_at == other.acquired_at
    }
}

/// Storage for claim records.
///
/// Implementations must make [`try_acquire`](ClaimStore::try_acquire) and
/// [`revoke`](ClaimStore::revoke) atomic: of N racing callers exactly one
/// succeeds.
pub trait ClaimStore: Send + Sync {
    /// Create a claim, failing with [`crate::Error::ClaimHeld`] if one exists.
    fn try_acquire(&self, task: &TaskId, worker: &str) -> Result<Claim>;

    /// Refresh `last_heartbeat`. Fails with [`crate::Error::ClaimLost`] if the
    /// claim is gone or now belongs to someone else.
    fn heartbeat(&self, claim: &Claim) -> Result<Claim>;

    /// Delete the caller's own claim. Releasing a claim that no longer
    /// exists is not an error.
    fn release(&self, claim: &Claim) -> Result<()>;

    /// Delete `claim` on behalf of someone other than its holder.
    ///
    /// Returns `Ok(true)` only for the single caller that removed it.
    /// Returns `Ok(false)` if it was already gone or has been replaced.
    fn revoke(&self, claim: &Claim) -> Result<bool>;

    fn get(&self, task: &TaskId) -> Result<Option<Claim>>;

    fn list_claims(&self) -> Result<Vec<Claim>>;

    fn is_stale(&self, claim: &Claim, threshold: Duration) -> bool {
        claim.is_stale(Utc::now(), threshold)
    }

    /// Claims whose heartbeat is at least `threshold` old.
    fn list_stale(&self, threshold: Duration) -> Result<Vec<Claim>> {
        let now = Utc::now();
        Ok(self
            .list_claims()?
            .into_iter()
            .filter(|c| c.is_stale(now, threshold))
            .collect())
    }
}
