use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::{ensure_archivable, ArchiveSummary, Claim, ClaimStore, Listing, TaskRepository};
use crate::core::{Task, TaskId, TaskStatus};
use crate::{Error, Result};

#[derive(Default)]
struct Inner {
    tasks: BTreeMap<TaskId, Task>,
    claims: HashMap<TaskId, Claim>,
    archived: Vec<Task>,
}

/// Process-local store with the same transition and claim semantics as
/// [`super::FsStore`]. Used by tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tasks<I>(tasks: I) -> Self
    where
        I: IntoIterator<Item = Task>,
    {
        let store = Self::new();
        {
            let mut inner = store.lock();
            for task in tasks {
                inner.tasks.insert(task.id.clone(), task);
            }
        }
        store
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status_of(&self, id: &TaskId) -> Option<TaskStatus> {
        self.lock().tasks.get(id).map(|t| t.status)
    }

    /// Pretend the holder of `task` stopped heartbeating `by` ago.
    pub fn backdate_claim(&self, task: &TaskId, by: Duration) {
        let mut inner = self.lock();
        if let Some(claim) = inner.claims.get_mut(task) {
            let by = chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
            claim.last_heartbeat -= by;
            claim.acquired_at -= by;
        }
    }

    pub fn archived(&self) -> Vec<Task> {
        self.lock().archived.clone()
    }
}

impl TaskRepository for MemoryStore {
    fn list(&self, status: TaskStatus) -> Result<Listing> {
        let tasks = self
            .lock()
            .tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        Ok(Listing {
            tasks,
            invalid: Vec::new(),
        })
    }

    fn insert(&self, task: &Task) -> Result<()> {
        let mut inner = self.lock();
        if let Some(existing) = inner.tasks.get(&task.id) {
            return Err(Error::Validation(format!(
                "task {} already exists in {}",
                task.id, existing.status
            )));
        }
        let task = task.clone().with_status(TaskStatus::Backlog);
        inner.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    fn move_state(&self, id: &TaskId, from: TaskStatus, to: TaskStatus) -> Result<()> {
        if from == to {
            return Err(Error::Validation(format!("task {} is already in {}", id, from)));
        }
        let mut inner = self.lock();
        match inner.tasks.get_mut(id) {
            Some(task) if task.status == from => {
                task.status = to;
                if from == TaskStatus::Blocked {
                    task.blocked_reason = None;
                }
                Ok(())
            }
            _ => Err(Error::ConcurrentTransition {
                task: id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            }),
        }
    }

    fn record_reason(&self, id: &TaskId, reason: &str) -> Result<()> {
        let mut inner = self.lock();
        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        task.blocked_reason = Some(reason.to_string());
        Ok(())
    }

    fn clear_reason(&self, id: &TaskId) -> Result<()> {
        if let Some(task) = self.lock().tasks.get_mut(id) {
            task.blocked_reason = None;
        }
        Ok(())
    }

    fn archive(&self, _label: &str) -> Result<ArchiveSummary> {
        ensure_archivable(self)?;
        let mut inner = self.lock();
        let finished: Vec<TaskId> = inner
            .tasks
            .values()
            .filter(|t| t.status.is_terminal())
            .map(|t| t.id.clone())
            .collect();

        let mut summary = ArchiveSummary::default();
        for id in finished {
            if let Some(task) = inner.tasks.remove(&id) {
                match task.status {
                    TaskStatus::Completed => summary.completed.push(id),
                    _ => summary.blocked.push(id),
                }
                inner.archived.push(task);
            }
        }
        Ok(summary)
    }
}

impl ClaimStore for MemoryStore {
    fn try_acquire(&self, task: &TaskId, worker: &str) -> Result<Claim> {
        let mut inner = self.lock();
        if let Some(existing) = inner.claims.get(task) {
            return Err(Error::ClaimHeld {
                task: task.to_string(),
                holder: existing.worker_id.clone(),
            });
        }
        let claim = Claim::new(task.clone(), worker);
        inner.claims.insert(task.clone(), claim.clone());
        Ok(claim)
    }

    fn heartbeat(&self, claim: &Claim) -> Result<Claim> {
        let mut inner = self.lock();
        match inner.claims.get_mut(&claim.task_id) {
            Some(current) if current.same_holder(claim) => {
                current.last_heartbeat = chrono::Utc::now();
                Ok(current.clone())
            }
            _ => Err(Error::ClaimLost {
                task: claim.task_id.to_string(),
            }),
        }
    }

    fn release(&self, claim: &Claim) -> Result<()> {
        let mut inner = self.lock();
        match inner.claims.get(&claim.task_id) {
            None => Ok(()),
            Some(current) if current.same_holder(claim) => {
                inner.claims.remove(&claim.task_id);
                Ok(())
            }
            Some(_) => Err(Error::ClaimLost {
                task: claim.task_id.to_string(),
            }),
        }
    }

    fn revoke(&self, claim: &Claim) -> Result<bool> {
        let mut inner = self.lock();
        match inner.claims.get(&claim.task_id) {
            Some(current) if current.same_holder(claim) => {
                inner.claims.remove(&claim.task_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn get(&self, task: &TaskId) -> Result<Option<Claim>> {
        Ok(self.lock().claims.get(task).cloned())
    }

    fn list_claims(&self) -> Result<Vec<Claim>> {
        let mut claims: Vec<Claim> = self.lock().claims.values().cloned().collect();
        claims.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Ok(claims)
    }
}
