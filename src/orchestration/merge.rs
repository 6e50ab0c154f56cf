//! Integrates completed workspaces into the shared baseline, one at a time,
//! dependencies first, verifying after each step.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::workspace::{Integration, WorkspaceProvider};
use crate::config::Config;
use crate::core::{Task, TaskGraph, TaskId, TaskStatus};
use crate::state::TaskRepository;
use crate::util::{blocking, run_checks};
use crate::{rlog, rlog_error, rlog_warn, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Conflicting hunks were taken from the task being merged.
    FavoredIncoming,
    /// The task was not integrated; its workspace is kept for review.
    Skipped,
}

/// A conflict recorded for human review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictRecord {
    pub task_id: TaskId,
    pub paths: Vec<String>,
    pub resolution: Resolution,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergedTask {
    pub task_id: TaskId,
    pub integration: Integration,
}

/// The integration after which the shared verification suite failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyFailure {
    pub task_id: TaskId,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Every candidate, in integration order.
    pub order: Vec<TaskId>,
    pub merged: Vec<MergedTask>,
    pub conflicts: Vec<ConflictRecord>,
    pub skipped: Vec<TaskId>,
    pub failure: Option<VerifyFailure>,
    /// Candidates left unmerged because verification failed.
    pub remaining: Vec<TaskId>,
    pub discarded: Vec<TaskId>,
}

impl MergeReport {
    fn new(order: Vec<TaskId>) -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            order,
            merged: Vec::new(),
            conflicts: Vec::new(),
            skipped: Vec::new(),
            failure: None,
            remaining: Vec::new(),
            discarded: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    pub fn merged_ids(&self) -> Vec<&TaskId> {
        self.merged.iter().map(|m| &m.task_id).collect()
    }
}

pub struct MergeCoordinator {
    tasks: Arc<dyn TaskRepository>,
    workspaces: Arc<dyn WorkspaceProvider>,
    verify: Vec<String>,
    check_timeout: Duration,
    report_path: Option<PathBuf>,
}

impl MergeCoordinator {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        workspaces: Arc<dyn WorkspaceProvider>,
        verify: Vec<String>,
        check_timeout: Duration,
    ) -> Self {
        Self {
            tasks,
            workspaces,
            verify,
            check_timeout,
            report_path: None,
        }
    }

    pub fn from_config(
        config: &Config,
        tasks: Arc<dyn TaskRepository>,
        workspaces: Arc<dyn WorkspaceProvider>,
    ) -> Self {
        Self::new(tasks, workspaces, config.verify.clone(), config.check_timeout())
    }

    /// Also write every report as JSON to `path`.
    pub fn with_report_path(mut self, path: PathBuf) -> Self {
        self.report_path = Some(path);
        self
    }

    /// Completed tasks whose workspace still exists, dependencies first.
    pub fn pending(&self) -> Result<Vec<TaskId>> {
        let completed: Vec<Task> = self.tasks.list(TaskStatus::Completed)?.tasks;
        let known: HashSet<TaskId> = completed.iter().map(|t| t.id.clone()).collect();

        // Dependencies outside the completed set were integrated or archived earlier.
        let scoped: Vec<Task> = completed
            .into_iter()
            .map(|mut t| {
                t.dependencies.retain(|d| known.contains(d));
                t
            })
            .collect();
        let graph = TaskGraph::build(&scoped)?;

        let candidates: HashSet<TaskId> = known
            .into_iter()
            .filter(|id| self.workspaces.exists(id))
            .collect();
        Ok(graph.order_subset(&candidates))
    }

    pub async fn run(&self) -> Result<MergeReport> {
        {
            let workspaces = Arc::clone(&self.workspaces);
            blocking(move || workspaces.check_baseline()).await?;
        }

        let order = self.pending()?;
        let mut report = MergeReport::new(order.clone());
        rlog!("merging {} completed tasks", order.len());

        for (idx, id) in order.iter().enumerate() {
            let integration = {
                let workspaces = Arc::clone(&self.workspaces);
                let id = id.clone();
                blocking(move || workspaces.integrate(&id)).await
            };
            let integration = match integration {
                Ok(integration) => integration,
                Err(e) => {
                    rlog_error!("integrating {} failed: {}", id, e);
                    report.failure = Some(VerifyFailure {
                        task_id: id.clone(),
                        reason: format!("integration failed: {}", e),
                    });
                    report.remaining = order[idx + 1..].to_vec();
                    break;
                }
            };

            if !integration.is_applied() {
                report.conflicts.push(ConflictRecord {
                    task_id: id.clone(),
                    paths: integration.conflicts().to_vec(),
                    resolution: Resolution::Skipped,
                });
                report.skipped.push(id.clone());
                continue;
            }
            if !integration.conflicts().is_empty() {
                report.conflicts.push(ConflictRecord {
                    task_id: id.clone(),
                    paths: integration.conflicts().to_vec(),
                    resolution: Resolution::FavoredIncoming,
                });
            }
            report.merged.push(MergedTask {
                task_id: id.clone(),
                integration,
            });

            if let Some(reason) = self.verify_baseline().await {
                rlog_error!("verification failed after merging {}: {}", id, reason);
                report.failure = Some(VerifyFailure {
                    task_id: id.clone(),
                    reason,
                });
                report.remaining = order[idx + 1..].to_vec();
                break;
            }
        }

        if report.is_success() {
            for merged in &report.merged {
                let workspaces = Arc::clone(&self.workspaces);
                let id = merged.task_id.clone();
                match blocking(move || workspaces.discard(&id)).await {
                    Ok(()) => report.discarded.push(merged.task_id.clone()),
                    Err(e) => rlog_warn!("could not discard workspace of {}: {}", merged.task_id, e),
                }
            }
        }

        report.finished_at = Utc::now();
        if let Some(path) = &self.report_path {
            std::fs::write(path, serde_json::to_string_pretty(&report)?)?;
        }
        rlog!(
            "merge finished: {} merged, {} conflicts, {} skipped, failure={}",
            report.merged.len(),
            report.conflicts.len(),
            report.skipped.len(),
            report.failure.as_ref().map_or("none", |f| f.task_id.as_str())
        );
        Ok(report)
    }

    /// Run the shared suite against the baseline; the failure reason, if any.
    async fn verify_baseline(&self) -> Option<String> {
        if self.verify.is_empty() {
            return None;
        }
        let baseline = self.workspaces.baseline().to_path_buf();
        match run_checks(&self.verify, &baseline, self.check_timeout).await {
            Ok(None) => None,
            Ok(Some(failure)) => Some(failure.summary()),
            Err(Error::Timeout(limit)) => Some(format!("verification timed out after {:?}", limit)),
            Err(e) => Some(format!("verification could not run: {}", e)),
        }
    }
}
