use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::core::TaskId;
use crate::Result;

/// What integrating one workspace did to the shared baseline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Integration {
    /// The baseline already contains every change.
    UpToDate,
    FastForward { commit: String },
    /// A merge commit was created; `conflicts` lists paths resolved in
    /// favor of the incoming task.
    Merged {
        commit: String,
        conflicts: Vec<String>,
    },
    /// The conflicts could not be resolved automatically; the baseline is unchanged.
    Conflicted { paths: Vec<String> },
}

impl Integration {
    pub fn is_applied(&self) -> bool {
        !matches!(self, Integration::Conflicted { .. })
    }

    pub fn conflicts(&self) -> &[String] {
        match self {
            Integration::Merged { conflicts, .. } => conflicts,
            Integration::Conflicted { paths } => paths,
            _ => &[],
        }
    }
}

/// Isolated per-task working copies of one shared baseline.
///
/// Calls may block; async callers go through [`crate::util::blocking`].
pub trait WorkspaceProvider: Send + Sync {
    /// Working directory of the shared baseline.
    fn baseline(&self) -> &Path;

    fn path(&self, task: &TaskId) -> PathBuf;

    fn exists(&self, task: &TaskId) -> bool {
        self.path(task).exists()
    }

    /// Create a fresh workspace from the current baseline, replacing any
    /// leftover from an earlier attempt at the same task.
    fn create(&self, task: &TaskId) -> Result<PathBuf>;

    /// Commit pending changes. Returns whether the workspace now holds at
    /// least one change the baseline does not have.
    fn commit(&self, task: &TaskId, message: &str) -> Result<bool>;

    /// Fail unless the baseline is in a state that can be merged into.
    fn check_baseline(&self) -> Result<()>;

    fn integrate(&self, task: &TaskId) -> Result<Integration>;

    /// Remove the workspace and everything that ties it to the baseline.
    fn discard(&self, task: &TaskId) -> Result<()>;
}
