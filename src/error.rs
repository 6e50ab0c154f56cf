use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Malformed task record {}:{line}: {reason}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("Task {task} depends on unknown task {missing}")]
    UnknownDependency { task: String, missing: String },

    #[error("Cyclic dependency: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Task {task} already moved out of {from} (wanted {to})")]
    ConcurrentTransition {
        task: String,
        from: String,
        to: String,
    },

    #[error("Task collections kept changing across {attempts} reads")]
    UnsettledSnapshot { attempts: usize },

    #[error("Task {task} is already claimed by {holder}")]
    ClaimHeld { task: String, holder: String },

    #[error("Claim on task {task} was lost")]
    ClaimLost { task: String },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Executor error: {0}")]
    Executor(String),

    #[error("Executor binary not found: {0}")]
    ExecutorNotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl Error {
    /// Expected races between schedulers and workers. Callers skip and retry on the next tick.
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            Error::ClaimHeld { .. }
                | Error::ConcurrentTransition { .. }
                | Error::ClaimLost { .. }
                | Error::UnsettledSnapshot { .. }
        )
    }

    /// Errors that abort a whole scheduling pass.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::UnknownDependency { .. } | Error::CyclicDependency { .. } | Error::Parse { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
