//! The task-executor seam.
//!
//! The orchestrator never does task work itself. A [`TaskExecutor`] gets the
//! task and its isolated workspace and reports pass or fail. The session
//! wraps every call in the task's time budget and hands it a cancellation
//! token; executors should return promptly once the token fires.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::core::Task;
use crate::{rlog_debug, Error, Result};

const REASON_TAIL_CHARS: usize = 2000;

/// Verdict of one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Passed,
    Failed { reason: String },
}

impl ExecutionOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        ExecutionOutcome::Failed {
            reason: reason.into(),
        }
    }

    pub fn is_passed(&self) -> bool {
        matches!(self, ExecutionOutcome::Passed)
    }
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Perform `task` inside `workspace`.
    ///
    /// `Err` means the executor itself broke (could not start, crashed, was
    /// cancelled); `Ok(Failed)` means it ran and gave up on the task.
    async fn execute(
        &self,
        task: &Task,
        workspace: &Path,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome>;
}

/// Instructions handed to the executor for one task.
pub fn render_prompt(task: &Task) -> String {
    let mut prompt = format!("Task {}: {}\n", task.id, task.title);
    if !task.description.is_empty() {
        prompt.push('\n');
        prompt.push_str(&task.description);
        prompt.push('\n');
    }
    if !task.acceptance_criteria.is_empty() {
        prompt.push_str(&format!(
            "\nAcceptance criteria ({} of {} met):\n",
            task.criteria_done(),
            task.acceptance_criteria.len()
        ));
        for criterion in &task.acceptance_criteria {
            let mark = if criterion.done { "x" } else { " " };
            prompt.push_str(&format!("- [{}] {}\n", mark, criterion.text));
        }
    }
    if !task.verification.is_empty() {
        prompt.push_str("\nThese commands must succeed when you are done:\n");
        for command in &task.verification {
            prompt.push_str(&format!("- `{}`\n", command));
        }
    }
    prompt.push_str(
        "\nWork only inside the current directory and commit your changes when finished.\n",
    );
    prompt
}

fn tail_chars(text: &str, max: usize) -> &str {
    let text = text.trim();
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// Runs an external command with the rendered prompt as its last argument.
///
/// Exit status 0 passes the task; anything else fails it with the tail of
/// the command's output as the reason.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandExecutor {
    /// Parse a command line such as `claude -p` and resolve the program on `PATH`.
    pub fn from_command_line(command: &str) -> Result<Self> {
        let mut parts = command.split_whitespace();
        let name = parts
            .next()
            .ok_or_else(|| Error::Validation("executor command is empty".to_string()))?;
        let program =
            which::which(name).map_err(|_| Error::ExecutorNotFound(name.to_string()))?;
        Ok(Self {
            program,
            args: parts.map(String::from).collect(),
        })
    }

    pub fn with_program(program: PathBuf, args: Vec<String>) -> Self {
        Self { program, args }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    async fn execute(
        &self,
        task: &Task,
        workspace: &Path,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome> {
        rlog_debug!(
            "executing {} with {} in {}",
            task.id,
            self.program.display(),
            workspace.display()
        );
        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(render_prompt(task))
            .current_dir(workspace)
            .env("RELAY_TASK_ID", task.id.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Executor(format!("failed to start {}: {}", self.program.display(), e)))?;

        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            _ = cancel.cancelled() => {
                return Err(Error::Executor(format!("execution of {} cancelled", task.id)));
            }
        };

        if output.status.success() {
            return Ok(ExecutionOutcome::Passed);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = if stderr.trim().is_empty() { stdout } else { stderr };
        let status = output
            .status
            .code()
            .map_or_else(|| "was killed".to_string(), |c| format!("exited with {}", c));
        Ok(ExecutionOutcome::failed(format!(
            "executor {}: {}",
            status,
            tail_chars(&detail, REASON_TAIL_CHARS)
        )))
    }
}
