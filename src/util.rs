//! Shared async helpers: running blocking work off the runtime and running
//! shell checks with a time limit.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::task::spawn_blocking;
use tokio::time::timeout;

use crate::{rlog_debug, rlog_trace, Error, Result};

/// Lines of check output kept for failure reasons.
const OUTPUT_TAIL_LINES: usize = 20;

pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

/// Outcome of one verification command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutput {
    pub command: String,
    pub success: bool,
    pub code: Option<i32>,
    /// Last lines of combined stdout and stderr.
    pub output: String,
}

impl CheckOutput {
    /// One-line description suitable for a blocked reason.
    pub fn summary(&self) -> String {
        let status = match self.code {
            Some(code) => format!("exited with {}", code),
            None => "was killed".to_string(),
        };
        if self.output.is_empty() {
            format!("`{}` {}", self.command, status)
        } else {
            format!("`{}` {}: {}", self.command, status, self.output)
        }
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

/// Run `command` through `sh -c` in `cwd`, killing it after `limit`.
pub async fn run_check(command: &str, cwd: &Path, limit: Duration) -> Result<CheckOutput> {
    rlog_debug!("run_check cwd={} cmd={}", cwd.display(), command);
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let output = match timeout(limit, child.wait_with_output()).await {
        Ok(output) => output?,
        Err(_) => return Err(Error::Timeout(limit)),
    };

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    rlog_trace!("{} exited with {:?}:\n{}", command, output.status.code(), combined);

    Ok(CheckOutput {
        command: command.to_string(),
        success: output.status.success(),
        code: output.status.code(),
        output: tail(&combined, OUTPUT_TAIL_LINES),
    })
}

/// Run commands in order and stop at the first failure, which is returned.
pub async fn run_checks(
    commands: &[String],
    cwd: &Path,
    limit: Duration,
) -> Result<Option<CheckOutput>> {
    for command in commands {
        let output = run_check(command, cwd, limit).await?;
        if !output.success {
            return Ok(Some(output));
        }
    }
    Ok(None)
}
