use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{rlog_debug, Error, Result};

/// Name of the state directory created inside the project root.
pub const STATE_DIR: &str = ".relay";
pub const CONFIG_FILE: &str = "relay.toml";

/// Orchestrator settings, read from `.relay/relay.toml`.
///
/// Every field has a default so a missing or partial file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pool_size: usize,
    pub task_budget_secs: u64,
    pub poll_interval_ms: u64,
    pub idle_shutdown_secs: u64,
    pub stale_threshold_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub branch_prefix: String,
    pub worktree_dir: Option<String>,
    /// Task-executor command line. The rendered task prompt is appended as the last argument.
    pub executor: String,
    /// Shared verification suite, run against the baseline after every integration.
    pub verify: Vec<String>,
    pub check_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool_size: 4,
            task_budget_secs: 1800,
            poll_interval_ms: 2000,
            idle_shutdown_secs: 300,
            stale_threshold_secs: 600,
            heartbeat_interval_secs: 30,
            branch_prefix: "relay/".to_string(),
            worktree_dir: None,
            executor: "claude -p".to_string(),
            verify: Vec::new(),
            check_timeout_secs: 600,
        }
    }
}

impl Config {
    pub fn state_dir(root: &Path) -> PathBuf {
        root.join(STATE_DIR)
    }

    /// Create the state directory, ignored by git so orchestrator state never
    /// lands in the baseline.
    pub fn ensure_state_dir(root: &Path) -> Result<PathBuf> {
        let dir = Self::state_dir(root);
        fs::create_dir_all(&dir)?;
        let ignore = dir.join(".gitignore");
        if !ignore.exists() {
            fs::write(&ignore, "*\n")?;
        }
        Ok(dir)
    }

    pub fn merge_report_path(root: &Path) -> PathBuf {
        Self::state_dir(root).join("merge-report.json")
    }

    pub fn config_path(root: &Path) -> PathBuf {
        Self::state_dir(root).join(CONFIG_FILE)
    }

    pub fn tasks_dir(root: &Path) -> PathBuf {
        Self::state_dir(root).join("tasks")
    }

    pub fn archive_dir(root: &Path) -> PathBuf {
        Self::state_dir(root).join("archive")
    }

    pub fn worktrees_dir(&self, root: &Path) -> PathBuf {
        match &self.worktree_dir {
            Some(dir) => {
                let expanded = expand_tilde(dir);
                if expanded.is_absolute() {
                    expanded
                } else {
                    root.join(expanded)
                }
            }
            None => Self::state_dir(root).join("worktrees"),
        }
    }

    pub fn task_budget(&self) -> Duration {
        Duration::from_secs(self.task_budget_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn idle_shutdown(&self) -> Duration {
        Duration::from_secs(self.idle_shutdown_secs)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }

    pub fn load(root: &Path) -> Result<Self> {
        let path = Self::config_path(root);
        rlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            rlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        config.validate()?;
        rlog_debug!(
            "Config loaded: pool_size={} budget={}s stale={}s prefix={}",
            config.pool_size,
            config.task_budget_secs,
            config.stale_threshold_secs,
            config.branch_prefix
        );
        Ok(config)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let state_dir = Self::state_dir(root);
        if !state_dir.exists() {
            fs::create_dir_all(&state_dir)?;
        }
        let path = Self::config_path(root);
        fs::write(&path, toml::to_string_pretty(self)?)?;
        rlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(Error::Validation("pool_size must be at least 1".to_string()));
        }
        if self.poll_interval_ms == 0 || self.heartbeat_interval_secs == 0 {
            return Err(Error::Validation(
                "poll_interval_ms and heartbeat_interval_secs must be non-zero".to_string(),
            ));
        }
        if self.heartbeat_interval_secs >= self.stale_threshold_secs {
            return Err(Error::Validation(format!(
                "heartbeat_interval_secs ({}) must be below stale_threshold_secs ({})",
                self.heartbeat_interval_secs, self.stale_threshold_secs
            )));
        }
        if self.executor.split_whitespace().next().is_none() {
            return Err(Error::Validation("executor command is empty".to_string()));
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
