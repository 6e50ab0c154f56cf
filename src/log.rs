//! File logger for the orchestrator.
//!
//! Events are appended to `<state dir>/relay.log`, one line each:
//!
//! ```text
//! [12:03:44.120] [WARN] reclaimed task api-schema from worker-1f3a9c02 after 612s without a heartbeat (held 700s)
//! ```
//!
//! What each level carries:
//! - ERROR: a pass or merge that stopped, a session that panicked
//! - WARN: reclaimed claims, unreachable tasks, idle shutdown
//! - INFO: claims, task outcomes, merges, archives
//! - DEBUG: every state move and claim-file operation, skipped contention
//! - TRACE: ready sets and raw check output
//!
//! `--debug` or `RELAY_DEBUG=1` raises the level to DEBUG; `RELAY_DEBUG=trace`
//! goes one further.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

use chrono::{DateTime, Local};

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

pub const LOG_FILE: &str = "relay.log";
pub const DEBUG_ENV: &str = "RELAY_DEBUG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    /// Level requested by a `RELAY_DEBUG` value, if it asks for more than INFO.
    fn from_env_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "debug" => Some(LogLevel::Debug),
            "2" | "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }
}

/// Start logging into `state_dir`, truncating the log of the previous run.
///
/// Only the first call picks the file; later calls just adjust the level.
pub fn init_with_debug(state_dir: &Path, debug: bool) {
    let from_env = std::env::var(DEBUG_ENV)
        .ok()
        .and_then(|v| LogLevel::from_env_value(&v));
    let from_flag = debug.then_some(LogLevel::Debug);
    set_level(from_env.max(from_flag).unwrap_or(LogLevel::Info));

    if std::fs::create_dir_all(state_dir).is_ok() {
        let path = state_dir.join(LOG_FILE);
        if LOG_PATH.get().is_none() {
            let _ = std::fs::write(&path, "");
        }
        LOG_PATH.set(path).ok();
    }
}

pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

pub fn get_level() -> LogLevel {
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Path of the active log file, for pointing users at it after a failure.
pub fn log_path() -> Option<&'static Path> {
    LOG_PATH.get().map(PathBuf::as_path)
}

fn format_line(at: DateTime<Local>, level: LogLevel, msg: &str) -> String {
    // multi-line messages (check output) stay one event per line
    let msg = msg.trim_end().replace('\n', "\n    ");
    format!("[{}] [{}] {}", at.format("%H:%M:%S%.3f"), level.as_str(), msg)
}

pub fn log_at(level: LogLevel, msg: &str) {
    if level > get_level() {
        return;
    }
    let Some(path) = LOG_PATH.get() else {
        return;
    };
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
        let _ = writeln!(file, "{}", format_line(Local::now(), level, msg));
    }
}

pub fn error(msg: &str) {
    log_at(LogLevel::Error, msg);
}

pub fn warn(msg: &str) {
    log_at(LogLevel::Warn, msg);
}

pub fn info(msg: &str) {
    log_at(LogLevel::Info, msg);
}

pub fn debug(msg: &str) {
    log_at(LogLevel::Debug, msg);
}

pub fn trace(msg: &str) {
    log_at(LogLevel::Trace, msg);
}

#[macro_export]
macro_rules! rlog {
    ($($arg:tt)*) => {
        $crate::log::info(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! rlog_error {
    ($($arg:tt)*) => {
        $crate::log::error(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! rlog_warn {
    ($($arg:tt)*) => {
        $crate::log::warn(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! rlog_debug {
    ($($arg:tt)*) => {
        $crate::log::debug(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! rlog_trace {
    ($($arg:tt)*) => {
        $crate::log::trace(&format!($($arg)*))
    };
}
