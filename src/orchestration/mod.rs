//! Orchestration layer: claiming, running and integrating tasks.
//!
//! The [`Scheduler`] owns the control loop and starts one [`WorkerSession`]
//! per claimed task. Sessions run the injected [`TaskExecutor`] inside an
//! isolated workspace from a [`WorkspaceProvider`]. The [`MergeCoordinator`]
//! folds finished workspaces back into the shared baseline.

mod executor;
mod lock;
mod merge;
mod scheduler;
mod session;
pub mod status;
mod workspace;

pub use executor::{render_prompt, CommandExecutor, ExecutionOutcome, TaskExecutor};
pub use lock::{LockManager, Reclaimed, ResetSummary};
pub use merge::{
    ConflictRecord, MergeCoordinator, MergeReport, MergedTask, Resolution, VerifyFailure,
};
pub use scheduler::{
    ScheduleReport, Scheduler, SchedulerEvent, SchedulerSettings, TickReport,
};
pub use session::{Disposition, SessionOutcome, SessionSettings, SessionState, WorkerSession};
pub use status::StatusReport;
pub use workspace::{Integration, WorkspaceProvider};
