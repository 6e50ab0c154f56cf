//! Core domain model: tasks, their on-disk record format, and the
//! dependency graph the scheduler derives from them.

pub mod dag;
pub mod record;
pub mod task;

pub use dag::{TaskGraph, Unreachable};
pub use record::{parse_record, render_record};
pub use task::{Criterion, Task, TaskId, TaskStatus};
