//! # rtapi
//!
//! Real-time task scheduler for POSIX threads. Components register as
//! modules, create tasks bound to a body closure, and start them at a period
//! quantized to one process-wide clock period. Every task runs on its own
//! pinned, real-time prioritized thread and calls [`wait`] once per period.
//!
//! ## Module Overview
//! - [`module`]    – Module registry with biased handles.
//! - [`task`]      – Task slots, lifecycle and creation parameters.
//! - [`time`]      – Monotonic clock, absolute sleeps, the clock period.
//! - [`driver`]    – Task threads, the periodic wait and self lookup.
//! - [`sched`]     – CPU affinity and scheduling policy calls.
//! - [`stats`]     – Per-task statistics and snapshots.
//! - [`exception`] – Deadline-miss hook.
//!
//! ```no_run
//! use rtapi::{wait, Rtapi, TaskSpec};
//!
//! let rt = Rtapi::global();
//! let module = rt.init("siggen").unwrap();
//! rt.clock_set_period(1_000_000).unwrap();
//!
//! let task = rt
//!     .new_task(TaskSpec::new("siggen.thread", module, rtapi::prio_highest(), || loop {
//!         // one period of work
//!         wait()?;
//!     }))
//!     .unwrap();
//! rt.start(task, 1_000_000).unwrap();
//! ```

pub mod config;
pub mod driver;
pub mod error;
pub mod exception;
pub mod module;
pub mod priority;
mod runtime;
pub mod sched;
pub mod stats;
pub mod task;
pub mod time;

pub use config::{
    RtapiConfig, RtapiConfigBuilder, SchedPolicy, MAX_MODULES, MAX_TASKS, MIN_STACK_SIZE,
    MODULE_OFFSET, NAME_LEN,
};
pub use driver::{delay, task_self, update_stats, wait};
pub use error::{ErrorKind, RtapiError, RtapiResult};
pub use exception::{Exception, ExceptionHook, ExceptionKind};
pub use module::{ModuleId, Name};
pub use priority::{prio_highest, prio_lowest, prio_next_higher, prio_next_lower};
pub use runtime::{Rtapi, TaskInfo};
pub use stats::{PolicyTier, ThreadStatusSnapshot};
pub use task::{TaskEntry, TaskId, TaskSpec, TaskState};
pub use time::{Clock, MonotonicClock, Timespec};
