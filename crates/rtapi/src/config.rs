//! Table sizing and scheduling configuration.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Capacity of the task table.
pub const MAX_TASKS: usize = 64;
/// Capacity of the module table.
pub const MAX_MODULES: usize = 64;
/// Bias added to module slot indices so module handles never look like task ids.
pub const MODULE_OFFSET: i32 = 32768;
/// Longest module or task name kept, in bytes.
pub const NAME_LEN: usize = 31;
/// Smallest stack handed to a task thread.
pub const MIN_STACK_SIZE: usize = 16384;

/// Scheduling policy requested for task threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SchedPolicy {
    /// Try `SCHED_DEADLINE` first, fall back to `SCHED_FIFO`.
    Deadline,
    /// `SCHED_FIFO` at the task priority.
    Fifo,
    /// Leave the inherited OS policy alone. Needs no privileges.
    Inherit,
}

/// Configuration for an [`Rtapi`](crate::Rtapi) instance.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RtapiConfig {
    pub max_tasks: usize,
    pub max_modules: usize,
    pub min_stack_size: usize,
    pub policy: SchedPolicy,
    /// Runtime budget per period under `SCHED_DEADLINE`.
    pub deadline_runtime_ns: u64,
    /// Deadline misses below this count are logged as warnings; later ones are only counted.
    pub miss_warn_limit: u32,
    /// Lock all process memory before the first task thread runs.
    pub lock_memory: bool,
}

impl Default for RtapiConfig {
    fn default() -> Self {
        Self {
            max_tasks: MAX_TASKS,
            max_modules: MAX_MODULES,
            min_stack_size: MIN_STACK_SIZE,
            policy: SchedPolicy::Fifo,
            deadline_runtime_ns: 8000,
            miss_warn_limit: 10,
            lock_memory: false,
        }
    }
}

impl RtapiConfig {
    pub fn builder() -> RtapiConfigBuilder {
        RtapiConfigBuilder::default()
    }
}

/// Builder for [`RtapiConfig`].
#[derive(Debug, Clone, Default)]
pub struct RtapiConfigBuilder {
    config: RtapiConfig,
}

impl RtapiConfigBuilder {
    /// Sets the number of usable task slots, capped at [`MAX_TASKS`].
    pub fn max_tasks(mut self, max: usize) -> Self {
        self.config.max_tasks = max.min(MAX_TASKS);
        self
    }

    /// Sets the number of usable module slots, capped at [`MAX_MODULES`].
    pub fn max_modules(mut self, max: usize) -> Self {
        self.config.max_modules = max.min(MAX_MODULES);
        self
    }

    /// Raises the stack floor. Values below [`MIN_STACK_SIZE`] are ignored.
    pub fn min_stack_size(mut self, size: usize) -> Self {
        self.config.min_stack_size = size.max(MIN_STACK_SIZE);
        self
    }

    pub fn policy(mut self, policy: SchedPolicy) -> Self {
        self.config.policy = policy;
        self
    }

    pub fn deadline_runtime_ns(mut self, runtime: u64) -> Self {
        self.config.deadline_runtime_ns = runtime;
        self
    }

    pub fn miss_warn_limit(mut self, limit: u32) -> Self {
        self.config.miss_warn_limit = limit;
        self
    }

    pub fn lock_memory(mut self, lock: bool) -> Self {
        self.config.lock_memory = lock;
        self
    }

    pub fn build(self) -> RtapiConfig {
        self.config
    }
}
