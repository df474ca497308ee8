//! The scheduler facade.

use std::sync::Arc;

use log::{debug, error};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::config::RtapiConfig;
use crate::driver;
use crate::error::{RtapiError, RtapiResult};
use crate::exception::{ExceptionHook, HookSlot};
use crate::module::{ModuleId, ModuleTable, Name};
use crate::priority;
use crate::sched;
use crate::stats::ThreadStatusSnapshot;
use crate::task::{TaskId, TaskShared, TaskSpec, TaskState, TaskTable};
use crate::time::{Clock, MonotonicClock, TimeBase};

/// Both slot tables, guarded together by one lock.
pub(crate) struct Registry {
    modules: ModuleTable,
    tasks: TaskTable,
}

/// State shared between an [`Rtapi`] and its task threads.
pub(crate) struct Shared {
    pub(crate) config: RtapiConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) time_base: TimeBase,
    pub(crate) hooks: HookSlot,
    registry: Mutex<Registry>,
}

/// Read-only view of one task.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: Name,
    pub owner: ModuleId,
    pub priority: i32,
    pub stack_size: usize,
    pub uses_fp: bool,
    pub state: TaskState,
    pub status: ThreadStatusSnapshot,
}

/// A real-time scheduler instance.
///
/// Most programs use the process-wide instance from [`Rtapi::global`].
/// Dropping an instance stops and joins every task it still owns.
pub struct Rtapi {
    shared: Arc<Shared>,
}

static GLOBAL: Lazy<Rtapi> = Lazy::new(|| Rtapi::new(RtapiConfig::default()));

impl Rtapi {
    pub fn new(config: RtapiConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock))
    }

    pub fn with_clock(config: RtapiConfig, clock: Arc<dyn Clock>) -> Self {
        let registry = Registry {
            modules: ModuleTable::new(config.max_modules),
            tasks: TaskTable::new(config.max_tasks),
        };
        Self {
            shared: Arc::new(Shared {
                config,
                clock,
                time_base: TimeBase::new(),
                hooks: HookSlot::new(),
                registry: Mutex::new(registry),
            }),
        }
    }

    /// The process-wide instance, built with the default configuration.
    pub fn global() -> &'static Rtapi {
        &GLOBAL
    }

    pub fn config(&self) -> &RtapiConfig {
        &self.shared.config
    }

    // ---- modules --------------------------------------------------------

    /// Registers a module. An empty name is replaced by one made from the handle.
    pub fn init(&self, name: &str) -> RtapiResult<ModuleId> {
        debug!("initing module {name}");
        let result = self.shared.registry.lock().modules.init(name);
        if let Err(err) = &result {
            error!("module '{name}': {err}");
        }
        result
    }

    pub fn exit(&self, module: ModuleId) -> RtapiResult<()> {
        self.shared.registry.lock().modules.exit(module)
    }

    pub fn module_name(&self, module: ModuleId) -> Option<Name> {
        self.shared.registry.lock().modules.name(module)
    }

    pub fn module_count(&self) -> usize {
        self.shared.registry.lock().modules.loaded_count()
    }

    // ---- time base ------------------------------------------------------

    /// Sets the process-wide period once; `0` queries it.
    pub fn clock_set_period(&self, nsec: u64) -> RtapiResult<u64> {
        self.shared
            .time_base
            .set(nsec, self.shared.clock.resolution())
    }

    pub fn clock_period(&self) -> u64 {
        self.shared.time_base.period()
    }

    /// Monotonic time in nanoseconds.
    pub fn get_time(&self) -> u64 {
        self.shared.clock.now().as_nanos()
    }

    // ---- tasks ----------------------------------------------------------

    /// Creates a task. It does not run until [`start`](Self::start).
    pub fn new_task(&self, spec: TaskSpec) -> RtapiResult<TaskId> {
        if let Err(err) = priority::validate(spec.priority) {
            error!("new task '{}': {err}", spec.name);
            return Err(err);
        }
        if spec.name.contains('\0') {
            return Err(RtapiError::InvalidArgument(format!(
                "task name {:?} contains a NUL byte",
                spec.name
            )));
        }
        let stack_size = spec.stack_size.max(self.shared.config.min_stack_size);

        let mut registry = self.shared.registry.lock();
        if !registry.modules.is_loaded(spec.owner) {
            return Err(RtapiError::InvalidHandle(spec.owner.raw() as i64));
        }
        let name = spec.name.clone();
        let priority = spec.priority;
        let id = registry.tasks.reserve(spec, stack_size)?;
        debug!(
            "created task {id} '{name}': priority {priority} (highest={} lowest={}) stack {stack_size}",
            priority::prio_highest(),
            priority::prio_lowest()
        );
        Ok(id)
    }

    /// Starts the thread of `id` and returns the effective period.
    ///
    /// `period_ns` is rounded up to a multiple of the clock period. The call
    /// returns after the thread has configured itself; if that failed, the
    /// thread is already gone and the task is left `Deleted` for
    /// [`delete`](Self::delete) to release.
    pub fn start(&self, id: TaskId, period_ns: u64) -> RtapiResult<u64> {
        let period = self.shared.time_base.quantize(period_ns)?;
        let (task, entry) = self.shared.registry.lock().tasks.begin_start(id)?;

        if self.shared.config.lock_memory {
            sched::lock_memory_once();
        }

        task.set_period_ns(period);
        task.set_state(TaskState::Running);

        match driver::spawn(Arc::clone(&self.shared), Arc::clone(&task), entry) {
            Ok(thread) => {
                self.shared
                    .registry
                    .lock()
                    .tasks
                    .finish_start(id, Some(thread));
                Ok(period)
            }
            Err(err) => {
                task.set_state(TaskState::Deleted);
                self.shared.registry.lock().tasks.finish_start(id, None);
                Err(err)
            }
        }
    }

    /// Asks the task to terminate at its next period boundary.
    pub fn stop(&self, id: TaskId) -> RtapiResult<()> {
        let registry = self.shared.registry.lock();
        let task = registry.tasks.get(id)?;
        if task.request_stop() {
            debug!("task {id} '{}' asked to stop", task.name);
        }
        Ok(())
    }

    /// Stops the task, joins its thread and releases its slot.
    ///
    /// Blocks until the thread reaches its next [`wait`](crate::wait).
    pub fn delete(&self, id: TaskId) -> RtapiResult<()> {
        let (task, thread) = self.shared.registry.lock().tasks.begin_delete(id)?;

        task.request_stop();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                error!("join on realtime thread of task {id} failed: the task panicked");
            }
        }
        task.set_state(TaskState::Deleted);

        self.shared.registry.lock().tasks.release(id);
        Ok(())
    }

    pub fn pause(&self, id: TaskId) -> RtapiResult<()> {
        self.shared.registry.lock().tasks.get(id)?;
        Err(RtapiError::NotImplemented("task pause"))
    }

    pub fn resume(&self, id: TaskId) -> RtapiResult<()> {
        self.shared.registry.lock().tasks.get(id)?;
        Err(RtapiError::NotImplemented("task resume"))
    }

    /// Changes the period used from the task's next [`wait`](crate::wait) on.
    pub fn task_set_period(&self, id: TaskId, period_ns: u64) -> RtapiResult<u64> {
        let period = match self.shared.time_base.quantize(period_ns) {
            Err(RtapiError::TimeBaseUnset) => period_ns,
            other => other?,
        };
        self.shared.registry.lock().tasks.get(id)?.set_period_ns(period);
        Ok(period)
    }

    // ---- status ---------------------------------------------------------

    pub fn task_info(&self, id: TaskId) -> RtapiResult<TaskInfo> {
        let registry = self.shared.registry.lock();
        Ok(self.info(registry.tasks.get(id)?))
    }

    pub fn thread_status(&self, id: TaskId) -> RtapiResult<ThreadStatusSnapshot> {
        self.task_info(id).map(|info| info.status)
    }

    /// Snapshot of every live task, in slot order.
    pub fn status_table(&self) -> Vec<TaskInfo> {
        let registry = self.shared.registry.lock();
        registry.tasks.live_tasks().map(|task| self.info(task)).collect()
    }

    pub fn task_count(&self) -> usize {
        self.shared.registry.lock().tasks.live_count()
    }

    /// Installs the deadline-miss hook and returns the previous one.
    pub fn set_exception_hook(&self, hook: ExceptionHook) -> ExceptionHook {
        self.shared.hooks.replace(hook)
    }

    fn info(&self, task: &TaskShared) -> TaskInfo {
        let period = task.period_ns();
        let base = self.shared.time_base.period();
        let mut status = task.status.snapshot();
        status.period_ns = period;
        status.ratio = if base == 0 { 0 } else { period / base };
        TaskInfo {
            id: task.id,
            name: task.name.clone(),
            owner: task.owner,
            priority: task.priority,
            stack_size: task.stack_size,
            uses_fp: task.uses_fp,
            state: task.state(),
            status,
        }
    }
}

impl Drop for Rtapi {
    fn drop(&mut self) {
        let ids: Vec<TaskId> = {
            let registry = self.shared.registry.lock();
            registry.tasks.live_tasks().map(|task| task.id).collect()
        };
        for id in ids {
            if let Err(err) = self.delete(id) {
                debug!("task {id} not deleted on shutdown: {err}");
            }
        }
    }
}
