//! Task table.
//!
//! Slots are reserved and released under the registry lock. A slot's tag
//! tells apart never-used, live and released slots; it is cleared only after
//! the slot's thread has been joined. Timing fields of a live task live in
//! [`TaskShared`] and are written by the task's own thread without the lock.

use core::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::debug;

use crate::error::{RtapiError, RtapiResult};
use crate::module::{bounded_name, ModuleId, Name};
use crate::stats::ThreadStatus;

/// Tag of a slot that is in use.
pub const TASK_MAGIC: u32 = 21979;
/// Tag of a slot that held a task and was released.
pub const TASK_RELEASED: u32 = 0x5EED_0000;

/// Body of a task.
///
/// The body loops calling [`wait`](crate::wait) once per period. Once the
/// task is stopped, `wait` does not return: the thread unwinds out of the
/// body, running destructors on the way, and exits.
pub type TaskEntry = Box<dyn FnOnce() -> RtapiResult<()> + Send + 'static>;

/// Index of a task slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(usize);

impl TaskId {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a task slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Free,
    /// Created, thread not started.
    Allocated,
    Running,
    /// Asked to terminate; the thread exits at its next period boundary.
    Stopping,
    /// The thread has exited or never came up.
    Deleted,
}

impl TaskState {
    fn to_raw(self) -> u8 {
        match self {
            Self::Free => 0,
            Self::Allocated => 1,
            Self::Running => 2,
            Self::Stopping => 3,
            Self::Deleted => 4,
        }
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Allocated,
            2 => Self::Running,
            3 => Self::Stopping,
            4 => Self::Deleted,
            _ => Self::Free,
        }
    }
}

/// Parameters of a new task.
pub struct TaskSpec {
    pub(crate) name: String,
    pub(crate) owner: ModuleId,
    pub(crate) priority: i32,
    pub(crate) stack_size: usize,
    pub(crate) uses_fp: bool,
    pub(crate) cpu: Option<usize>,
    pub(crate) entry: TaskEntry,
}

impl TaskSpec {
    pub fn new<F>(name: &str, owner: ModuleId, priority: i32, entry: F) -> Self
    where
        F: FnOnce() -> RtapiResult<()> + Send + 'static,
    {
        Self {
            name: name.to_owned(),
            owner,
            priority,
            stack_size: 0,
            uses_fp: false,
            cpu: None,
            entry: Box::new(entry),
        }
    }

    /// Requested stack size; raised to the configured floor.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn uses_fp(mut self, uses_fp: bool) -> Self {
        self.uses_fp = uses_fp;
        self
    }

    /// Pins the task to `cpu`. Without it the task takes the highest-numbered
    /// CPU the process may use.
    pub fn cpu(mut self, cpu: usize) -> Self {
        self.cpu = Some(cpu);
        self
    }
}

impl fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSpec")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("priority", &self.priority)
            .field("stack_size", &self.stack_size)
            .field("uses_fp", &self.uses_fp)
            .field("cpu", &self.cpu)
            .finish()
    }
}

/// Task attributes shared between the registry and the task thread.
#[derive(Debug)]
pub(crate) struct TaskShared {
    pub(crate) id: TaskId,
    pub(crate) name: Name,
    pub(crate) owner: ModuleId,
    pub(crate) priority: i32,
    pub(crate) stack_size: usize,
    pub(crate) uses_fp: bool,
    pub(crate) cpu: Option<usize>,
    state: AtomicU8,
    period_ns: AtomicU64,
    pub(crate) status: ThreadStatus,
}

impl TaskShared {
    fn new(id: TaskId, spec: &TaskSpec, stack_size: usize) -> Self {
        Self {
            id,
            name: bounded_name(&spec.name),
            owner: spec.owner,
            priority: spec.priority,
            stack_size,
            uses_fp: spec.uses_fp,
            cpu: spec.cpu,
            state: AtomicU8::new(TaskState::Allocated.to_raw()),
            period_ns: AtomicU64::new(0),
            status: ThreadStatus::default(),
        }
    }

    pub(crate) fn state(&self) -> TaskState {
        TaskState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.store(state.to_raw(), Ordering::Release);
    }

    /// Moves a running task to `Stopping`. Other states are left alone.
    pub(crate) fn request_stop(&self) -> bool {
        self.state
            .compare_exchange(
                TaskState::Running.to_raw(),
                TaskState::Stopping.to_raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn stop_requested(&self) -> bool {
        matches!(self.state(), TaskState::Stopping | TaskState::Deleted)
    }

    pub(crate) fn period_ns(&self) -> u64 {
        self.period_ns.load(Ordering::Acquire)
    }

    pub(crate) fn set_period_ns(&self, period: u64) {
        self.period_ns.store(period, Ordering::Release);
    }
}

/// What the registry is doing to a slot outside the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum SlotOp {
    #[default]
    Idle,
    Starting,
    Deleting,
}

#[derive(Default)]
struct TaskSlot {
    tag: u32,
    generation: u32,
    op: SlotOp,
    task: Option<Arc<TaskShared>>,
    entry: Option<TaskEntry>,
    thread: Option<JoinHandle<()>>,
}

/// Task slots. Callers hold the registry lock.
pub(crate) struct TaskTable {
    slots: Vec<TaskSlot>,
}

impl TaskTable {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| TaskSlot::default()).collect(),
        }
    }

    /// Reserves the first slot not tagged live.
    pub(crate) fn reserve(&mut self, spec: TaskSpec, stack_size: usize) -> RtapiResult<TaskId> {
        let Some(n) = self.slots.iter().position(|s| s.tag != TASK_MAGIC) else {
            return Err(RtapiError::ResourceExhausted(format!(
                "no free task slot (limit {})",
                self.slots.len()
            )));
        };
        let id = TaskId::new(n);
        let task = Arc::new(TaskShared::new(id, &spec, stack_size));
        let slot = &mut self.slots[n];
        slot.tag = TASK_MAGIC;
        slot.op = SlotOp::Idle;
        slot.task = Some(task);
        slot.entry = Some(spec.entry);
        slot.thread = None;
        Ok(id)
    }

    /// Live task in slot `id`, if no start or delete is in flight on it.
    pub(crate) fn get(&self, id: TaskId) -> RtapiResult<&Arc<TaskShared>> {
        let slot = self.live_slot(id)?;
        slot.task.as_ref().ok_or(invalid(id))
    }

    /// Takes the entry out of an allocated task and marks the slot as starting.
    pub(crate) fn begin_start(&mut self, id: TaskId) -> RtapiResult<(Arc<TaskShared>, TaskEntry)> {
        let slot = self.live_slot_mut(id)?;
        let task = slot.task.clone().ok_or(invalid(id))?;
        let entry = slot
            .entry
            .take()
            .ok_or_else(|| RtapiError::InvalidArgument(format!("task {id} was already started")))?;
        slot.op = SlotOp::Starting;
        Ok((task, entry))
    }

    pub(crate) fn finish_start(&mut self, id: TaskId, thread: Option<JoinHandle<()>>) {
        if let Some(slot) = self.slots.get_mut(id.index()) {
            slot.op = SlotOp::Idle;
            slot.thread = thread;
        }
    }

    /// Marks the slot as being deleted and hands out its thread for joining.
    pub(crate) fn begin_delete(
        &mut self,
        id: TaskId,
    ) -> RtapiResult<(Arc<TaskShared>, Option<JoinHandle<()>>)> {
        let slot = self.live_slot_mut(id)?;
        if let Some(thread) = &slot.thread {
            if thread.thread().id() == std::thread::current().id() {
                return Err(RtapiError::InvalidArgument(format!(
                    "task {id} cannot delete itself"
                )));
            }
        }
        let task = slot.task.clone().ok_or(invalid(id))?;
        slot.op = SlotOp::Deleting;
        Ok((task, slot.thread.take()))
    }

    /// Releases a slot whose thread has been joined.
    pub(crate) fn release(&mut self, id: TaskId) {
        if let Some(slot) = self.slots.get_mut(id.index()) {
            slot.tag = TASK_RELEASED;
            slot.generation = slot.generation.wrapping_add(1);
            slot.op = SlotOp::Idle;
            slot.task = None;
            slot.entry = None;
            slot.thread = None;
            debug!("task slot {id} released (generation {})", slot.generation);
        }
    }

    #[cfg(test)]
    pub(crate) fn generation(&self, id: TaskId) -> Option<u32> {
        self.slots.get(id.index()).map(|s| s.generation)
    }

    pub(crate) fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.tag == TASK_MAGIC).count()
    }

    pub(crate) fn live_tasks(&self) -> impl Iterator<Item = &Arc<TaskShared>> + '_ {
        self.slots
            .iter()
            .filter(|s| s.tag == TASK_MAGIC && s.op != SlotOp::Deleting)
            .filter_map(|s| s.task.as_ref())
    }

    fn live_slot(&self, id: TaskId) -> RtapiResult<&TaskSlot> {
        match self.slots.get(id.index()) {
            Some(slot) if slot.tag == TASK_MAGIC => match slot.op {
                SlotOp::Idle => Ok(slot),
                SlotOp::Starting => Err(busy(id)),
                SlotOp::Deleting => Err(invalid(id)),
            },
            _ => Err(invalid(id)),
        }
    }

    fn live_slot_mut(&mut self, id: TaskId) -> RtapiResult<&mut TaskSlot> {
        self.live_slot(id)?;
        Ok(&mut self.slots[id.index()])
    }
}

fn invalid(id: TaskId) -> RtapiError {
    RtapiError::InvalidHandle(id.index() as i64)
}

fn busy(id: TaskId) -> RtapiError {
    RtapiError::InvalidArgument(format!("task {id} is starting"))
}
