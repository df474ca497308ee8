//! Task threads and the periodic wait.
//!
//! Each started task runs on its own OS thread. The thread registers itself
//! in a thread-local cursor, configures CPU and policy, meets the starting
//! thread at a two-party rendezvous and then hands control to the task body.
//! The body calls [`wait`] once per period. A stopped task leaves through
//! its next `wait`, which unwinds the body instead of returning.

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::mpsc::{self, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error, log, Level};

use crate::error::{RtapiError, RtapiResult};
use crate::exception::{Exception, ExceptionKind};
use crate::runtime::Shared;
use crate::sched;
use crate::stats::ResourceUsage;
use crate::task::{TaskEntry, TaskId, TaskShared, TaskState};
use crate::time::{Clock, Timespec};

/// Result of one pass through [`PeriodicTimer::cycle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cycle {
    /// Time observed after waking.
    pub now: Timespec,
    /// Deadline of the period that just began.
    pub deadline: Timespec,
    /// `now` was already past `deadline`.
    pub missed: bool,
}

/// Absolute deadline of a periodic task.
#[derive(Debug, Clone, Copy)]
pub struct PeriodicTimer {
    next: Timespec,
}

impl PeriodicTimer {
    /// First deadline is one period after `now`.
    pub fn start(now: Timespec, period_ns: u64) -> Self {
        Self {
            next: now.advanced(period_ns),
        }
    }

    pub fn next_deadline(&self) -> Timespec {
        self.next
    }

    /// Sleeps until the current deadline, then moves it one period on.
    ///
    /// The deadline always advances by exactly `period_ns`, however late the
    /// wake-up was, so an overrun is counted once and never compounds.
    pub fn cycle(&mut self, clock: &dyn Clock, period_ns: u64) -> Cycle {
        clock.sleep_until(self.next);
        self.next.advance(period_ns);
        let now = clock.now();
        Cycle {
            now,
            deadline: self.next,
            missed: now > self.next,
        }
    }
}

struct TaskCursor {
    task: Arc<TaskShared>,
    shared: Arc<Shared>,
    timer: RefCell<PeriodicTimer>,
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<TaskCursor>>> = const { RefCell::new(None) };
}

fn current() -> Option<Rc<TaskCursor>> {
    CURRENT.with(|cell| cell.borrow().clone())
}

/// Id of the task running on the calling thread.
pub fn task_self() -> RtapiResult<TaskId> {
    current()
        .map(|cursor| cursor.task.id)
        .ok_or(RtapiError::InvalidHandle(-1))
}

/// Sleeps until the calling task's next deadline.
///
/// Once the task has been stopped this does not return: the thread unwinds
/// out of the task body and exits. A miss is recorded in the task's
/// statistics and reported to the exception hook.
///
/// Fails with [`RtapiError::InvalidHandle`] off a task thread.
pub fn wait() -> RtapiResult<()> {
    let cursor = current().ok_or(RtapiError::InvalidHandle(-1))?;
    cursor.wait();
    Ok(())
}

/// Samples resource usage of the calling task into its status record.
pub fn update_stats() -> RtapiResult<TaskId> {
    let cursor = current().ok_or(RtapiError::InvalidHandle(-1))?;
    let usage = ResourceUsage::sample()
        .map_err(|err| RtapiError::os("getrusage", err))?;
    cursor.task.status.record_sample(&usage);
    Ok(cursor.task.id)
}

/// Relative sleep for `nsec` nanoseconds.
pub fn delay(nsec: u64) {
    thread::sleep(std::time::Duration::from_nanos(nsec));
}

impl TaskCursor {
    fn wait(&self) {
        self.exit_if_stopped();

        let period = self.task.period_ns();
        let cycle = self
            .timer
            .borrow_mut()
            .cycle(self.shared.clock.as_ref(), period);
        self.task.status.set_next_deadline(cycle.deadline.as_nanos());

        if cycle.missed {
            self.deadline_missed(&cycle);
        }

        self.exit_if_stopped();
    }

    fn exit_if_stopped(&self) {
        if self.task.stop_requested() {
            debug!("task {} '{}' stopping at period boundary", self.task.id, self.task.name);
            panic::resume_unwind(Box::new(TaskExit));
        }
    }

    fn deadline_missed(&self, cycle: &Cycle) {
        let status = &self.task.status;
        let usage = ResourceUsage::sample().ok();
        if let Some(usage) = &usage {
            status.record_sample(usage);
        }
        let failures = status.record_miss();

        let level = if failures == 1 {
            Some(Level::Error)
        } else if failures < self.shared.config.miss_warn_limit {
            Some(Level::Warn)
        } else {
            None
        };
        if let Some(level) = level {
            let faults = match usage.and_then(|u| status.pagefaults_since_baseline(&u)) {
                Some(faults) => faults,
                None => {
                    error!("task {} {}: got invalid fault counts", self.task.id, self.task.name);
                    0
                }
            };
            log!(
                level,
                "missed scheduling deadline for task {} [{} times]: now is {}, deadline was {}, \
                 pagefaults in realtime context: {}",
                self.task.id,
                failures,
                cycle.now,
                cycle.deadline,
                faults
            );
        }

        self.shared.hooks.raise(&Exception {
            kind: ExceptionKind::DeadlineMissed,
            task_id: self.task.id,
            status: status.snapshot(),
        });
    }
}

/// Unwind payload that carries a stopped task out of its body.
struct TaskExit;

/// Clears the thread-local cursor and marks the task dead however the
/// thread leaves, including by panic.
struct ExitGuard {
    task: Arc<TaskShared>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        CURRENT.with(|cell| cell.borrow_mut().take());
        self.task.set_state(TaskState::Deleted);
    }
}

/// Spawns the thread of `task` and waits until it has configured itself.
///
/// On failure the thread has already exited and been joined.
pub(crate) fn spawn(
    shared: Arc<Shared>,
    task: Arc<TaskShared>,
    entry: TaskEntry,
) -> RtapiResult<JoinHandle<()>> {
    let (ready_tx, ready_rx) = mpsc::sync_channel(0);
    let id = task.id;

    debug!("about to create thread for task {id}");
    let handle = thread::Builder::new()
        .name(task.name.to_string())
        .stack_size(task.stack_size)
        .spawn(move || run(shared, task, entry, ready_tx))
        .map_err(|err| {
            error!("failed to create realtime thread for task {id}: {err}");
            RtapiError::ResourceExhausted(format!("failed to create realtime thread: {err}"))
        })?;

    let outcome = ready_rx.recv();
    match outcome {
        Ok(Ok(())) => {
            debug!("task {id} finished its basic init");
            Ok(handle)
        }
        Ok(Err(err)) => {
            let _ = handle.join();
            error!("realtime thread initialization failed for task {id}: {err}");
            Err(err)
        }
        Err(_) => {
            let _ = handle.join();
            error!("realtime thread for task {id} died during initialization");
            Err(RtapiError::Scheduling(format!(
                "thread of task {id} exited before initialization completed"
            )))
        }
    }
}

fn run(
    shared: Arc<Shared>,
    task: Arc<TaskShared>,
    entry: TaskEntry,
    ready: SyncSender<RtapiResult<()>>,
) {
    let _guard = ExitGuard {
        task: Arc::clone(&task),
    };

    let setup = configure(&shared, &task);
    let ok = setup.is_ok();
    // The starting thread blocks until this send lands, success or not.
    let _ = ready.send(setup);
    if !ok {
        return;
    }

    let cursor = CURRENT.with(|cell| cell.borrow().clone());
    if let Some(cursor) = cursor {
        let timer = PeriodicTimer::start(shared.clock.now(), task.period_ns());
        task.status.set_next_deadline(timer.next_deadline().as_nanos());
        *cursor.timer.borrow_mut() = timer;
    }

    match ResourceUsage::sample() {
        Ok(usage) => task.status.record_startup(&usage),
        Err(err) => error!("getrusage() for task {}: {err}", task.id),
    }

    match panic::catch_unwind(AssertUnwindSafe(entry)) {
        Ok(Ok(())) => error!("reached end of realtime thread for task {}", task.id),
        Ok(Err(err)) => error!("task {} '{}' failed: {err}", task.id, task.name),
        Err(payload) if payload.is::<TaskExit>() => {
            debug!("task {} '{}' exited", task.id, task.name)
        }
        Err(payload) => {
            error!("task {} '{}' panicked", task.id, task.name);
            panic::resume_unwind(payload);
        }
    }
}

/// Thread-side setup, run before the rendezvous.
fn configure(shared: &Arc<Shared>, task: &Arc<TaskShared>) -> RtapiResult<()> {
    let cursor = Rc::new(TaskCursor {
        task: Arc::clone(task),
        shared: Arc::clone(shared),
        timer: RefCell::new(PeriodicTimer::start(Timespec::ZERO, 0)),
    });
    CURRENT.with(|cell| *cell.borrow_mut() = Some(cursor));

    match ResourceUsage::sample() {
        Ok(usage) => {
            if task.status.reset_pagefault_baseline(&usage) {
                debug!("task {} {}: reset pagefault counter", task.id, task.name);
            }
        }
        Err(err) => error!("getrusage() for task {}: {err}", task.id),
    }

    let tid = sched::thread_tid();
    task.status.set_tid(tid);
    let period = task.period_ns();
    let base = shared.time_base.period();
    debug!(
        "task '{}' period = {} ratio = {} id = {} TID = {}",
        task.name,
        period,
        period / base.max(1),
        task.id,
        tid
    );

    let permitted = sched::permitted_cpus()
        .map_err(|err| RtapiError::os("sched_getaffinity", err))?;
    let cpu = sched::resolve_cpu(task.cpu, &permitted).map_err(|err| {
        error!("set affinity for task {} '{}': {err}", task.id, task.name);
        err
    })?;
    sched::pin_to_cpu(cpu).map_err(|err| {
        error!("{} {}: failed to set CPU affinity to CPU {cpu} ({err})", task.id, task.name);
        RtapiError::os("sched_setaffinity", err)
    })?;
    task.status.set_cpu(cpu);
    debug!("task '{}' assigned to CPU {cpu}", task.name);

    let tier = sched::apply_policy(
        shared.config.policy,
        task.priority,
        period,
        shared.config.deadline_runtime_ns,
    )?;
    task.status.set_policy(tier);
    Ok(())
}
