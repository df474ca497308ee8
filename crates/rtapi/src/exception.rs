//! Exception hook fired from task threads.
//!
//! The scheduler only detects overruns; what to do about them (log, raise a
//! fault, shut the machine down) belongs to the host, which installs its own
//! [`ExceptionHook`].

use std::sync::Arc;

use log::debug;
use parking_lot::RwLock;

use crate::stats::ThreadStatusSnapshot;
use crate::task::TaskId;

/// Reason an exception was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
    /// The task was still running when its next period should have begun.
    DeadlineMissed,
}

/// Details handed to the hook.
#[derive(Debug, Clone)]
pub struct Exception {
    pub kind: ExceptionKind,
    pub task_id: TaskId,
    pub status: ThreadStatusSnapshot,
}

/// Host callback. Runs on the task thread that raised the exception.
pub type ExceptionHook = Arc<dyn Fn(&Exception) + Send + Sync>;

/// Hook installed until the host provides one.
pub fn default_hook() -> ExceptionHook {
    Arc::new(|exception: &Exception| {
        debug!(
            "task {} raised {:?} ({} wait errors)",
            exception.task_id, exception.kind, exception.status.wait_errors
        );
    })
}

/// Swappable hook storage.
pub(crate) struct HookSlot {
    hook: RwLock<ExceptionHook>,
}

impl HookSlot {
    pub(crate) fn new() -> Self {
        Self {
            hook: RwLock::new(default_hook()),
        }
    }

    /// Installs `hook`, returning the previous one.
    pub(crate) fn replace(&self, hook: ExceptionHook) -> ExceptionHook {
        std::mem::replace(&mut *self.hook.write(), hook)
    }

    pub(crate) fn raise(&self, exception: &Exception) {
        let hook = Arc::clone(&self.hook.read());
        hook(exception);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn missed(task: usize) -> Exception {
        Exception {
            kind: ExceptionKind::DeadlineMissed,
            task_id: TaskId::new(task),
            status: ThreadStatusSnapshot::default(),
        }
    }

    #[test]
    fn replaced_hook_receives_exceptions() {
        let slot = HookSlot::new();
        slot.raise(&missed(0));

        let seen = Arc::new(AtomicU32::new(0));
        let probe = Arc::clone(&seen);
        slot.replace(Arc::new(move |e: &Exception| {
            assert_eq!(e.kind, ExceptionKind::DeadlineMissed);
            probe.fetch_add(e.task_id.index() as u32 + 1, Ordering::SeqCst);
        }));

        slot.raise(&missed(4));
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }
}
