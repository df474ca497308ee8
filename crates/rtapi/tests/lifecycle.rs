//! Task lifecycle: create, start, stop, delete and slot reuse.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rtapi::{
    prio_highest, prio_lowest, task_self, wait, ErrorKind, PolicyTier, Rtapi, RtapiConfig,
    RtapiError, SchedPolicy, TaskSpec, TaskState, MODULE_OFFSET,
};

fn rtapi() -> Rtapi {
    Rtapi::new(RtapiConfig::builder().policy(SchedPolicy::Inherit).build())
}

fn counting_body(counter: Arc<AtomicU64>) -> impl FnOnce() -> rtapi::RtapiResult<()> + Send {
    move || -> rtapi::RtapiResult<()> {
        loop {
            counter.fetch_add(1, Ordering::SeqCst);
            wait()?;
        }
    }
}

#[test]
fn end_to_end_period_quantization_and_slot_reuse() {
    let rt = rtapi();
    let module = rt.init("e2e").unwrap();
    assert_eq!(rt.clock_set_period(1_000_000).unwrap(), 1_000_000);

    let counter = Arc::new(AtomicU64::new(0));
    let task = rt
        .new_task(TaskSpec::new(
            "e2e.thread",
            module,
            prio_highest(),
            counting_body(Arc::clone(&counter)),
        ))
        .unwrap();

    assert_eq!(rt.start(task, 500_000).unwrap(), 1_000_000);
    thread::sleep(Duration::from_millis(30));
    assert!(counter.load(Ordering::SeqCst) > 0);

    let info = rt.task_info(task).unwrap();
    assert_eq!(info.state, TaskState::Running);
    assert_eq!(info.status.period_ns, 1_000_000);
    assert_eq!(info.status.ratio, 1);
    assert_eq!(info.status.policy, PolicyTier::Inherited);
    assert!(info.status.cpu.is_some());
    assert!(info.status.num_updates >= 1);

    rt.stop(task).unwrap();
    rt.delete(task).unwrap();
    assert_eq!(rt.task_count(), 0);

    let again = rt
        .new_task(TaskSpec::new("e2e.again", module, prio_lowest(), || Ok(())))
        .unwrap();
    assert_eq!(again, task);
}

#[test]
fn every_feasible_priority_is_accepted() {
    let rt = rtapi();
    let module = rt.init("prio").unwrap();

    for prio in prio_lowest()..=prio_highest() {
        let id = rt
            .new_task(TaskSpec::new("prio", module, prio, || Ok(())))
            .unwrap();
        assert_eq!(rt.task_info(id).unwrap().priority, prio);
        rt.delete(id).unwrap();
    }
}

#[test]
fn infeasible_priority_allocates_nothing() {
    let rt = rtapi();
    let module = rt.init("prio").unwrap();
    rt.new_task(TaskSpec::new("keep", module, prio_lowest(), || Ok(())))
        .unwrap();

    for prio in [prio_lowest() - 1, prio_highest() + 1, i32::MIN, i32::MAX] {
        let err = rt
            .new_task(TaskSpec::new("bad", module, prio, || Ok(())))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(matches!(err, RtapiError::InvalidPriority { .. }));
        assert_eq!(rt.task_count(), 1);
    }
}

#[test]
fn deleting_twice_reports_invalid_handle() {
    let rt = rtapi();
    let module = rt.init("twice").unwrap();
    rt.clock_set_period(1_000_000).unwrap();

    let counter = Arc::new(AtomicU64::new(0));
    let task = rt
        .new_task(TaskSpec::new("twice", module, prio_lowest(), counting_body(counter)))
        .unwrap();
    rt.start(task, 1_000_000).unwrap();

    rt.delete(task).unwrap();
    let err = rt.delete(task).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidHandle);
    assert!(rt.stop(task).is_err());
}

/// Sends on drop, so the test sees the body's stack being unwound.
struct Unwound(mpsc::Sender<&'static str>);

impl Drop for Unwound {
    fn drop(&mut self) {
        let _ = self.0.send("unwound");
    }
}

#[test]
fn delete_waits_for_the_body_to_return() {
    let rt = rtapi();
    let module = rt.init("coop").unwrap();
    rt.clock_set_period(2_000_000).unwrap();

    let (tx, rx) = mpsc::channel();
    let task = rt
        .new_task(TaskSpec::new("coop", module, prio_lowest(), move || {
            let _unwound = Unwound(tx);
            loop {
                wait()?;
            }
        }))
        .unwrap();
    rt.start(task, 2_000_000).unwrap();
    thread::sleep(Duration::from_millis(10));

    rt.stop(task).unwrap();
    rt.delete(task).unwrap();
    assert_eq!(rx.try_recv().unwrap(), "unwound");
}

#[test]
fn stopped_task_exits_even_if_the_body_ignores_wait_errors() {
    let rt = rtapi();
    let module = rt.init("stubborn").unwrap();
    rt.clock_set_period(50_000_000).unwrap();

    let ignored = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&ignored);
    let (tx, rx) = mpsc::channel();
    let task = rt
        .new_task(TaskSpec::new("stubborn", module, prio_lowest(), move || {
            let _unwound = Unwound(tx);
            loop {
                if wait().is_err() {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }
        }))
        .unwrap();
    rt.start(task, 50_000_000).unwrap();
    thread::sleep(Duration::from_millis(20));

    rt.stop(task).unwrap();
    for _ in 0..500 {
        if rt.task_info(task).unwrap().state == TaskState::Deleted {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(rt.task_info(task).unwrap().state, TaskState::Deleted);
    assert_eq!(ignored.load(Ordering::SeqCst), 0);
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), "unwound");

    rt.delete(task).unwrap();
    assert_eq!(rt.task_count(), 0);
}

#[test]
fn panicking_body_is_joined_by_delete() {
    let rt = rtapi();
    let module = rt.init("panics").unwrap();
    rt.clock_set_period(1_000_000).unwrap();

    let task = rt
        .new_task(TaskSpec::new("panics", module, prio_lowest(), || {
            wait()?;
            panic!("body failed");
        }))
        .unwrap();
    rt.start(task, 1_000_000).unwrap();

    for _ in 0..500 {
        if rt.task_info(task).unwrap().state == TaskState::Deleted {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(rt.task_info(task).unwrap().state, TaskState::Deleted);
    rt.delete(task).unwrap();
}

#[test]
fn task_knows_its_own_id() {
    let rt = rtapi();
    let module = rt.init("self").unwrap();
    rt.clock_set_period(1_000_000).unwrap();

    let (tx, rx) = mpsc::channel();
    let task = rt
        .new_task(TaskSpec::new("self", module, prio_lowest(), move || {
            tx.send(task_self()).unwrap();
            loop {
                wait()?;
            }
        }))
        .unwrap();
    rt.start(task, 1_000_000).unwrap();

    let seen = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert_eq!(seen, task);
    assert!(task_self().is_err());
    rt.delete(task).unwrap();
}

#[test]
fn unavailable_cpu_rolls_back_start() {
    let rt = rtapi();
    let module = rt.init("cpu").unwrap();
    rt.clock_set_period(1_000_000).unwrap();

    let task = rt
        .new_task(TaskSpec::new("cpu", module, prio_lowest(), || Ok(())).cpu(4095))
        .unwrap();
    let err = rt.start(task, 1_000_000).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SchedulingError);
    assert_eq!(rt.task_info(task).unwrap().state, TaskState::Deleted);

    // The entry went with the dead thread.
    assert!(rt.start(task, 1_000_000).is_err());

    rt.delete(task).unwrap();
    assert_eq!(rt.task_count(), 0);
}

#[test]
fn start_requires_time_base() {
    let rt = rtapi();
    let module = rt.init("nobase").unwrap();
    let task = rt
        .new_task(TaskSpec::new("nobase", module, prio_lowest(), || Ok(())))
        .unwrap();

    let err = rt.start(task, 1_000_000).unwrap_err();
    assert!(matches!(err, RtapiError::TimeBaseUnset));
    assert_eq!(rt.task_info(task).unwrap().state, TaskState::Allocated);
}

#[test]
fn body_returning_early_marks_task_deleted() {
    let rt = rtapi();
    let module = rt.init("early").unwrap();
    rt.clock_set_period(1_000_000).unwrap();

    let task = rt
        .new_task(TaskSpec::new("early", module, prio_lowest(), || Ok(())))
        .unwrap();
    rt.start(task, 1_000_000).unwrap();

    for _ in 0..500 {
        if rt.task_info(task).unwrap().state == TaskState::Deleted {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(rt.task_info(task).unwrap().state, TaskState::Deleted);
    rt.delete(task).unwrap();
}

#[test]
fn pause_and_resume_are_not_implemented() {
    let rt = rtapi();
    let module = rt.init("pause").unwrap();
    let task = rt
        .new_task(TaskSpec::new("pause", module, prio_lowest(), || Ok(())))
        .unwrap();

    assert_eq!(rt.pause(task).unwrap_err().kind(), ErrorKind::NotImplemented);
    assert_eq!(rt.resume(task).unwrap_err().kind(), ErrorKind::NotImplemented);

    rt.delete(task).unwrap();
    assert_eq!(rt.pause(task).unwrap_err().kind(), ErrorKind::InvalidHandle);
}

#[test]
fn owner_must_be_loaded() {
    let rt = rtapi();
    let module = rt.init("gone").unwrap();
    rt.exit(module).unwrap();

    let err = rt
        .new_task(TaskSpec::new("orphan", module, prio_lowest(), || Ok(())))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidHandle);
    assert_eq!(rt.task_count(), 0);
}

#[test]
fn stack_size_has_a_floor() {
    let rt = rtapi();
    let module = rt.init("stack").unwrap();
    let small = rt
        .new_task(TaskSpec::new("small", module, prio_lowest(), || Ok(())).stack_size(512))
        .unwrap();
    let large = rt
        .new_task(TaskSpec::new("large", module, prio_lowest(), || Ok(())).stack_size(1 << 20))
        .unwrap();

    assert_eq!(rt.task_info(small).unwrap().stack_size, rtapi::MIN_STACK_SIZE);
    assert_eq!(rt.task_info(large).unwrap().stack_size, 1 << 20);
}

#[test]
fn set_period_is_quantized_and_visible() {
    let rt = rtapi();
    let module = rt.init("period").unwrap();
    let task = rt
        .new_task(TaskSpec::new("period", module, prio_lowest(), || Ok(())))
        .unwrap();

    assert_eq!(rt.task_set_period(task, 2_500_000).unwrap(), 2_500_000);
    rt.clock_set_period(1_000_000).unwrap();
    assert_eq!(rt.task_set_period(task, 2_500_000).unwrap(), 3_000_000);

    let status = rt.thread_status(task).unwrap();
    assert_eq!(status.period_ns, 3_000_000);
    assert_eq!(status.ratio, 3);
}

#[test]
fn modules_have_biased_handles() {
    let rt = rtapi();
    let a = rt.init("a").unwrap();
    assert!(a.raw() >= MODULE_OFFSET);
    assert_eq!(rt.module_name(a).unwrap().as_str(), "a");
    assert_eq!(rt.module_count(), 1);

    rt.exit(a).unwrap();
    assert_eq!(rt.exit(a).unwrap_err().kind(), ErrorKind::InvalidHandle);
    assert_eq!(rt.module_count(), 0);
}
