//! OS scheduling calls made by a task thread on itself: CPU pinning,
//! real-time policy, memory locking.

use std::io;
use std::sync::Once;

use log::{debug, info, warn};

use crate::config::SchedPolicy;
use crate::error::{RtapiError, RtapiResult};
use crate::stats::PolicyTier;

/// Kernel thread id of the caller.
pub fn thread_tid() -> i32 {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: gettid takes no arguments and cannot fail.
        unsafe { libc::syscall(libc::SYS_gettid) as i32 }
    }
    #[cfg(not(target_os = "linux"))]
    {
        0
    }
}

/// CPUs the calling thread may run on, in ascending order.
#[cfg(target_os = "linux")]
pub fn permitted_cpus() -> io::Result<Vec<usize>> {
    // SAFETY: cpu_set_t is a plain bitmask; zeroed is the empty set.
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    // SAFETY: `set` is valid for the size passed; pid 0 is the caller.
    let rc = unsafe { libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    let max = libc::CPU_SETSIZE as usize;
    // SAFETY: CPU_ISSET only reads `set` for indices below CPU_SETSIZE.
    Ok((0..max).filter(|&cpu| unsafe { libc::CPU_ISSET(cpu, &set) }).collect())
}

#[cfg(not(target_os = "linux"))]
pub fn permitted_cpus() -> io::Result<Vec<usize>> {
    let count = std::thread::available_parallelism().map(|p| p.get()).unwrap_or(1);
    Ok((0..count).collect())
}

/// Picks the CPU a task runs on.
///
/// An explicit request must be in `permitted`. Without one the
/// highest-numbered permitted CPU is used.
pub fn resolve_cpu(requested: Option<usize>, permitted: &[usize]) -> RtapiResult<usize> {
    match requested {
        Some(cpu) if permitted.contains(&cpu) => Ok(cpu),
        Some(cpu) => Err(RtapiError::Scheduling(format!("CPU {cpu} not available"))),
        None => permitted
            .iter()
            .max()
            .copied()
            .ok_or_else(|| RtapiError::Scheduling("unable to get ID of the last CPU".into())),
    }
}

/// Pins the calling thread to `cpu`.
#[cfg(target_os = "linux")]
pub fn pin_to_cpu(cpu: usize) -> io::Result<()> {
    // SAFETY: cpu_set_t is a plain bitmask; zeroed is the empty set.
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    // SAFETY: `cpu` was taken from the permitted set, so it is below CPU_SETSIZE.
    unsafe {
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
    }
    // SAFETY: `set` is valid for the size passed; pid 0 is the caller.
    let rc = unsafe { libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(target_os = "linux"))]
pub fn pin_to_cpu(_cpu: usize) -> io::Result<()> {
    Ok(())
}

/// Applies the configured policy to the calling thread and reports the tier
/// that took effect.
pub fn apply_policy(
    policy: SchedPolicy,
    priority: i32,
    period_ns: u64,
    runtime_ns: u64,
) -> RtapiResult<PolicyTier> {
    let tier = match policy {
        SchedPolicy::Inherit => PolicyTier::Inherited,
        SchedPolicy::Fifo => set_fifo(priority).map(|()| PolicyTier::Fifo)?,
        SchedPolicy::Deadline => match set_deadline(runtime_ns, period_ns) {
            Ok(()) => PolicyTier::Deadline,
            Err(err) => {
                info!("unable to set DEADLINE scheduling policy ({err}), trying FIFO");
                set_fifo(priority).map(|()| PolicyTier::Fifo)?
            }
        },
    };
    info!("running {tier} scheduling policy");
    Ok(tier)
}

fn set_fifo(priority: i32) -> RtapiResult<()> {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    // SAFETY: pid 0 is the caller; `param` is initialized.
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if rc == 0 {
        debug!("SCHED_FIFO priority {priority} applied");
        Ok(())
    } else {
        Err(RtapiError::os(
            "unable to set FIFO scheduling policy",
            io::Error::last_os_error(),
        ))
    }
}

#[cfg(target_os = "linux")]
mod deadline {
    pub const SCHED_DEADLINE: u32 = 6;

    /// `struct sched_attr` from `sched_setattr(2)`.
    #[repr(C)]
    #[derive(Default)]
    pub struct SchedAttr {
        pub size: u32,
        pub sched_policy: u32,
        pub sched_flags: u64,
        pub sched_nice: i32,
        pub sched_priority: u32,
        pub sched_runtime: u64,
        pub sched_deadline: u64,
        pub sched_period: u64,
    }
}

#[cfg(target_os = "linux")]
fn set_deadline(runtime_ns: u64, period_ns: u64) -> io::Result<()> {
    use deadline::{SchedAttr, SCHED_DEADLINE};

    if runtime_ns == 0 || runtime_ns > period_ns {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("runtime {runtime_ns} ns does not fit period {period_ns} ns"),
        ));
    }
    let attr = SchedAttr {
        size: std::mem::size_of::<SchedAttr>() as u32,
        sched_policy: SCHED_DEADLINE,
        sched_runtime: runtime_ns,
        sched_deadline: period_ns,
        sched_period: period_ns,
        ..SchedAttr::default()
    };
    // SAFETY: `attr` is a properly sized sched_attr; pid 0 is the caller.
    let rc = unsafe { libc::syscall(libc::SYS_sched_setattr, 0, &attr as *const SchedAttr, 0) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(target_os = "linux"))]
fn set_deadline(_runtime_ns: u64, _period_ns: u64) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "SCHED_DEADLINE is Linux only",
    ))
}

static MEMORY_LOCKED: Once = Once::new();

/// Locks process memory the first time any instance asks. Returns true for
/// the call that did it.
pub fn lock_memory_once() -> bool {
    once_per_process(&MEMORY_LOCKED, lock_memory)
}

fn once_per_process(once: &Once, f: impl FnOnce()) -> bool {
    let mut ran = false;
    once.call_once(|| {
        f();
        ran = true;
    });
    ran
}

/// Locks current and future pages. Failure is reported, never fatal.
pub fn lock_memory() {
    // SAFETY: mlockall only takes flag constants.
    let rc = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if rc == 0 {
        debug!("all memory locked (mlockall)");
    } else {
        warn!("mlockall failed: {}", io::Error::last_os_error());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_cpu_is_highest_permitted() {
        assert_eq!(resolve_cpu(None, &[0, 2, 5]).unwrap(), 5);
        assert_eq!(resolve_cpu(Some(2), &[0, 2, 5]).unwrap(), 2);
    }

    #[test]
    fn unavailable_cpu_is_rejected() {
        assert!(matches!(
            resolve_cpu(Some(3), &[0, 2, 5]),
            Err(RtapiError::Scheduling(_))
        ));
        assert!(resolve_cpu(None, &[]).is_err());
    }

    #[test]
    fn caller_has_at_least_one_cpu() {
        let cpus = permitted_cpus().unwrap();
        assert!(!cpus.is_empty());
        let cpu = resolve_cpu(None, &cpus).unwrap();
        assert_eq!(Some(&cpu), cpus.last());
    }

    #[test]
    fn once_per_process_runs_the_first_caller_only() {
        static ONCE: Once = Once::new();
        let mut calls = 0;
        assert!(once_per_process(&ONCE, || calls += 1));
        assert!(!once_per_process(&ONCE, || calls += 1));
        assert_eq!(calls, 1);
    }

    #[test]
    fn policy_tiers_have_display_names() {
        assert_eq!(PolicyTier::Fifo.to_string(), "FIFO");
        assert_eq!(PolicyTier::Deadline.to_string(), "DEADLINE");
        assert_eq!(PolicyTier::Inherited.to_string(), "inherited");
    }

    #[test]
    fn inherit_needs_no_privileges() {
        assert_eq!(
            apply_policy(SchedPolicy::Inherit, 1, 1_000_000, 8000).unwrap(),
            PolicyTier::Inherited
        );
    }
}
