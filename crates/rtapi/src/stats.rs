//! Per-task statistics.
//!
//! Each [`ThreadStatus`] is written only by the thread of the task it
//! describes and read by anyone for display. Fields are independent atomics,
//! so a [`ThreadStatusSnapshot`] may mix values from adjacent periods.

use core::fmt;
use std::io;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, AtomicU8, Ordering::Relaxed};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Scheduling policy a task thread actually runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PolicyTier {
    /// The thread has not configured itself yet.
    #[default]
    Unset,
    /// The OS policy inherited from the creating thread.
    Inherited,
    Fifo,
    Deadline,
}

impl PolicyTier {
    fn to_raw(self) -> u8 {
        match self {
            Self::Unset => 0,
            Self::Inherited => 1,
            Self::Fifo => 2,
            Self::Deadline => 3,
        }
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Inherited,
            2 => Self::Fifo,
            3 => Self::Deadline,
            _ => Self::Unset,
        }
    }
}

impl fmt::Display for PolicyTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unset => "unset",
            Self::Inherited => "inherited",
            Self::Fifo => "FIFO",
            Self::Deadline => "DEADLINE",
        })
    }
}

/// One `getrusage` sample for the calling thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    pub utime_usec: u64,
    pub stime_usec: u64,
    pub minflt: u64,
    pub majflt: u64,
    pub nsignals: u64,
    pub nivcsw: u64,
}

impl ResourceUsage {
    /// Samples resource usage of the calling thread.
    pub fn sample() -> io::Result<Self> {
        #[cfg(target_os = "linux")]
        let who = libc::RUSAGE_THREAD;
        #[cfg(not(target_os = "linux"))]
        let who = libc::RUSAGE_SELF;

        // SAFETY: rusage is plain old data; zeroed is a valid value.
        let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
        // SAFETY: `ru` is a valid, writable rusage.
        if unsafe { libc::getrusage(who, &mut ru) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            utime_usec: timeval_usec(ru.ru_utime),
            stime_usec: timeval_usec(ru.ru_stime),
            minflt: ru.ru_minflt as u64,
            majflt: ru.ru_majflt as u64,
            nsignals: ru.ru_nsignals as u64,
            nivcsw: ru.ru_nivcsw as u64,
        })
    }
}

fn timeval_usec(tv: libc::timeval) -> u64 {
    (tv.tv_sec as u64)
        .saturating_mul(1_000_000)
        .saturating_add(tv.tv_usec as u64)
}

/// Live statistics record for one task slot.
#[derive(Debug)]
pub struct ThreadStatus {
    wait_errors: AtomicU32,
    num_updates: AtomicU64,
    utime_usec: AtomicU64,
    stime_usec: AtomicU64,
    minflt: AtomicU64,
    majflt: AtomicU64,
    nsignals: AtomicU64,
    nivcsw: AtomicU64,
    minflt_base: AtomicU64,
    majflt_base: AtomicU64,
    startup_nivcsw: AtomicU64,
    policy: AtomicU8,
    cpu: AtomicI32,
    tid: AtomicI32,
    next_deadline_ns: AtomicU64,
}

impl Default for ThreadStatus {
    fn default() -> Self {
        Self {
            wait_errors: AtomicU32::new(0),
            num_updates: AtomicU64::new(0),
            utime_usec: AtomicU64::new(0),
            stime_usec: AtomicU64::new(0),
            minflt: AtomicU64::new(0),
            majflt: AtomicU64::new(0),
            nsignals: AtomicU64::new(0),
            nivcsw: AtomicU64::new(0),
            minflt_base: AtomicU64::new(0),
            majflt_base: AtomicU64::new(0),
            startup_nivcsw: AtomicU64::new(0),
            policy: AtomicU8::new(0),
            cpu: AtomicI32::new(-1),
            tid: AtomicI32::new(0),
            next_deadline_ns: AtomicU64::new(0),
        }
    }
}

impl ThreadStatus {
    /// Starts page-fault accounting from `usage`. Returns true if the
    /// baseline moved.
    pub(crate) fn reset_pagefault_baseline(&self, usage: &ResourceUsage) -> bool {
        let moved = self.minflt_base.swap(usage.minflt, Relaxed) != usage.minflt;
        self.majflt_base.swap(usage.majflt, Relaxed) != usage.majflt || moved
    }

    pub(crate) fn record_startup(&self, usage: &ResourceUsage) {
        self.startup_nivcsw.store(usage.nivcsw, Relaxed);
        self.record_sample(usage);
    }

    pub(crate) fn record_sample(&self, usage: &ResourceUsage) {
        self.utime_usec.store(usage.utime_usec, Relaxed);
        self.stime_usec.store(usage.stime_usec, Relaxed);
        self.minflt.store(usage.minflt, Relaxed);
        self.majflt.store(usage.majflt, Relaxed);
        self.nsignals.store(usage.nsignals, Relaxed);
        self.nivcsw.store(usage.nivcsw, Relaxed);
        self.num_updates.fetch_add(1, Relaxed);
    }

    /// Counts one missed deadline and returns the new total.
    pub(crate) fn record_miss(&self) -> u32 {
        self.wait_errors.fetch_add(1, Relaxed) + 1
    }

    /// Faults taken since the baseline, `None` if the counters went backwards.
    pub(crate) fn pagefaults_since_baseline(&self, usage: &ResourceUsage) -> Option<u64> {
        let minor = usage.minflt.checked_sub(self.minflt_base.load(Relaxed))?;
        let major = usage.majflt.checked_sub(self.majflt_base.load(Relaxed))?;
        Some(minor + major)
    }

    pub(crate) fn set_policy(&self, tier: PolicyTier) {
        self.policy.store(tier.to_raw(), Relaxed);
    }

    pub(crate) fn set_cpu(&self, cpu: usize) {
        self.cpu.store(cpu as i32, Relaxed);
    }

    pub(crate) fn set_tid(&self, tid: i32) {
        self.tid.store(tid, Relaxed);
    }

    pub(crate) fn set_next_deadline(&self, ns: u64) {
        self.next_deadline_ns.store(ns, Relaxed);
    }

    pub fn wait_errors(&self) -> u32 {
        self.wait_errors.load(Relaxed)
    }

    pub fn snapshot(&self) -> ThreadStatusSnapshot {
        let minflt = self.minflt.load(Relaxed);
        let majflt = self.majflt.load(Relaxed);
        let cpu = self.cpu.load(Relaxed);
        ThreadStatusSnapshot {
            wait_errors: self.wait_errors.load(Relaxed),
            num_updates: self.num_updates.load(Relaxed),
            utime_usec: self.utime_usec.load(Relaxed),
            stime_usec: self.stime_usec.load(Relaxed),
            minflt,
            majflt,
            minflt_delta: minflt.saturating_sub(self.minflt_base.load(Relaxed)),
            majflt_delta: majflt.saturating_sub(self.majflt_base.load(Relaxed)),
            nsignals: self.nsignals.load(Relaxed),
            nivcsw: self.nivcsw.load(Relaxed),
            startup_nivcsw: self.startup_nivcsw.load(Relaxed),
            policy: PolicyTier::from_raw(self.policy.load(Relaxed)),
            cpu: usize::try_from(cpu).ok(),
            tid: self.tid.load(Relaxed),
            next_deadline_ns: self.next_deadline_ns.load(Relaxed),
            period_ns: 0,
            ratio: 0,
        }
    }
}

/// Point-in-time copy of a task's statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ThreadStatusSnapshot {
    /// Missed deadlines since the task started.
    pub wait_errors: u32,
    /// Number of resource-usage samples taken.
    pub num_updates: u64,
    pub utime_usec: u64,
    pub stime_usec: u64,
    pub minflt: u64,
    pub majflt: u64,
    /// Minor faults since the baseline taken at thread start.
    pub minflt_delta: u64,
    /// Major faults since the baseline taken at thread start.
    pub majflt_delta: u64,
    pub nsignals: u64,
    pub nivcsw: u64,
    pub startup_nivcsw: u64,
    pub policy: PolicyTier,
    pub cpu: Option<usize>,
    pub tid: i32,
    /// Absolute `CLOCK_MONOTONIC` deadline of the period in progress.
    pub next_deadline_ns: u64,
    pub period_ns: u64,
    pub ratio: u64,
}
