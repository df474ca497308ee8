//! Monotonic time, absolute sleeps and the process-wide time base.
//!
//! Task deadlines are absolute [`Timespec`] values on `CLOCK_MONOTONIC`.
//! Sleeping to an absolute deadline instead of for a relative duration keeps
//! late wake-ups from shifting every later period.

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, error};

use crate::error::{RtapiError, RtapiResult};

pub const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Normalized monotonic timestamp (`nsec < NSEC_PER_SEC`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: u32,
}

impl Timespec {
    pub const ZERO: Timespec = Timespec { sec: 0, nsec: 0 };

    pub const fn new(sec: i64, nsec: u32) -> Self {
        Self { sec, nsec }
    }

    pub const fn from_nanos(ns: u64) -> Self {
        Self {
            sec: (ns / NSEC_PER_SEC) as i64,
            nsec: (ns % NSEC_PER_SEC) as u32,
        }
    }

    /// Total nanoseconds, saturating at zero for pre-epoch values.
    pub fn as_nanos(self) -> u64 {
        if self.sec < 0 {
            return 0;
        }
        (self.sec as u64)
            .saturating_mul(NSEC_PER_SEC)
            .saturating_add(self.nsec as u64)
    }

    /// Moves the timestamp forward by `ns`, carrying whole seconds.
    pub fn advance(&mut self, ns: u64) {
        let total = self.nsec as u64 + ns % NSEC_PER_SEC;
        self.sec += (ns / NSEC_PER_SEC + total / NSEC_PER_SEC) as i64;
        self.nsec = (total % NSEC_PER_SEC) as u32;
    }

    pub fn advanced(mut self, ns: u64) -> Self {
        self.advance(ns);
        self
    }

    /// Nanoseconds from `earlier` to `self`, zero if `earlier` is later.
    pub fn saturating_nanos_since(self, earlier: Timespec) -> u64 {
        self.as_nanos().saturating_sub(earlier.as_nanos())
    }

    fn to_libc(self) -> libc::timespec {
        libc::timespec {
            tv_sec: self.sec as libc::time_t,
            tv_nsec: self.nsec as libc::c_long,
        }
    }

    fn from_libc(ts: libc::timespec) -> Self {
        Self {
            sec: ts.tv_sec as i64,
            nsec: ts.tv_nsec as u32,
        }
    }
}

impl fmt::Display for Timespec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}

/// Time source used by the scheduler.
///
/// The production implementation is [`MonotonicClock`]; tests substitute a
/// deterministic clock to exercise the deadline arithmetic.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timespec;

    /// Blocks until `deadline`. Returns immediately if it has already passed.
    fn sleep_until(&self, deadline: Timespec);

    /// Clock tick in nanoseconds, never zero.
    fn resolution(&self) -> u64;
}

/// `CLOCK_MONOTONIC` backed clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Timespec {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: `ts` is a valid, writable timespec.
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        }
        Timespec::from_libc(ts)
    }

    #[cfg(target_os = "linux")]
    fn sleep_until(&self, deadline: Timespec) {
        let target = deadline.to_libc();
        loop {
            // SAFETY: `target` outlives the call; the remainder pointer may be
            // null for absolute sleeps.
            let rc = unsafe {
                libc::clock_nanosleep(
                    libc::CLOCK_MONOTONIC,
                    libc::TIMER_ABSTIME,
                    &target,
                    std::ptr::null_mut(),
                )
            };
            if rc != libc::EINTR {
                break;
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn sleep_until(&self, deadline: Timespec) {
        let now = self.now();
        if deadline > now {
            std::thread::sleep(std::time::Duration::from_nanos(
                deadline.saturating_nanos_since(now),
            ));
        }
    }

    fn resolution(&self) -> u64 {
        let mut res = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: `res` is a valid, writable timespec.
        let rc = unsafe { libc::clock_getres(libc::CLOCK_MONOTONIC, &mut res) };
        if rc != 0 {
            return 1;
        }
        Timespec::from_libc(res).as_nanos().max(1)
    }
}

/// Process-wide scheduling quantum. Written once, read by every task.
#[derive(Debug, Default)]
pub struct TimeBase {
    period: AtomicU64,
}

impl TimeBase {
    pub const fn new() -> Self {
        Self {
            period: AtomicU64::new(0),
        }
    }

    /// Current quantum in nanoseconds, zero while unset.
    pub fn period(&self) -> u64 {
        self.period.load(Ordering::Acquire)
    }

    /// Sets the quantum once.
    ///
    /// `nsec == 0` queries the current value. The request is truncated to a
    /// multiple of `resolution`, but never below one tick. A second nonzero
    /// request fails with [`RtapiError::AlreadySet`] and leaves the first
    /// value in place.
    pub fn set(&self, nsec: u64, resolution: u64) -> RtapiResult<u64> {
        if nsec == 0 {
            return Ok(self.period());
        }
        let res = resolution.max(1);
        let quantum = match (nsec / res) * res {
            0 => res,
            q => q,
        };
        match self
            .period
            .compare_exchange(0, quantum, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                debug!("clock period set (res={res}) -> {quantum}");
                Ok(quantum)
            }
            Err(current) => {
                error!("attempt to set period twice (current={current}, requested={nsec})");
                Err(RtapiError::AlreadySet { current })
            }
        }
    }

    /// Rounds `requested` up to a positive multiple of the quantum.
    pub fn quantize(&self, requested: u64) -> RtapiResult<u64> {
        let base = self.period();
        if base == 0 {
            return Err(RtapiError::TimeBaseUnset);
        }
        let ratio = requested.div_ceil(base).max(1);
        ratio
            .checked_mul(base)
            .ok_or_else(|| RtapiError::InvalidArgument(format!("period {requested} overflows")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_carries_into_seconds() {
        let mut ts = Timespec::new(5, 999_000_000);
        ts.advance(1_000_000);
        assert_eq!(ts, Timespec::new(6, 0));

        let mut ts = Timespec::new(1, 500_000_000);
        ts.advance(2_700_000_000);
        assert_eq!(ts, Timespec::new(4, 200_000_000));
    }

    #[test]
    fn ordering_compares_seconds_first() {
        assert!(Timespec::new(2, 0) > Timespec::new(1, 999_999_999));
        assert!(Timespec::new(1, 10) > Timespec::new(1, 9));
        assert_eq!(Timespec::from_nanos(1_500_000_000), Timespec::new(1, 500_000_000));
    }

    #[test]
    fn time_base_is_write_once() {
        let base = TimeBase::new();
        assert_eq!(base.set(0, 1).unwrap(), 0);
        assert_eq!(base.set(1_000_000, 1).unwrap(), 1_000_000);
        assert!(matches!(
            base.set(2_000_000, 1),
            Err(RtapiError::AlreadySet { current: 1_000_000 })
        ));
        assert_eq!(base.set(0, 1).unwrap(), 1_000_000);
    }

    #[test]
    fn time_base_rounds_to_resolution() {
        let base = TimeBase::new();
        assert_eq!(base.set(25_500, 1_000).unwrap(), 25_000);

        let tiny = TimeBase::new();
        assert_eq!(tiny.set(300, 1_000).unwrap(), 1_000);
    }

    #[test]
    fn quantize_rounds_up_to_multiple() {
        let base = TimeBase::new();
        assert!(matches!(base.quantize(10), Err(RtapiError::TimeBaseUnset)));

        base.set(1_000_000, 1).unwrap();
        assert_eq!(base.quantize(1).unwrap(), 1_000_000);
        assert_eq!(base.quantize(500_000).unwrap(), 1_000_000);
        assert_eq!(base.quantize(3_000_000).unwrap(), 3_000_000);
        assert_eq!(base.quantize(3_000_001).unwrap(), 4_000_000);
    }

    #[test]
    fn monotonic_clock_moves_forward() {
        let clock = MonotonicClock;
        let a = clock.now();
        clock.sleep_until(a.advanced(1_000_000));
        let b = clock.now();
        assert!(b >= a.advanced(1_000_000));
        assert!(clock.resolution() >= 1);
    }
}
