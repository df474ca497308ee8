//! Real-time priority range.
//!
//! Task priorities are `SCHED_FIFO` priorities: larger numbers preempt
//! smaller ones. The feasible range is whatever the OS reports for the FIFO
//! class (1..=99 on Linux).

use crate::error::{RtapiError, RtapiResult};

/// Highest feasible real-time priority.
pub fn prio_highest() -> i32 {
    // SAFETY: plain query with a valid policy constant.
    unsafe { libc::sched_get_priority_max(libc::SCHED_FIFO) }
}

/// Lowest feasible real-time priority.
pub fn prio_lowest() -> i32 {
    // SAFETY: plain query with a valid policy constant.
    unsafe { libc::sched_get_priority_min(libc::SCHED_FIFO) }
}

/// Next priority above `prio`, clamped to the feasible range.
pub fn prio_next_higher(prio: i32) -> i32 {
    let (lowest, highest) = (prio_lowest(), prio_highest());
    if prio >= highest {
        highest
    } else if prio < lowest {
        lowest
    } else {
        prio + 1
    }
}

/// Next priority below `prio`, clamped to the feasible range.
pub fn prio_next_lower(prio: i32) -> i32 {
    let (lowest, highest) = (prio_lowest(), prio_highest());
    if prio <= lowest {
        lowest
    } else if prio > highest {
        highest
    } else {
        prio - 1
    }
}

/// Checks `prio` against the feasible range.
pub fn validate(prio: i32) -> RtapiResult<i32> {
    let (lowest, highest) = (prio_lowest(), prio_highest());
    if prio < lowest || prio > highest {
        return Err(RtapiError::InvalidPriority {
            priority: prio,
            lowest,
            highest,
        });
    }
    Ok(prio)
}
