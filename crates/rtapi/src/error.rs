//! Error taxonomy for the scheduler.
//!
//! Every fallible call returns an [`RtapiError`]. Callers that only care about
//! the broad class of failure use [`RtapiError::kind`]; callers that speak the
//! integer-id protocol of the wiring layer use [`RtapiError::errno`].

use thiserror::Error;

/// Result type used throughout the crate.
pub type RtapiResult<T> = Result<T, RtapiError>;

/// Broad failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No free slot, or memory could not be obtained.
    ResourceExhausted,
    /// The id does not name a live module or task.
    InvalidHandle,
    /// A parameter was rejected before any state changed.
    InvalidArgument,
    /// The OS refused to create or configure a real-time thread.
    SchedulingError,
    /// The operation exists only for API compatibility.
    NotImplemented,
}

#[derive(Debug, Error)]
pub enum RtapiError {
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("invalid handle {0}")]
    InvalidHandle(i64),

    #[error("invalid priority {priority} (lowest={lowest} highest={highest})")]
    InvalidPriority {
        priority: i32,
        lowest: i32,
        highest: i32,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("time base already set to {current} ns")]
    AlreadySet { current: u64 },

    #[error("time base has not been set")]
    TimeBaseUnset,

    #[error("scheduling error: {0}")]
    Scheduling(String),

    #[error("{0} is not implemented")]
    NotImplemented(&'static str),
}

impl RtapiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Self::InvalidHandle(_) => ErrorKind::InvalidHandle,
            Self::InvalidPriority { .. }
            | Self::InvalidArgument(_)
            | Self::AlreadySet { .. }
            | Self::TimeBaseUnset => ErrorKind::InvalidArgument,
            Self::Scheduling(_) => ErrorKind::SchedulingError,
            Self::NotImplemented(_) => ErrorKind::NotImplemented,
        }
    }

    /// Negative errno equivalent, for callers that pass integer status codes.
    pub fn errno(&self) -> i32 {
        let code = match self.kind() {
            ErrorKind::ResourceExhausted => libc::ENOMEM,
            ErrorKind::InvalidHandle | ErrorKind::InvalidArgument => libc::EINVAL,
            ErrorKind::SchedulingError => libc::EPERM,
            ErrorKind::NotImplemented => libc::ENOSYS,
        };
        -code
    }

    pub(crate) fn os(context: &str, err: std::io::Error) -> Self {
        Self::Scheduling(format!("{context}: {err}"))
    }
}
