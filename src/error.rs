/*
 * error.rs
 *
 * Every failure the reactor can report. Errors are synchronous returns,
 * never deferred into callbacks - a callback's own failure is the user's
 * concern, not ours.
 *
 * Backend errors carry the errno so callers can tell EBADF from ENOMEM.
 */

use core::fmt;

/* everything that can go wrong */
#[derive(Debug)]
pub enum ReactorError {
    /// Bad mask combination (e.g. SIGNAL together with READ/WRITE),
    /// priority out of range, add on a handle that does not allow it.
    InvalidArgument(&'static str),
    /// `dispatch` called while the loop is already running on this reactor.
    LoopRunning,
    /// `priority_init` after callbacks were activated, or n out of 1..=255.
    PriorityTooLate,
    /// More than 256 distinct common-timeout durations on one reactor.
    TooManyCommonTimeouts,
    /// Event handle no longer refers to a live slot (reactor torn down
    /// or the event was finalized).
    Stale,
    /// No usable backend after config/environment filtering.
    NoBackend,
    /// The kernel said no. Carries the failing call and errno.
    Backend(&'static str, i32),
    /// pipe/eventfd/fcntl failure while building internal plumbing.
    Plumbing(&'static str, i32),
    /// sigaction or signal-pipe failure.
    Signal(i32),
}

impl fmt::Display for ReactorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(what) => write!(f, "invalid argument: {what}"),
            Self::LoopRunning => write!(f, "dispatch re-entered while loop is running"),
            Self::PriorityTooLate => {
                write!(f, "priority_init: bad count or called after activation")
            }
            Self::TooManyCommonTimeouts => {
                write!(f, "too many common-timeout durations (max 256)")
            }
            Self::Stale => write!(f, "event handle refers to a dead slot"),
            Self::NoBackend => write!(f, "no event-notification backend available"),
            Self::Backend(call, errno) => write!(f, "backend {call} failed: errno {errno}"),
            Self::Plumbing(what, errno) => write!(f, "{what} failed: errno {errno}"),
            Self::Signal(errno) => write!(f, "signal setup failed: errno {errno}"),
        }
    }
}

impl std::error::Error for ReactorError {}

pub type Result<T> = core::result::Result<T, ReactorError>;

/* grab errno right after a failed libc call */
#[inline]
pub(crate) fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
