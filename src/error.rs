//! Kernel-wide error codes.

use core::fmt;

use crate::port::Port;

/// The outcome codes every blocking and non-blocking kernel call can
/// return, beyond the ordinary success case folded into `Result::Ok`.
///
/// Contractual names; the discriminants themselves are not part of any
/// external contract and may be renumbered freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// A null primitive or item pointer, or another malformed argument.
    /// Checked with `debug_assert!` in debug builds; returned to the
    /// caller in release builds (§7).
    InvalidArg,
    /// A finite wait budget elapsed before the call could complete.
    Timeout,
    /// A non-blocking take/receive found nothing available.
    Empty,
    /// A non-blocking give/send found no room.
    Full,
    /// A wait queue had no eligible waiter to wake.
    NoTask,
    /// A non-blocking call found the primitive held by someone else.
    Busy,
    /// `unlock` was called by a task that does not own the mutex.
    NotOwner,
    /// `unlock` was called on a mutex that is not locked.
    NotLocked,
    /// `stop` was called on a timer that is not running.
    NotActive,
    /// `start` was called on a timer that is already running.
    AlreadyActive,
    /// `resume` was called on a task that is not SUSPENDED.
    NotSuspended,
    /// `give` found the semaphore already at `max_count`.
    NoSemaphore,
    /// Node or slot storage was exhausted (§7, Resource exhaustion).
    NoMemory,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Error::InvalidArg => "invalid argument",
            Error::Timeout => "timed out",
            Error::Empty => "empty",
            Error::Full => "full",
            Error::NoTask => "no eligible task",
            Error::Busy => "busy",
            Error::NotOwner => "not the owner",
            Error::NotLocked => "not locked",
            Error::NotActive => "not active",
            Error::AlreadyActive => "already active",
            Error::NotSuspended => "not suspended",
            Error::NoSemaphore => "no semaphore slot",
            Error::NoMemory => "out of memory",
        };
        f.write_str(s)
    }
}

pub type KernelResult<T = ()> = Result<T, Error>;

/// Halts after logging. Reserved for the two conditions §7 calls
/// genuinely fatal: stack overflow and node/slot table exhaustion. Every
/// other error is returned to the caller, never escalated here.
#[cold]
pub(crate) fn fatal<P: Port>(msg: &str) -> ! {
    log::error!("rtkernel: fatal: {}", msg);
    P::halt(msg)
}
