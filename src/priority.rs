//! Task priority.

use core::fmt;

/// A task priority: `0` is the highest priority a task may hold, `255`
/// (`Priority::IDLE`) is reserved for the kernel's own idle tasks.
///
/// Lower numeric value always means higher priority, matching the
/// convention of the scheduler's comparisons throughout this crate.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(u8);

impl Priority {
    /// Reserved for the per-core idle tasks. No application task may be
    /// declared at this priority.
    pub const IDLE: Priority = Priority(255);

    /// The highest priority a task can hold.
    pub const HIGHEST: Priority = Priority(0);

    #[inline]
    pub const fn new(level: u8) -> Self {
        Priority(level)
    }

    #[inline]
    pub const fn get(self) -> u8 {
        self.0
    }

    #[inline]
    pub(crate) fn is_idle(self) -> bool {
        self.0 == Self::IDLE.0
    }
}

impl fmt::Debug for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Priority({})", self.0)
    }
}

impl From<u8> for Priority {
    #[inline]
    fn from(level: u8) -> Self {
        Priority(level)
    }
}

#[cfg(test)]
mod tests {
    use super::Priority;

    #[test]
    fn lower_number_is_higher_priority() {
        assert!(Priority::new(0) < Priority::new(1));
        assert!(Priority::HIGHEST < Priority::new(1));
        assert!(Priority::new(254) < Priority::IDLE);
    }

    #[test]
    fn idle_is_reserved_at_255() {
        assert_eq!(Priority::IDLE.get(), 255);
        assert!(Priority::IDLE.is_idle());
        assert!(!Priority::new(254).is_idle());
    }
}
