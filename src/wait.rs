//! The wait-queue abstraction shared by every blocking primitive.
//!
//! Spec.md gives each primitive its own "wait queue" field (§4.6-§4.9),
//! but its own Design Notes insist a task carries only one intrusive
//! link because it "is in at most one scheduling queue or one primitive
//! wait queue at a time" (§9). Read together, those two statements
//! describe a single task-queue membership, not two: a task blocked on a
//! primitive occupies the scheduler's one `blocked_queue` (§3, Task pool:
//! blocked_queue holds tasks "awaiting timeout or resource"), tagged with
//! which primitive it is waiting for. `WaitQueue` is that tag plus the
//! priority-ordered enqueue/pop operations a primitive needs, without
//! owning any storage of its own — `sched::SchedState`'s blocked queue is
//! the only linked list involved, which is what lets the tick handler
//! walk one queue to decrement every blocked task's timeout (§4.4)
//! regardless of why it is blocked.

use core::marker::PhantomData;

use crate::port::Port;
use crate::sched;
use crate::task::{BlockReason, Task, WakeReason};
use crate::time::Ticks;

/// A priority-ordered wait list logically owned by one primitive
/// instance. Zero-sized: the actual task references live in the
/// scheduler's shared blocked queue, tagged with this `WaitQueue`'s
/// address.
pub struct WaitQueue<P: Port> {
    _marker: PhantomData<fn() -> P>,
}

impl<P: Port> WaitQueue<P> {
    #[inline]
    pub const fn new() -> Self {
        WaitQueue {
            _marker: PhantomData,
        }
    }

    #[inline]
    fn tag(&self) -> usize {
        self as *const Self as usize
    }

    /// The address-identity used to tag waiters on the scheduler's
    /// shared blocked queue. Test-only: lets a test fabricate a blocked
    /// waiter for this exact queue without driving a real blocking call
    /// to completion (see `testing.rs`'s module doc comment).
    #[cfg(test)]
    pub(crate) fn tag_for_test(&self) -> usize {
        self.tag()
    }

    /// Tag the calling task as a waiter on this primitive, block it with
    /// `reason` for up to `wait` ticks, and return its wakeup reason once
    /// rescheduled.
    pub(crate) fn block(&self, reason: BlockReason, wait: Ticks) -> WakeReason {
        self.enqueue(reason, wait);
        self.park()
    }

    /// Tag the calling task as a waiter on this primitive and mark it
    /// BLOCKED, without yet triggering a context switch. Lets a caller
    /// that holds its own lock across the enqueue (`condvar.rs`'s `wait`)
    /// release that lock before actually parking, instead of across it.
    pub(crate) fn enqueue(&self, reason: BlockReason, wait: Ticks) {
        let task = sched::current_task::<P>();
        task.set_wait_tag(Some(self.tag()));
        sched::enqueue_blocked::<P>(reason, wait);
    }

    /// The second half of `block`: reschedule and wait to be woken.
    pub(crate) fn park(&self) -> WakeReason {
        sched::park_current::<P>()
    }

    /// Pop the highest-priority eligible waiter on this primitive and
    /// mark it READY with `reason`.
    pub(crate) fn wake_one(&self, reason: WakeReason) -> Option<&'static Task<P>> {
        sched::wake_waiter::<P>(self.tag(), reason)
    }
}
