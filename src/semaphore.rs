//! Counting semaphore (§4.7).

use crate::error::{Error, KernelResult};
use crate::port::Port;
use crate::sched;
use crate::spinlock::Spinlock;
use crate::task::{BlockReason, WakeReason};
use crate::time::Ticks;
use crate::wait::WaitQueue;

struct State {
    count: u32,
    max_count: u32,
}

/// A counting semaphore with a cap (§4.7). Statically declared, never
/// destroyed.
pub struct Semaphore<P: Port> {
    name: &'static str,
    state: Spinlock<State>,
    wait_queue: WaitQueue<P>,
}

unsafe impl<P: Port> Sync for Semaphore<P> {}

impl<P: Port> Semaphore<P> {
    #[inline]
    pub const fn new(name: &'static str, initial_count: u32, max_count: u32) -> Self {
        Semaphore {
            name,
            state: Spinlock::new(State {
                count: initial_count,
                max_count,
            }),
            wait_queue: WaitQueue::new(),
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// `take(sem, wait_ticks)` (§4.7). Only `wait_ticks == 0` may be used
    /// from an ISR.
    pub fn take(&'static self, wait: Ticks) -> KernelResult {
        loop {
            let mut guard = self.state.lock::<P>();
            if guard.count > 0 {
                guard.count -= 1;
                return Ok(());
            }
            drop(guard);

            if wait.is_zero() {
                return Err(Error::Busy);
            }

            match self.wait_queue.block(BlockReason::WaitForSemaphore, wait) {
                WakeReason::SemaphoreTaken => return Ok(()),
                WakeReason::WaitTimeout => return Err(Error::Timeout),
                WakeReason::Resume => continue,
                _ => return Err(Error::InvalidArg),
            }
        }
    }

    /// Non-blocking `take(sem, 0)`.
    #[inline]
    pub fn try_take(&'static self) -> KernelResult {
        self.take(Ticks::ZERO)
    }

    /// `give(sem)` (§4.7). The "direct transfer" policy: when a waiter is
    /// woken, `count` is left unchanged rather than incremented then
    /// immediately decremented (§9, Ambiguous source behavior).
    pub fn give(&'static self) -> KernelResult {
        let caller = sched::current_task::<P>();

        // Held across the wake: primitive lock -> scheduler lock is the
        // permitted nesting order (§5, Shared-resource policy), and
        // holding it throughout is what keeps the check-then-act
        // sequence atomic under SMP.
        let mut guard = self.state.lock::<P>();
        if guard.count == guard.max_count {
            return Err(Error::NoSemaphore);
        }

        match self.wait_queue.wake_one(WakeReason::SemaphoreTaken) {
            Some(waiter) => {
                drop(guard);
                if waiter.effective_priority() <= caller.effective_priority() {
                    sched::yield_now::<P>();
                }
            }
            None => {
                guard.count += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
impl<P: Port> Semaphore<P> {
    pub(crate) fn wait_tag_for_test(&self) -> usize {
        self.wait_queue.tag_for_test()
    }

    pub(crate) fn count_for_test(&self) -> u32 {
        self.state.lock::<P>().count
    }
}
