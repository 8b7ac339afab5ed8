//! Mutex with priority inheritance (§4.6).

use core::cell::Cell;
use core::ptr::NonNull;

use crate::error::{Error, KernelResult};
use crate::port::Port;
use crate::sched;
use crate::spinlock::Spinlock;
use crate::task::{BlockReason, Task, WakeReason};
use crate::time::Ticks;
use crate::wait::WaitQueue;

struct State<P: Port> {
    owner: Option<NonNull<Task<P>>>,
}

/// A mutex guarding mutual exclusion with (optionally) priority
/// inheritance: while a higher-priority task waits on a lower-priority
/// owner, the owner is temporarily boosted to the waiter's priority, and
/// restored on unlock (§4.6). Statically declared, never destroyed
/// (§3, Lifecycle).
pub struct RawMutex<P: Port> {
    name: &'static str,
    state: Spinlock<State<P>>,
    wait_queue: WaitQueue<P>,
    /// Links this mutex into the owning task's singly linked list of
    /// held mutexes (`Task::held_mutex`), used only to detect and warn on
    /// abandonment (§B). Not protected by `state`'s lock: mutated only
    /// by the owning task itself, while it is the only task that can be
    /// mutating this particular link.
    next_held: Cell<Option<NonNull<RawMutex<P>>>>,
}

/// The public name applications declare (`mutex!` in `cfg.rs`).
pub type Mutex<P> = RawMutex<P>;

// Safety: `state` is only touched under its own spinlock; `next_held` is
// only touched by the task that currently owns this mutex.
unsafe impl<P: Port> Sync for RawMutex<P> {}

impl<P: Port> RawMutex<P> {
    #[inline]
    pub const fn new(name: &'static str) -> Self {
        RawMutex {
            name,
            state: Spinlock::new(State { owner: None }),
            wait_queue: WaitQueue::new(),
            next_held: Cell::new(None),
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn next_held(&self) -> Option<NonNull<RawMutex<P>>> {
        self.next_held.get()
    }

    pub(crate) fn set_next_held(&self, next: Option<NonNull<RawMutex<P>>>) {
        self.next_held.set(next);
    }

    /// `lock(mutex, wait_ticks)` (§4.6). Not callable from ISR context
    /// (§4.6, "Cannot be called from an ISR").
    pub fn lock(&'static self, wait: Ticks) -> KernelResult {
        loop {
            let caller = sched::current_task::<P>();
            let mut guard = self.state.lock::<P>();

            match guard.owner {
                Some(owner_ptr) => {
                    // Safety: every owner pointer names a live `'static`
                    // task.
                    let owner = unsafe { owner_ptr.as_ref() };

                    #[cfg(feature = "priority_inheritance")]
                    if caller.effective_priority() < owner.effective_priority() {
                        owner.boost_to(caller.effective_priority());
                        drop(guard);
                        sched::reprioritize::<P>(owner);
                    } else {
                        drop(guard);
                    }
                    #[cfg(not(feature = "priority_inheritance"))]
                    drop(guard);

                    if wait.is_zero() {
                        return Err(Error::Busy);
                    }

                    match self.wait_queue.block(BlockReason::WaitForMutex, wait) {
                        WakeReason::MutexLocked => return Ok(()),
                        WakeReason::WaitTimeout => return Err(Error::Timeout),
                        WakeReason::Resume => continue,
                        _ => return Err(Error::InvalidArg),
                    }
                }
                None => {
                    guard.owner = Some(NonNull::from(caller));
                    drop(guard);
                    caller.push_held_mutex(NonNull::from(self));
                    return Ok(());
                }
            }
        }
    }

    /// Non-blocking `lock(mutex, 0)`.
    #[inline]
    pub fn try_lock(&'static self) -> KernelResult {
        self.lock(Ticks::ZERO)
    }

    /// `unlock(mutex)` (§4.6). Only the owner may unlock.
    pub fn unlock(&'static self) -> KernelResult {
        let caller = sched::current_task::<P>();

        {
            let guard = self.state.lock::<P>();
            match guard.owner {
                Some(owner_ptr) if owner_ptr == NonNull::from(caller) => {}
                Some(_) => return Err(Error::NotOwner),
                None => return Err(Error::NotLocked),
            }
        }

        caller.remove_held_mutex(NonNull::from(self));

        #[cfg(feature = "priority_inheritance")]
        {
            caller.restore_priority();
            sched::reprioritize::<P>(caller);
        }

        // Clearing ownership and transferring it to a queued waiter (or
        // leaving it clear) must happen under one continuous hold of
        // `state`'s lock: between the two, the mutex would otherwise be
        // observably unlocked, letting a concurrent zero-wait `lock` on
        // another core claim it too before being silently overwritten
        // here (§5, "all state mutations... are linearizable").
        let mut guard = self.state.lock::<P>();
        guard.owner = None;
        let transferred = self.wait_queue.wake_one(WakeReason::MutexLocked);
        if let Some(waiter) = transferred {
            guard.owner = Some(NonNull::from(waiter));
        }
        drop(guard);

        if let Some(waiter) = transferred {
            waiter.push_held_mutex(NonNull::from(self));
            if waiter.effective_priority() <= caller.effective_priority() {
                sched::yield_now::<P>();
            }
        }

        Ok(())
    }
}

/// Force-release every mutex `task` currently owns, transferring each to
/// its highest-priority waiter (or clearing it if none), and restore
/// `task`'s own priority if it had been boosted. Called when a task
/// holding a mutex is suspended (§B; spec.md does not model this
/// directly, but an abandoned lock with no release path would wedge
/// every future waiter).
pub(crate) fn abandon_held_mutexes<P: Port>(task: &'static Task<P>) {
    while let Some(mutex_ptr) = task.take_held_mutex_head() {
        // Safety: every linked node is a live `'static` mutex.
        let mutex = unsafe { mutex_ptr.as_ref() };
        log::warn!(
            "rtkernel: task '{}' abandoned mutex '{}' while suspended",
            task.name(),
            mutex.name(),
        );

        let mut guard = mutex.state.lock::<P>();
        guard.owner = None;
        let transferred = mutex.wait_queue.wake_one(WakeReason::MutexLocked);
        if let Some(waiter) = transferred {
            guard.owner = Some(NonNull::from(waiter));
        }
        drop(guard);

        if let Some(waiter) = transferred {
            waiter.push_held_mutex(NonNull::from(mutex));
        }
    }

    #[cfg(feature = "priority_inheritance")]
    task.restore_priority();
}

#[cfg(test)]
impl<P: Port> RawMutex<P> {
    pub(crate) fn wait_tag_for_test(&self) -> usize {
        self.wait_queue.tag_for_test()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::priority::Priority;
    use crate::task::{Affinity, TaskState};
    use crate::testing::{begin_test, block_waiter, new_task, spawn_task, MockPort};

    #[test]
    fn lock_and_unlock_round_trip_uncontended() {
        let _g = begin_test();
        static M: RawMutex<MockPort> = RawMutex::new("m");
        spawn_task("owner", Priority::new(5), Affinity::Any);

        M.lock(Ticks::ZERO).unwrap();
        M.unlock().unwrap();
    }

    #[test]
    fn try_lock_reports_busy_when_already_held() {
        let _g = begin_test();
        static M: RawMutex<MockPort> = RawMutex::new("m");
        spawn_task("owner", Priority::new(5), Affinity::Any);

        M.lock(Ticks::ZERO).unwrap();
        assert_eq!(M.try_lock(), Err(Error::Busy));
    }

    #[test]
    fn unlock_by_non_owner_then_again_is_rejected() {
        let _g = begin_test();
        static M: RawMutex<MockPort> = RawMutex::new("m");
        spawn_task("owner", Priority::new(5), Affinity::Any);

        M.lock(Ticks::ZERO).unwrap();
        assert_eq!(M.unlock(), Ok(()));
        assert_eq!(M.unlock(), Err(Error::NotLocked));
    }

    #[test]
    fn unlock_transfers_ownership_to_queued_waiter() {
        let _g = begin_test();
        static M: RawMutex<MockPort> = RawMutex::new("m");
        spawn_task("owner", Priority::new(1), Affinity::Any);
        // Lower priority (higher number) than `owner`, so waking it
        // doesn't also preempt `owner` off the core — keeps this test
        // focused on ownership transfer, not dispatch.
        let waiter = new_task("waiter", Priority::new(10), Affinity::Any);

        M.lock(Ticks::ZERO).unwrap();
        block_waiter(waiter, BlockReason::WaitForMutex, M.wait_tag_for_test());

        M.unlock().unwrap();
        assert_eq!(waiter.state(), TaskState::Ready);
    }

    #[cfg(feature = "priority_inheritance")]
    #[test]
    fn contended_try_lock_boosts_the_owner_to_the_callers_priority() {
        let _g = begin_test();
        static M: RawMutex<MockPort> = RawMutex::new("m");
        let owner = spawn_task("owner", Priority::new(10), Affinity::Any);
        M.lock(Ticks::ZERO).unwrap();

        let high = spawn_task("high", Priority::new(1), Affinity::Any);
        assert_eq!(owner.effective_priority(), owner.base_priority());

        assert_eq!(M.try_lock(), Err(Error::Busy));
        assert_eq!(owner.effective_priority(), high.effective_priority());
    }
}
