//! Condition variable (§4.9).

use crate::error::{Error, KernelResult};
use crate::mutex::RawMutex;
use crate::port::Port;
use crate::sched;
use crate::spinlock::Spinlock;
use crate::task::{BlockReason, WakeReason};
use crate::time::Ticks;
use crate::wait::WaitQueue;

/// A condition variable, always paired at construction with the mutex
/// the caller must hold across `wait` (§3, Condition variable; §4.9).
/// Statically declared, never destroyed.
pub struct RawCondVar<P: Port> {
    name: &'static str,
    mutex: &'static RawMutex<P>,
    /// §3's "spinlock word" for this primitive. Held across `wait`'s
    /// mutex-unlock-then-enqueue and across `signal`/`broadcast`'s pop
    /// (§4.9: "under cv spinlock, unlock the associated mutex, enqueue
    /// caller in cv wait queue, release cv spinlock, then block"),
    /// closing the window in which a task freshly handed the mutex could
    /// run and call `signal` before the waiter is actually enqueued.
    lock: Spinlock<()>,
    wait_queue: WaitQueue<P>,
}

/// The public name applications declare (`cond_var!` in `cfg.rs`).
pub type CondVar<P> = RawCondVar<P>;

unsafe impl<P: Port> Sync for RawCondVar<P> {}

impl<P: Port> RawCondVar<P> {
    #[inline]
    pub const fn new(name: &'static str, mutex: &'static RawMutex<P>) -> Self {
        RawCondVar {
            name,
            mutex,
            lock: Spinlock::new(()),
            wait_queue: WaitQueue::new(),
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// `wait(cv, wait_ticks)` (§4.9). The caller must hold the
    /// associated mutex. Predicate re-check after return is the
    /// caller's responsibility — spurious wakeups are possible whenever
    /// the retry loop below re-enqueues on `RESUME`.
    pub fn wait(&'static self, wait: Ticks) -> KernelResult {
        {
            let guard = self.lock.lock::<P>();
            self.mutex.unlock()?;
            self.wait_queue.enqueue(BlockReason::WaitForCondVar, wait);
            drop(guard);
        }

        loop {
            match self.wait_queue.park() {
                WakeReason::CondVarSignalled => {
                    self.mutex.lock(Ticks::FOREVER)?;
                    return Ok(());
                }
                WakeReason::WaitTimeout => {
                    self.mutex.lock(Ticks::FOREVER)?;
                    return Err(Error::Timeout);
                }
                WakeReason::Resume => {
                    let guard = self.lock.lock::<P>();
                    self.wait_queue.enqueue(BlockReason::WaitForCondVar, wait);
                    drop(guard);
                }
                _ => {
                    self.mutex.lock(Ticks::FOREVER)?;
                    return Err(Error::InvalidArg);
                }
            }
        }
    }

    /// `signal(cv)` (§4.9). Wakes the single highest-priority eligible
    /// waiter. `Err(NoTask)` if none is waiting.
    pub fn signal(&'static self) -> KernelResult {
        let caller = sched::current_task::<P>();

        let guard = self.lock.lock::<P>();
        let woken = self.wait_queue.wake_one(WakeReason::CondVarSignalled);
        drop(guard);

        match woken {
            Some(waiter) => {
                if waiter.effective_priority() <= caller.effective_priority() {
                    sched::yield_now::<P>();
                }
                Ok(())
            }
            None => Err(Error::NoTask),
        }
    }

    /// `broadcast(cv)` (§4.9). Wakes every eligible waiter, draining via
    /// repeated `get` (§9, Ambiguous source behavior — this spec prefers
    /// drain-via-get for clarity over the revision that nulls queue slots
    /// in a loop; both reach the same final state). `Err(NoTask)` if the
    /// wait queue was empty. Each pop is its own lock acquisition, same
    /// as `signal` — nothing requires the whole drain to be one atomic
    /// step, only each individual pop against a concurrent `wait`.
    pub fn broadcast(&'static self) -> KernelResult {
        let caller = sched::current_task::<P>();
        let mut should_yield = false;
        let mut woke_any = false;

        loop {
            let guard = self.lock.lock::<P>();
            let woken = self.wait_queue.wake_one(WakeReason::CondVarSignalled);
            drop(guard);

            match woken {
                Some(waiter) => {
                    woke_any = true;
                    if waiter.effective_priority() <= caller.effective_priority() {
                        should_yield = true;
                    }
                }
                None => break,
            }
        }

        if !woke_any {
            return Err(Error::NoTask);
        }
        if should_yield {
            sched::yield_now::<P>();
        }
        Ok(())
    }
}

#[cfg(test)]
impl<P: Port> RawCondVar<P> {
    pub(crate) fn wait_tag_for_test(&self) -> usize {
        self.wait_queue.tag_for_test()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutex::RawMutex;
    use crate::priority::Priority;
    use crate::task::{Affinity, TaskState};
    use crate::testing::{begin_test, block_waiter, new_task, spawn_task, MockPort};

    #[test]
    fn signal_on_an_empty_wait_queue_reports_no_task() {
        let _g = begin_test();
        spawn_task("t", Priority::new(1), Affinity::Any);
        static M: RawMutex<MockPort> = RawMutex::new("m");
        static CV: RawCondVar<MockPort> = RawCondVar::new("cv", &M);

        assert_eq!(CV.signal(), Err(Error::NoTask));
        assert_eq!(CV.broadcast(), Err(Error::NoTask));
    }

    #[test]
    fn signal_wakes_a_single_queued_waiter() {
        let _g = begin_test();
        // Higher priority than `a`/`b`, so waking one of them doesn't
        // also preempt `t`.
        spawn_task("t", Priority::new(1), Affinity::Any);
        static M: RawMutex<MockPort> = RawMutex::new("m");
        static CV: RawCondVar<MockPort> = RawCondVar::new("cv", &M);
        let a = new_task("a", Priority::new(3), Affinity::Any);
        let b = new_task("b", Priority::new(4), Affinity::Any);
        block_waiter(a, BlockReason::WaitForCondVar, CV.wait_tag_for_test());
        block_waiter(b, BlockReason::WaitForCondVar, CV.wait_tag_for_test());

        CV.signal().unwrap();
        assert_eq!(a.state(), TaskState::Ready);
        assert_eq!(b.state(), TaskState::Blocked);
    }

    #[test]
    fn broadcast_wakes_every_queued_waiter() {
        let _g = begin_test();
        spawn_task("t", Priority::new(1), Affinity::Any);
        static M: RawMutex<MockPort> = RawMutex::new("m");
        static CV: RawCondVar<MockPort> = RawCondVar::new("cv", &M);
        let a = new_task("a", Priority::new(3), Affinity::Any);
        let b = new_task("b", Priority::new(4), Affinity::Any);
        block_waiter(a, BlockReason::WaitForCondVar, CV.wait_tag_for_test());
        block_waiter(b, BlockReason::WaitForCondVar, CV.wait_tag_for_test());

        CV.broadcast().unwrap();
        assert_eq!(a.state(), TaskState::Ready);
        assert_eq!(b.state(), TaskState::Ready);
        assert_eq!(a.wake_reason(), WakeReason::CondVarSignalled);
        assert_eq!(b.wake_reason(), WakeReason::CondVarSignalled);
    }

    #[test]
    fn wait_unlocks_before_blocking_and_relocks_before_returning() {
        let _g = begin_test();
        spawn_task("t", Priority::new(5), Affinity::Any);
        static M: RawMutex<MockPort> = RawMutex::new("m");
        static CV: RawCondVar<MockPort> = RawCondVar::new("cv", &M);

        M.lock(Ticks::ZERO).unwrap();
        // The mock never truly suspends execution, so `wait` falls
        // through its spurious-wake arm here rather than returning via
        // `CondVarSignalled` — see `testing.rs`'s module doc comment.
        // What's under test is that the mutex is unlocked across the
        // call and re-locked by the time it returns either way.
        let _ = CV.wait(Ticks::new(5));
        assert_eq!(M.try_lock(), Err(Error::Busy));
    }
}
