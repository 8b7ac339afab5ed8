//! The cross-core synchronization primitive (§4.2).
//!
//! Every primitive (mutex, semaphore, message queue, condition variable)
//! owns its own [`Spinlock`] instance, and the scheduler owns a distinct
//! one guarding the ready/blocked queues and `current`/`next` (§5, Shared-
//! resource policy). Nested locking follows a strict order — primitive
//! lock, then scheduler lock, never the reverse — enforced by convention
//! at the call sites in `mutex.rs`, `semaphore.rs`, `msgqueue.rs` and
//! `condvar.rs` rather than by the type system.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

use crate::port::{IrqState, Port};

/// A word-plus-data cell guarded by disabling local interrupts and,
/// under the `smp` feature, additionally spinning on an atomic
/// compare-and-swap (§4.2).
pub struct Spinlock<T> {
    #[cfg_attr(not(feature = "smp"), allow(dead_code))]
    word: UnsafeCell<u32>,
    data: UnsafeCell<T>,
}

// Safety: access to `data` is only ever granted through a `SpinlockGuard`,
// which is only constructed while holding the lock (and, in non-SMP
// builds, with local interrupts disabled).
unsafe impl<T: Send> Sync for Spinlock<T> {}

impl<T> Spinlock<T> {
    #[inline]
    pub const fn new(value: T) -> Self {
        Spinlock {
            word: UnsafeCell::new(0),
            data: UnsafeCell::new(value),
        }
    }

    /// Disable local interrupts, acquire the lock (spinning under `smp`),
    /// and return a guard. Mirrors `lock(word) -> prev_irq_state` (§4.2).
    #[inline]
    pub fn lock<P: Port>(&self) -> SpinlockGuard<'_, T, P> {
        // Safety: paired with `irq_restore` in the guard's `Drop` impl.
        let irq = unsafe { P::irq_disable() };

        #[cfg(feature = "smp")]
        {
            // Safety: `word` is only ever mutated here and in `Drop`,
            // both under disabled local interrupts.
            while unsafe { !P::atomic_cas_u32(self.word.get(), 0, 1) } {
                core::hint::spin_loop();
            }
        }

        SpinlockGuard {
            lock: self,
            irq,
            _port: PhantomData,
        }
    }
}

/// An RAII guard returned by [`Spinlock::lock`]. Restores interrupts (and,
/// under `smp`, clears the lock word) on drop — `unlock(word, prev_irq_state)`
/// in spec terms.
pub struct SpinlockGuard<'a, T, P: Port> {
    lock: &'a Spinlock<T>,
    irq: IrqState,
    _port: PhantomData<P>,
}

impl<'a, T, P: Port> Deref for SpinlockGuard<'a, T, P> {
    type Target = T;
    #[inline]
    fn deref(&self) -> &T {
        // Safety: the guard's existence proves the lock is held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T, P: Port> DerefMut for SpinlockGuard<'a, T, P> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard's existence proves the lock is held.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T, P: Port> Drop for SpinlockGuard<'a, T, P> {
    #[inline]
    fn drop(&mut self) {
        #[cfg(feature = "smp")]
        // Safety: only this guard holds the lock, and only one guard can
        // exist at a time.
        unsafe {
            *self.lock.word.get() = 0;
        }
        // Safety: paired with the `irq_disable` that produced `self.irq`.
        unsafe { P::irq_restore(self.irq) }
    }
}

#[cfg(test)]
mod tests {
    use super::Spinlock;
    use crate::testing::MockPort;

    #[test]
    fn guard_grants_exclusive_access_to_the_wrapped_value() {
        let lock = Spinlock::new(0u32);
        {
            let mut guard = lock.lock::<MockPort>();
            *guard += 1;
        }
        assert_eq!(*lock.lock::<MockPort>(), 1);
    }

    #[test]
    fn lock_is_reusable_after_the_guard_drops() {
        let lock = Spinlock::new(());
        drop(lock.lock::<MockPort>());
        // Would deadlock under the `smp` feature if `Drop` failed to
        // clear the CAS word.
        drop(lock.lock::<MockPort>());
    }
}
