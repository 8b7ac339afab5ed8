//! Software timers (§4.5).
//!
//! The tick handler walks the active-timer list on core 0 and enqueues
//! expired handlers into a FIFO drained by a dedicated, highest-priority
//! timer task — handlers may take mutexes and call blocking primitives,
//! which would violate the no-block-in-ISR rule if run directly from the
//! tick interrupt.

use core::cell::Cell;
use core::ptr::NonNull;

use crate::error::{Error, KernelResult};
use crate::port::Port;
use crate::sched;
use crate::spinlock::Spinlock;
use crate::task::BlockReason;
use crate::time::Ticks;
use crate::wait::WaitQueue;

/// A timer's expiry handler and the opaque parameter passed to it,
/// mirroring the entry-point/parameter pairing every task carries (§3).
pub type TimerHandler = fn(usize);

/// Whether a timer re-arms itself on expiry (§3, Timer).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TimerMode {
    SingleShot,
    Periodic,
}

/// A statically declared software timer (`timer!` in `cfg.rs`). Never
/// destroyed (§3, Lifecycle).
pub struct TimerNode<P: Port> {
    name: &'static str,
    handler: TimerHandler,
    param: usize,
    mode: TimerMode,

    interval_ticks: Cell<u32>,
    ticks_to_expire: Cell<u32>,
    running: Cell<bool>,

    /// Membership in `TimerState::active`. A timer is linked here iff
    /// `running` (§3, Timer invariants).
    list_link: Cell<Option<NonNull<TimerNode<P>>>>,
    /// Membership in `TimerState::pending`, the FIFO the timer task
    /// drains. Independent of `list_link`: a periodic timer can be
    /// simultaneously active and pending dispatch of its last expiry.
    pending_link: Cell<Option<NonNull<TimerNode<P>>>>,
    /// Set while linked into `pending`, to avoid double-enqueueing a
    /// timer that expires again before the timer task has drained its
    /// previous expiry (the single intrusive `pending_link` can only
    /// hold one membership at a time — §9, Design Notes).
    pending: Cell<bool>,
}

// Safety: every field is only touched under `TimerState`'s spinlock.
unsafe impl<P: Port> Sync for TimerNode<P> {}

impl<P: Port> TimerNode<P> {
    #[inline]
    pub const fn new(name: &'static str, handler: TimerHandler, param: usize, mode: TimerMode) -> Self {
        TimerNode {
            name,
            handler,
            param,
            mode,
            interval_ticks: Cell::new(0),
            ticks_to_expire: Cell::new(0),
            running: Cell::new(false),
            list_link: Cell::new(None),
            pending_link: Cell::new(None),
            pending: Cell::new(false),
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    /// Read-only accessor for `ticks_to_expire` (SPEC_FULL.md §E),
    /// directly testable against the Testable Properties' timer
    /// invariant `ticks_to_expire ∈ [0, interval_ticks]`.
    #[inline]
    pub fn remaining_ticks(&self) -> u32 {
        self.ticks_to_expire.get()
    }

    /// `start(timer, interval)` (§4.5).
    pub fn start(&'static self, interval_ticks: u32) -> KernelResult {
        let mut guard = P::timer_state().inner.lock::<P>();
        if self.running.get() {
            return Err(Error::AlreadyActive);
        }
        self.interval_ticks.set(interval_ticks);
        self.ticks_to_expire.set(interval_ticks);
        self.running.set(true);
        guard.push_active(self);
        Ok(())
    }

    /// `stop(timer)` (§4.5).
    pub fn stop(&'static self) -> KernelResult {
        let mut guard = P::timer_state().inner.lock::<P>();
        if !self.running.get() {
            return Err(Error::NotActive);
        }
        self.running.set(false);
        guard.remove_active(self);
        Ok(())
    }
}

struct Inner<P: Port> {
    active: Option<NonNull<TimerNode<P>>>,
    pending_head: Option<NonNull<TimerNode<P>>>,
    pending_tail: Option<NonNull<TimerNode<P>>>,
}

impl<P: Port> Inner<P> {
    fn push_active(&mut self, timer: &'static TimerNode<P>) {
        timer.list_link.set(self.active);
        self.active = Some(NonNull::from(timer));
    }

    fn remove_active(&mut self, timer: &'static TimerNode<P>) {
        let target = NonNull::from(timer);
        let mut prev: Option<NonNull<TimerNode<P>>> = None;
        let mut cursor = self.active;
        while let Some(node) = cursor {
            // Safety: every linked node is a live `'static` timer.
            let node_ref = unsafe { node.as_ref() };
            let next = node_ref.list_link.get();
            if node == target {
                match prev {
                    Some(p) => unsafe { p.as_ref().list_link.set(next) },
                    None => self.active = next,
                }
                node_ref.list_link.set(None);
                return;
            }
            prev = Some(node);
            cursor = next;
        }
    }

    fn push_pending(&mut self, timer: &'static TimerNode<P>) {
        if timer.pending.get() {
            return;
        }
        timer.pending.set(true);
        timer.pending_link.set(None);
        let node = NonNull::from(timer);
        match self.pending_tail {
            Some(tail) => unsafe { tail.as_ref().pending_link.set(Some(node)) },
            None => self.pending_head = Some(node),
        }
        self.pending_tail = Some(node);
    }

    fn pop_pending(&mut self) -> Option<&'static TimerNode<P>> {
        let node = self.pending_head?;
        // Safety: every linked node is a live `'static` timer.
        let node_ref = unsafe { node.as_ref() };
        self.pending_head = node_ref.pending_link.get();
        if self.pending_head.is_none() {
            self.pending_tail = None;
        }
        node_ref.pending_link.set(None);
        node_ref.pending.set(false);
        Some(node_ref)
    }
}

/// The timer service's shared state: the active-timer list and the
/// timeout-handler FIFO (§3, Timer; §4.5).
pub struct TimerState<P: Port> {
    inner: Spinlock<Inner<P>>,
    wait_queue: WaitQueue<P>,
}

impl<P: Port> TimerState<P> {
    #[inline]
    pub const fn new() -> Self {
        TimerState {
            inner: Spinlock::new(Inner {
                active: None,
                pending_head: None,
                pending_tail: None,
            }),
            wait_queue: WaitQueue::new(),
        }
    }
}

#[cfg(test)]
impl<P: Port> TimerState<P> {
    /// Test-only reset, mirroring `SchedState::reset_for_test` — see its
    /// doc comment for why this is needed.
    pub(crate) fn reset_for_test(&self) {
        let mut guard = self.inner.lock::<P>();
        guard.active = None;
        guard.pending_head = None;
        guard.pending_tail = None;
    }

    pub(crate) fn wait_tag_for_test(&self) -> usize {
        self.wait_queue.tag_for_test()
    }
}

/// Walk the active-timer list, decrementing every `ticks_to_expire` and
/// dispatching expiries (§4.4, `tick_handler`; §4.5). Called once per
/// tick, on core 0 only.
pub(crate) fn process_timers<P: Port>() {
    let mut guard = P::timer_state().inner.lock::<P>();

    let mut cursor = guard.active;
    while let Some(node) = cursor {
        // Safety: every linked node is a live `'static` timer.
        let node_ref = unsafe { node.as_ref() };
        // Captured before any unlinking below, so a single-shot timer
        // removing itself from `active` mid-walk cannot strand the walk.
        let next = node_ref.list_link.get();
        cursor = next;

        let remaining = node_ref.ticks_to_expire.get();
        if remaining > 0 {
            node_ref.ticks_to_expire.set(remaining - 1);
        }

        if node_ref.ticks_to_expire.get() == 0 {
            guard.push_pending(node_ref);
            match node_ref.mode {
                TimerMode::Periodic => {
                    node_ref.ticks_to_expire.set(node_ref.interval_ticks.get());
                }
                TimerMode::SingleShot => {
                    node_ref.running.set(false);
                    guard.remove_active(node_ref);
                }
            }
        }
    }

    let any_pending = guard.pending_head.is_some();
    drop(guard);

    if any_pending {
        P::timer_state().wait_queue.wake_one(crate::task::WakeReason::TimerTimeout);
    }
}

/// Pop the next pending handler, if any. Called only by
/// [`timer_task_entry`].
fn pop_pending<P: Port>() -> Option<&'static TimerNode<P>> {
    P::timer_state().inner.lock::<P>().pop_pending()
}

/// The dedicated timer task's entry point (§4.5). Declared via the
/// `timer_task!` macro (`cfg.rs`) at the highest application priority;
/// drains the pending-handler FIFO, blocking with `WAIT_FOR_TIMER_TIMEOUT`
/// and an infinite wait whenever it is empty.
///
/// # Safety
///
/// Must only ever be used as the `entry` of the task declared by
/// `timer_task!`, never called directly.
pub unsafe extern "C" fn timer_task_entry<P: Port>(_param: usize) -> ! {
    loop {
        match pop_pending::<P>() {
            Some(timer) => (timer.handler)(timer.param),
            None => {
                let _ = P::timer_state()
                    .wait_queue
                    .block(BlockReason::WaitForTimerTimeout, Ticks::FOREVER);
            }
        }
    }
}
