//! Task control (§3, Task; §4.3 refers to it as the linked element).

mod queue;

pub use queue::TaskQueue;

use core::cell::Cell;
use core::mem::MaybeUninit;
use core::ptr::NonNull;

use crate::error::{Error, KernelResult};
use crate::mutex::RawMutex;
use crate::port::{CoreId, Port};
use crate::priority::Priority;
use crate::sched;
use crate::time::Ticks;

/// A task's scheduling status (§3).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TaskState {
    /// Declared but not yet started; never entered any scheduling queue.
    /// Not part of the public status model described by spec.md, but
    /// necessary bootstrap plumbing between static declaration and the
    /// first call to `task::start`.
    Dormant,
    Ready,
    Running,
    Blocked,
    Suspended,
}

/// The reason a task most recently transitioned to BLOCKED (§3).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BlockReason {
    None,
    Sleep,
    WaitForSemaphore,
    WaitForMutex,
    WaitForMsgQueueData,
    WaitForMsgQueueSpace,
    WaitForCondVar,
    WaitForTimerTimeout,
}

/// The reason a task most recently transitioned out of BLOCKED (§3).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WakeReason {
    None,
    WaitTimeout,
    SleepTimeTimeout,
    SemaphoreTaken,
    MutexLocked,
    MsgQueueDataAvailable,
    MsgQueueSpaceAvailable,
    CondVarSignalled,
    TimerTimeout,
    Resume,
}

/// A task's core affinity (§3, §5).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Affinity {
    /// May be dispatched on any core.
    Any,
    /// May only be dispatched on the given core.
    Core(CoreId),
}

/// A task control block.
///
/// `sp` is kept as the very first field, `#[repr(C)]`, so that a port's
/// context-switch assembly can locate it via a fixed offset from the
/// `Task`'s address without knowing the rest of the layout.
#[repr(C)]
pub struct Task<P: Port> {
    /// The task's saved stack pointer. Written by the low-level context
    /// switch when this task stops running; read when it resumes.
    pub sp: Cell<*mut ()>,

    name: &'static str,
    entry: unsafe extern "C" fn(usize) -> !,
    param: usize,
    stack_ptr: *mut MaybeUninit<u8>,
    stack_len: usize,

    base_priority: Cell<Priority>,
    effective_priority: Cell<Priority>,
    affinity: Affinity,

    state: Cell<TaskState>,
    block_reason: Cell<BlockReason>,
    wake_reason: Cell<WakeReason>,
    remaining_sleep_ticks: Cell<u32>,

    /// The address-identity of the [`crate::wait::WaitQueue`] this task is
    /// currently waiting on, if any (`None` for a plain `sleep`). Lets a
    /// primitive pop "its own" highest-priority waiter out of the shared
    /// blocked queue (`wait.rs`).
    wait_tag: Cell<Option<usize>>,

    /// The owner's pre-boost priority, set while `RawMutex::lock` has
    /// boosted this task above its base priority (§4.6). `None` stands in
    /// for the no-boost sentinel (`-1` in interfaces that encode priority
    /// as a plain integer).
    #[cfg(feature = "priority_inheritance")]
    boosted_from: Cell<Option<Priority>>,

    /// Head of the singly linked list of mutexes this task currently
    /// owns, threaded through `RawMutex::next_held`. Used only to warn on
    /// abandonment when a task holding a mutex is suspended (§B).
    held_mutex: Cell<Option<NonNull<RawMutex<P>>>>,

    /// The single intrusive link reused by whichever queue currently
    /// owns this task: the ready queue, the blocked queue, or exactly one
    /// primitive's wait queue (§9, Design Notes). A task is a member of
    /// at most one such queue at a time.
    link: Cell<Option<NonNull<Task<P>>>>,
}

// Safety: `Task` is only ever accessed while holding the scheduler lock
// or a primitive's spinlock, both of which disable local interrupts.
unsafe impl<P: Port> Sync for Task<P> {}

impl<P: Port> Task<P> {
    /// Construct a not-yet-started task. Used by the `task!` declaration
    /// macro (`cfg.rs`); not normally called directly.
    pub const fn new(
        name: &'static str,
        entry: unsafe extern "C" fn(usize) -> !,
        param: usize,
        stack: *mut MaybeUninit<u8>,
        stack_len: usize,
        priority: Priority,
        affinity: Affinity,
    ) -> Self {
        Task {
            sp: Cell::new(core::ptr::null_mut()),
            name,
            entry,
            param,
            stack_ptr: stack,
            stack_len,
            base_priority: Cell::new(priority),
            effective_priority: Cell::new(priority),
            affinity,
            state: Cell::new(TaskState::Dormant),
            block_reason: Cell::new(BlockReason::None),
            wake_reason: Cell::new(WakeReason::None),
            remaining_sleep_ticks: Cell::new(0),
            wait_tag: Cell::new(None),
            #[cfg(feature = "priority_inheritance")]
            boosted_from: Cell::new(None),
            held_mutex: Cell::new(None),
            link: Cell::new(None),
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn base_priority(&self) -> Priority {
        self.base_priority.get()
    }

    #[inline]
    pub fn effective_priority(&self) -> Priority {
        self.effective_priority.get()
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        self.state.get()
    }

    #[inline]
    pub fn affinity(&self) -> Affinity {
        self.affinity
    }

    #[inline]
    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.set(state);
    }

    #[inline]
    pub(crate) fn block_reason(&self) -> BlockReason {
        self.block_reason.get()
    }

    #[inline]
    pub(crate) fn set_block_reason(&self, reason: BlockReason) {
        self.block_reason.set(reason);
    }

    #[inline]
    pub(crate) fn wake_reason(&self) -> WakeReason {
        self.wake_reason.get()
    }

    #[inline]
    pub(crate) fn set_wake_reason(&self, reason: WakeReason) {
        self.wake_reason.set(reason);
    }

    #[inline]
    pub(crate) fn remaining_sleep_ticks(&self) -> u32 {
        self.remaining_sleep_ticks.get()
    }

    #[inline]
    pub(crate) fn set_remaining_sleep_ticks(&self, ticks: Ticks) {
        self.remaining_sleep_ticks
            .set(if ticks.is_forever() { u32::MAX } else { ticks.get() });
    }

    #[inline]
    pub(crate) fn wait_tag(&self) -> Option<usize> {
        self.wait_tag.get()
    }

    #[inline]
    pub(crate) fn set_wait_tag(&self, tag: Option<usize>) {
        self.wait_tag.set(tag);
    }

    #[inline]
    pub(crate) fn link(&self) -> Option<NonNull<Task<P>>> {
        self.link.get()
    }

    #[inline]
    pub(crate) fn set_link(&self, next: Option<NonNull<Task<P>>>) {
        self.link.set(next);
    }

    #[cfg(feature = "priority_inheritance")]
    #[inline]
    pub(crate) fn boost_to(&self, priority: Priority) {
        if self.boosted_from.get().is_none() {
            self.boosted_from.set(Some(self.effective_priority.get()));
        }
        self.effective_priority.set(priority);
    }

    #[cfg(feature = "priority_inheritance")]
    #[inline]
    pub(crate) fn restore_priority(&self) {
        if let Some(original) = self.boosted_from.take() {
            self.effective_priority.set(original);
        }
    }

    #[inline]
    pub(crate) fn push_held_mutex(&self, mutex: NonNull<RawMutex<P>>) {
        // Safety: `mutex` outlives the task (both are `'static`).
        unsafe { mutex.as_ref().set_next_held(self.held_mutex.get()) };
        self.held_mutex.set(Some(mutex));
    }

    #[inline]
    pub(crate) fn take_held_mutex_head(&self) -> Option<NonNull<RawMutex<P>>> {
        let head = self.held_mutex.get()?;
        // Safety: every linked node is a live `'static` mutex.
        let next = unsafe { head.as_ref().next_held() };
        self.held_mutex.set(next);
        Some(head)
    }

    /// `true` once `sp` has fallen at or below the guarded region of
    /// this task's stack (§4.4, Failure semantics; §7, Stack overflow).
    /// Assumes a full-descending stack, matching the "top of stack"
    /// framing of `Port::initialize_task_stack` (§4.1f): `sp` only ever
    /// decreases as the task pushes more frames, so falling below
    /// `stack_ptr` (plus the port's declared guard) means the stack has
    /// been exceeded.
    pub(crate) fn stack_overflowed(&self) -> bool {
        let base = self.stack_ptr as usize;
        (self.sp.get() as usize) < base.saturating_add(P::STACK_GUARD_BYTES)
    }

    #[inline]
    pub(crate) fn remove_held_mutex(&self, mutex: NonNull<RawMutex<P>>) {
        let mut cursor = self.held_mutex.get();
        let mut prev: Option<NonNull<RawMutex<P>>> = None;
        while let Some(node) = cursor {
            // Safety: every linked node is a live `'static` mutex.
            let next = unsafe { node.as_ref().next_held() };
            if node == mutex {
                match prev {
                    Some(p) => unsafe { p.as_ref().set_next_held(next) },
                    None => self.held_mutex.set(next),
                }
                return;
            }
            prev = Some(node);
            cursor = next;
        }
    }
}

#[cfg(test)]
impl<P: Port> Task<P> {
    /// Reset a task back to its just-declared (`Dormant`) state. Test-only:
    /// the mock port's idle tasks are process-wide `static`s shared by
    /// every test in the binary (`testing::reset`); tasks a test spawns
    /// itself don't need this since each gets fresh storage.
    pub(crate) fn reset_for_test(&self) {
        self.state.set(TaskState::Dormant);
        self.block_reason.set(BlockReason::None);
        self.wake_reason.set(WakeReason::None);
        self.remaining_sleep_ticks.set(0);
        self.wait_tag.set(None);
        #[cfg(feature = "priority_inheritance")]
        self.boosted_from.set(None);
        self.held_mutex.set(None);
        self.link.set(None);
        self.effective_priority.set(self.base_priority.get());
    }
}

/// Allocate a task's initial stack frame and mark it READY. Called once,
/// during the boot sequence, before `scheduler_start` (§6).
pub fn start<P: Port>(task: &'static Task<P>) -> KernelResult {
    if task.state.get() != TaskState::Dormant {
        return Err(Error::InvalidArg);
    }

    // Safety: `stack_ptr`/`stack_len` describe the static buffer this
    // task owns exclusively, established by `Task::new`.
    let stack = unsafe { core::slice::from_raw_parts_mut(task.stack_ptr, task.stack_len) };
    // Safety: the port contract guarantees the returned pointer is a
    // valid initial stack pointer for `entry`/`param`.
    let sp = unsafe { P::initialize_task_stack(stack, task.entry, task.param) };
    task.sp.set(sp);

    sched::make_ready::<P>(task);
    Ok(())
}

/// Suspend `task` (§3, "Any → SUSPENDED"). If `task` is the currently
/// running task on this core, yields before returning, since its own
/// status transition must take effect via the scheduler. A task holding
/// one or more mutexes that is suspended abandons them: each is
/// force-unlocked and transferred to its highest-priority waiter, with a
/// warning logged (§B).
pub fn suspend<P: Port>(task: &'static Task<P>) -> KernelResult {
    sched::suspend::<P>(task)
}

/// Resume a SUSPENDED task, re-entering it as READY with wakeup reason
/// `Resume` (§3). Returns `Err(NotSuspended)` if `task` was not
/// SUSPENDED.
pub fn resume<P: Port>(task: &'static Task<P>) -> KernelResult {
    sched::resume::<P>(task)
}

/// Put the calling task to sleep for `ticks` (§5, Suspension points).
/// `Ticks::ZERO` returns immediately without blocking.
pub fn sleep<P: Port>(ticks: Ticks) -> KernelResult {
    sched::sleep::<P>(ticks)
}

/// Voluntarily yield the current core (§4.4, `yield`).
pub fn yield_now<P: Port>() {
    sched::yield_now::<P>();
}

/// The calling task's base (unboosted) priority.
pub fn current_priority<P: Port>() -> Priority {
    sched::current_task::<P>().base_priority()
}

/// The calling task's effective (possibly priority-inheritance-boosted)
/// priority.
pub fn effective_priority<P: Port>() -> Priority {
    sched::current_task::<P>().effective_priority()
}
