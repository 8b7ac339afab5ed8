//! The architecture-specific port interface (§4.1).
//!
//! Everything in this module is consumed, not implemented, by the kernel:
//! stack layout, trap entry, context-switch assembly, tick timer setup,
//! atomic compare-and-set, privilege-mode entry/exit and inter-processor
//! interrupts are all the port's responsibility (§1, Out of scope). A
//! concrete port also supplies the single static instances of
//! [`crate::sched::SchedState`] and [`crate::timer::TimerState`] that the
//! generic kernel code operates on, since a `static` cannot itself be
//! generic over an application-chosen `Port` type.

use crate::sched::SchedState;
use crate::task::Task;
use crate::timer::TimerState;

/// A core index, in `0..Port::NUM_CORES`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct CoreId(pub u8);

impl CoreId {
    pub const ZERO: CoreId = CoreId(0);

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Opaque previous-IRQ-state token returned by [`Port::irq_disable`] and
/// consumed by [`Port::irq_restore`]. Ports typically store a saved
/// `PRIMASK`/`CPSR`/`sstatus` bit here; the kernel never inspects it.
pub type IrqState = usize;

/// The maximum number of cores this crate supports (§1, Non-goals: "no
/// more than a handful of cores"). SMP builds use 2; non-SMP builds only
/// ever address core 0.
pub const MAX_CORES: usize = 2;

/// The architecture port.
///
/// # Safety
///
/// Implementors must guarantee that `irq_disable`/`irq_restore` pairs
/// nest correctly, that `atomic_cas_u32` is a genuine atomic
/// compare-and-swap visible to every core addressed by `NUM_CORES`, and
/// that `sched_state`/`timer_state` each return the same `'static`
/// reference for the lifetime of the program.
pub unsafe trait Port: Sized + 'static {
    /// `1` for a single-core build, `2` for SMP (§1, §5).
    const NUM_CORES: usize = 1;

    /// Extra slack, in bytes, below a task's stack base that the kernel
    /// treats as already overflowed when checking `sp` at tick time
    /// (§4.4, Failure semantics; §7, Stack overflow). `0` performs a bare
    /// bounds check; a port that knows its worst-case ISR stack usage can
    /// widen this to catch an overflow before it actually clobbers
    /// adjacent memory.
    const STACK_GUARD_BYTES: usize = 0;

    /// Disable local interrupts and return the previous state.
    unsafe fn irq_disable() -> IrqState;

    /// Restore local interrupts to a state previously returned by
    /// `irq_disable`.
    unsafe fn irq_restore(state: IrqState);

    /// Atomic compare-and-swap over a 32-bit word, used by
    /// [`crate::spinlock::Spinlock`] under the `smp` feature (§4.2).
    unsafe fn atomic_cas_u32(word: *mut u32, expected: u32, new: u32) -> bool;

    /// The index of the core executing this call (§4.1(e)).
    fn core_id() -> CoreId;

    /// Raise a pendable exception or inter-processor interrupt such that
    /// the next return-from-interrupt on `core` restores `next`'s
    /// registers and stack (§4.1(c)).
    fn trigger_context_switch(core: CoreId);

    /// Configure the periodic tick interrupt to fire every
    /// `period_us` microseconds (§4.1(d), §6 `tick-interval-microseconds`).
    fn tick_config(period_us: u32);

    /// Write the initial stack frame for a not-yet-started task: entry
    /// PC, exit PC, parameter, and a synthetic exception-return value at
    /// fixed offsets from the top of `stack` (§4.1(f)). Returns the
    /// initial stack pointer to store in the task control block.
    ///
    /// # Safety
    ///
    /// `stack` must be valid for the lifetime of the task and not
    /// aliased elsewhere.
    unsafe fn initialize_task_stack(
        stack: &mut [core::mem::MaybeUninit<u8>],
        entry: unsafe extern "C" fn(usize) -> !,
        param: usize,
    ) -> *mut ();

    /// Configure tick and context-switch interrupt priorities, load the
    /// first task's stack pointer into the process stack register,
    /// optionally switch privilege level, and jump to its entry point.
    /// Never returns (§4.1(g)).
    fn scheduler_start() -> !;

    /// The per-core shared scheduler state. A concrete port normally
    /// implements this by returning a reference to a single `static`
    /// it declares alongside its `Port` impl.
    fn sched_state() -> &'static SchedState<Self>;

    /// The shared timer-service state (§4.5). See `sched_state` for why
    /// this is a port-supplied accessor rather than a crate-level
    /// `static`.
    fn timer_state() -> &'static TimerState<Self>;

    /// The kernel-owned idle task for `core` (SPEC_FULL.md §E). The idle
    /// task is never application-declarable; a concrete port supplies its
    /// `'static` storage the same way it supplies `sched_state`.
    fn idle_task(core: CoreId) -> &'static Task<Self>;

    /// Run when no task is eligible to run on `core`. Defaults to a busy
    /// spin; a real port typically executes `wfi`/`wfe` here instead.
    /// Not part of the original port contract (§4.1) — a convenience
    /// hook so the idle task itself need not be application-visible
    /// (see SPEC_FULL.md §E).
    #[inline]
    fn idle(_core: CoreId) {
        core::hint::spin_loop();
    }

    /// Halt after a fatal condition has already been logged (§7).
    #[cold]
    fn halt(_msg: &str) -> ! {
        loop {
            core::hint::spin_loop();
        }
    }
}
