//! A single-core(-or-two), non-preemptive mock [`Port`] used by this
//! crate's own unit tests (SPEC_FULL.md §F).
//!
//! The mock never performs a real stack switch: [`MockPort::trigger_context_switch`]
//! just records that a switch was requested, which is enough to assert
//! the scheduling *decisions* the Testable Properties (spec.md §8)
//! describe without needing real task threads or hardware. Tests that
//! need to observe a primitive waking a queued waiter set up the
//! waiter's blocked state directly (via the crate-internal setters
//! `Task` already exposes to `sched`/`wait`) rather than by driving a
//! real blocking call to completion, since a blocking call only
//! "returns" on real hardware once a later context switch restores its
//! stack — which this mock, by design, never performs.

use core::cell::{Cell, RefCell};
use core::mem::MaybeUninit;

use arrayvec::ArrayVec;

use crate::port::{CoreId, IrqState, Port, MAX_CORES};
use crate::sched::SchedState;
use crate::task::{Affinity, Task};
use crate::timer::TimerState;

pub struct MockPort;

std::thread_local! {
    static CURRENT_CORE: Cell<u8> = Cell::new(0);
    static SWITCH_LOG: RefCell<ArrayVec<CoreId, 64>> = RefCell::new(ArrayVec::new());
}

/// Pretend the calling test is executing on `core`. Affects
/// `MockPort::core_id()` for every kernel call the test makes afterward.
pub fn set_core(core: CoreId) {
    CURRENT_CORE.with(|c| c.set(core.0));
}

/// Every core `trigger_context_switch` was invoked for since the last
/// `clear_switch_log`, in call order.
pub fn switch_log() -> ArrayVec<CoreId, 64> {
    SWITCH_LOG.with(|log| log.borrow().clone())
}

pub fn clear_switch_log() {
    SWITCH_LOG.with(|log| log.borrow_mut().clear());
}

static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Serialize access to the process-wide mock scheduler/timer state and
/// reset it to empty. Every test in this crate that touches `sched`,
/// `mutex`, `semaphore`, `msgqueue`, `condvar` or `timer` must hold the
/// returned guard for its whole body — `MockPort::sched_state()` and
/// `MockPort::timer_state()` are single process-wide `static`s, so two
/// tests running concurrently would otherwise corrupt each other's ready
/// and blocked queues.
#[must_use]
pub fn begin_test() -> std::sync::MutexGuard<'static, ()> {
    // `RUST_LOG`-driven debugging of the `log::warn!`/`log::error!` call
    // sites in `mutex.rs`/`sched.rs`; every test calls `begin_test`, so
    // init here once rather than at each `#[test]` fn. `try_init` ignores
    // the "already initialized" error from the second and later calls.
    let _ = env_logger::builder().is_test(true).try_init();

    let guard = TEST_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    MockPort::sched_state().reset_for_test();
    MockPort::timer_state().reset_for_test();
    MockPort::idle_task(CoreId(0)).reset_for_test();
    MockPort::idle_task(CoreId(1)).reset_for_test();
    clear_switch_log();
    set_core(CoreId(0));
    guard
}

unsafe impl Port for MockPort {
    // Matches the real contract (§1, §5): 1 unless the `smp` feature is
    // on, so the default test run exercises single-core scheduling
    // (no task ever migrates onto a nonexistent core 1) and SMP-only
    // tests opt in explicitly with `#[cfg(feature = "smp")]`.
    const NUM_CORES: usize = if cfg!(feature = "smp") { 2 } else { 1 };

    unsafe fn irq_disable() -> IrqState {
        0
    }

    unsafe fn irq_restore(_state: IrqState) {}

    unsafe fn atomic_cas_u32(word: *mut u32, expected: u32, new: u32) -> bool {
        // Safety: the mock is single-threaded; an ordinary read-modify-write
        // is equivalent to a real CAS here.
        if *word == expected {
            *word = new;
            true
        } else {
            false
        }
    }

    fn core_id() -> CoreId {
        CoreId(CURRENT_CORE.with(|c| c.get()))
    }

    fn trigger_context_switch(core: CoreId) {
        SWITCH_LOG.with(|log| {
            let _ = log.borrow_mut().try_push(core);
        });
    }

    fn tick_config(_period_us: u32) {}

    unsafe fn initialize_task_stack(
        stack: &mut [MaybeUninit<u8>],
        _entry: unsafe extern "C" fn(usize) -> !,
        _param: usize,
    ) -> *mut () {
        stack.as_mut_ptr() as *mut ()
    }

    fn scheduler_start() -> ! {
        unreachable!("the mock port never runs the real scheduler loop")
    }

    fn sched_state() -> &'static SchedState<Self> {
        static STATE: SchedState<MockPort> = SchedState::new();
        &STATE
    }

    fn timer_state() -> &'static TimerState<Self> {
        static STATE: TimerState<MockPort> = TimerState::new();
        &STATE
    }

    fn idle_task(core: CoreId) -> &'static Task<Self> {
        static mut STACK_0: [MaybeUninit<u8>; 256] = [MaybeUninit::uninit(); 256];
        static mut STACK_1: [MaybeUninit<u8>; 256] = [MaybeUninit::uninit(); 256];
        static IDLE_0: Task<MockPort> = Task::new(
            "idle0",
            idle_entry,
            0,
            // Safety: only this function takes `STACK_0`'s address, and
            // only as a raw pointer, never a reference.
            unsafe { core::ptr::addr_of_mut!(STACK_0) as *mut MaybeUninit<u8> },
            256,
            crate::priority::Priority::IDLE,
            Affinity::Core(CoreId(0)),
        );
        static IDLE_1: Task<MockPort> = Task::new(
            "idle1",
            idle_entry,
            0,
            // Safety: see `IDLE_0`.
            unsafe { core::ptr::addr_of_mut!(STACK_1) as *mut MaybeUninit<u8> },
            256,
            crate::priority::Priority::IDLE,
            Affinity::Core(CoreId(1)),
        );
        if core.index() == 0 {
            &IDLE_0
        } else {
            &IDLE_1
        }
    }

    fn halt(msg: &str) -> ! {
        panic!("rtkernel fatal: {}", msg);
    }
}

unsafe extern "C" fn idle_entry(_param: usize) -> ! {
    loop {
        core::hint::spin_loop();
    }
}

/// Build a not-yet-started, freestanding test task, backed by a small
/// leaked stack (tests are short-lived processes, so leaking is
/// harmless). Does not touch any scheduler state — safe to call without
/// `begin_test()`, for tests that only exercise `TaskQueue` directly.
pub fn new_task(
    name: &'static str,
    priority: crate::priority::Priority,
    affinity: Affinity,
) -> &'static Task<MockPort> {
    let stack: &'static mut [MaybeUninit<u8>] = Box::leak(Box::new([MaybeUninit::uninit(); 512]));
    Box::leak(Box::new(Task::new(
        name,
        idle_entry,
        0,
        stack.as_mut_ptr(),
        stack.len(),
        priority,
        affinity,
    )))
}

/// Build and start a test task at `priority`/`affinity` (§6, boot
/// sequence): registers it with the mock's global scheduler state, so
/// callers must hold the `begin_test()` guard first.
pub fn spawn_task(
    name: &'static str,
    priority: crate::priority::Priority,
    affinity: Affinity,
) -> &'static Task<MockPort> {
    let task = new_task(name, priority, affinity);
    crate::task::start::<MockPort>(task).expect("spawn_task: start failed");
    task
}

/// Fabricate `task` as an already-queued waiter on the primitive tagged
/// `tag` (obtained from e.g. `RawMutex::wait_tag_for_test`), blocked for
/// `reason`. Lets a test exercise a primitive's wake path without
/// driving a real blocking call through to a later context switch, which
/// this single-threaded mock cannot do (see this module's doc comment).
/// Requires a task built by `new_task`/`spawn_task` and the
/// `begin_test()` guard.
pub fn block_waiter(task: &'static Task<MockPort>, reason: crate::task::BlockReason, tag: usize) {
    task.set_state(crate::task::TaskState::Blocked);
    task.set_block_reason(reason);
    task.set_wait_tag(Some(tag));
    crate::sched::insert_blocked_for_test::<MockPort>(task);
}
