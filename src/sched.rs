//! The scheduler: ready/blocked queues, tick processing, and the
//! handoff to the port's context-switch trigger (§4.4).

use core::ptr::NonNull;

use crate::error::{fatal, Error, KernelResult};
use crate::port::{CoreId, Port, MAX_CORES};
use crate::spinlock::{Spinlock, SpinlockGuard};
use crate::task::{self, BlockReason, Task, TaskQueue, TaskState, WakeReason};
use crate::time::Ticks;
use crate::timer;

/// The scheduler's shared, per-build-target state: one ready queue, one
/// blocked queue, and one `current` slot per core (§3, Task pool).
pub struct SchedState<P: Port> {
    inner: Spinlock<Inner<P>>,
}

struct Inner<P: Port> {
    ready: TaskQueue<P>,
    blocked: TaskQueue<P>,
    current: [Option<NonNull<Task<P>>>; MAX_CORES],
}

impl<P: Port> SchedState<P> {
    #[inline]
    pub const fn new() -> Self {
        SchedState {
            inner: Spinlock::new(Inner {
                ready: TaskQueue::new(),
                blocked: TaskQueue::new(),
                current: [None; MAX_CORES],
            }),
        }
    }
}

#[cfg(test)]
impl<P: Port> SchedState<P> {
    /// Clear every queue and `current` slot. Test-only: the mock port's
    /// `SchedState` is one process-wide `static`, shared by every test in
    /// the binary, so each test must start from a known-empty state
    /// (`testing::reset`).
    pub(crate) fn reset_for_test(&self) {
        let mut guard = self.inner.lock::<P>();
        guard.ready = TaskQueue::new();
        guard.blocked = TaskQueue::new();
        guard.current = [None; MAX_CORES];
    }
}

#[inline]
fn lock<P: Port>() -> SpinlockGuard<'static, Inner<P>, P> {
    P::sched_state().inner.lock::<P>()
}

/// The task presently RUNNING on the calling core.
pub fn current_task<P: Port>() -> &'static Task<P> {
    let core = P::core_id();
    let guard = lock::<P>();
    match guard.current[core.index()] {
        // Safety: every slot, once populated by `boot`, holds a live
        // `'static` task for the remainder of the program.
        Some(ptr) => unsafe { ptr.as_ref() },
        None => fatal::<P>("current_task called before scheduler boot"),
    }
}

/// Start every declared idle task and enter it as the initial `current`
/// for its core (§6, boot sequence; SPEC_FULL.md §E). Call once, after
/// every application task has been started via `task::start`, and before
/// `Port::scheduler_start`.
pub fn boot<P: Port>() -> KernelResult {
    for i in 0..P::NUM_CORES {
        let core = CoreId(i as u8);
        let idle = P::idle_task(core);
        debug_assert!(
            idle.base_priority().is_idle(),
            "Port::idle_task must be declared at Priority::IDLE"
        );
        task::start::<P>(idle)?;
    }
    Ok(())
}

/// Called by the port's `scheduler_start` implementation to select the
/// very first task to run on `core`.
pub fn boot_select<P: Port>(core: CoreId) -> &'static Task<P> {
    let mut guard = lock::<P>();
    match guard.ready.get(core) {
        Some(task) => {
            task.set_state(TaskState::Running);
            guard.current[core.index()] = Some(NonNull::from(task));
            task
        }
        None => fatal::<P>("no eligible task at scheduler boot"),
    }
}

/// Insert `task` into the ready queue and check whether it should
/// preempt whatever is presently running (§4.4, wakeup paths "may
/// trigger a context switch if the woken task outranks the current
/// one").
pub(crate) fn make_ready<P: Port>(task: &'static Task<P>) {
    let mut guard = lock::<P>();
    task.set_state(TaskState::Ready);
    guard.ready.add(task);
    reschedule_locked::<P>(&mut guard);
}

/// The core portion of `task::suspend` (§3, "Any -> SUSPENDED").
pub(crate) fn suspend<P: Port>(task: &'static Task<P>) -> KernelResult {
    let core = P::core_id();
    let is_self = {
        let guard = lock::<P>();
        guard.current[core.index()] == Some(NonNull::from(task))
    };

    {
        let mut guard = lock::<P>();
        match task.state() {
            TaskState::Ready => guard.ready.remove(task),
            TaskState::Blocked => guard.blocked.remove(task),
            TaskState::Running => {}
            TaskState::Suspended | TaskState::Dormant => return Err(Error::InvalidArg),
        }
        task.set_state(TaskState::Suspended);
        task.set_wait_tag(None);
    }

    crate::mutex::abandon_held_mutexes::<P>(task);

    if is_self {
        yield_now::<P>();
    }
    Ok(())
}

/// The core portion of `task::resume`.
pub(crate) fn resume<P: Port>(task: &'static Task<P>) -> KernelResult {
    if task.state() != TaskState::Suspended {
        return Err(Error::NotSuspended);
    }
    task.set_wake_reason(WakeReason::Resume);
    make_ready::<P>(task);
    Ok(())
}

/// Put the calling task to sleep for `ticks` (§5).
pub fn sleep<P: Port>(ticks: Ticks) -> KernelResult {
    if ticks.is_zero() {
        return Ok(());
    }
    let _ = block_current_with_reason::<P>(BlockReason::Sleep, ticks);
    Ok(())
}

/// `yield` (§4.4): re-run selection for the calling core and trigger a
/// context switch if a different task was chosen.
pub fn yield_now<P: Port>() {
    let core = P::core_id();
    let mut guard = lock::<P>();
    let switched = select_next_locked::<P>(&mut guard, core);
    drop(guard);
    if switched {
        P::trigger_context_switch(core);
    }
}

/// Mark the calling task BLOCKED with `reason` for up to `wait` ticks and
/// insert it into the blocked queue, without yet triggering a context
/// switch. Split out of `block_current_with_reason` so a caller that must
/// hold a primitive-specific lock across the enqueue (`condvar.rs`'s
/// `wait`, per §4.9: "under cv spinlock... enqueue caller in cv wait
/// queue, release cv spinlock, then block") can release that lock before
/// the switch actually happens, rather than across it.
pub(crate) fn enqueue_blocked<P: Port>(reason: BlockReason, wait: Ticks) {
    let core = P::core_id();
    let mut guard = lock::<P>();
    let cur_ptr = guard.current[core.index()].expect("no current task");
    // Safety: populated at boot, lives for the remainder of the program.
    let cur = unsafe { cur_ptr.as_ref() };

    cur.set_state(TaskState::Blocked);
    cur.set_block_reason(reason);
    cur.set_wake_reason(WakeReason::None);
    cur.set_remaining_sleep_ticks(wait);
    // Priority-ordered, like the ready queue: `wake_waiter`'s linear scan
    // for the first task matching a primitive's tag depends on the
    // blocked queue itself being in priority order to actually return
    // the *highest-priority* eligible waiter (§4.6/§4.7/§4.9, "pop the
    // highest-priority waiter").
    guard.blocked.add(cur);
}

/// Reschedule the calling core and wait for the current task to be woken,
/// returning its wakeup reason. The second half of
/// `block_current_with_reason`, split out for `wait.rs`'s `park`.
pub(crate) fn park_current<P: Port>() -> WakeReason {
    let core = P::core_id();
    let mut guard = lock::<P>();
    let cur_ptr = guard.current[core.index()].expect("no current task");
    // Safety: populated at boot, lives for the remainder of the program.
    let cur = unsafe { cur_ptr.as_ref() };

    let switched = select_next_locked::<P>(&mut guard, core);
    drop(guard);
    if switched {
        P::trigger_context_switch(core);
    }

    // Execution only reaches this point once a later context switch has
    // restored this task's stack, i.e. once it has actually been woken.
    cur.wake_reason()
}

/// Block the calling task with `reason` for up to `wait` ticks, and
/// return the wakeup reason once it is rescheduled. Shared by `sleep`
/// and every primitive's wait path (`wait.rs`) that doesn't need the
/// enqueue and the park step kept separate.
pub(crate) fn block_current_with_reason<P: Port>(reason: BlockReason, wait: Ticks) -> WakeReason {
    enqueue_blocked::<P>(reason, wait);
    park_current::<P>()
}

/// Pop the highest-priority task waiting on the primitive identified by
/// `tag`, mark it READY with `reason`, and reschedule. Returns the woken
/// task, or `None` if no eligible waiter was queued (§9, Suspension
/// races: a raced-suspended waiter is skipped by the `Blocked` check).
pub(crate) fn wake_waiter<P: Port>(tag: usize, reason: WakeReason) -> Option<&'static Task<P>> {
    let mut guard = lock::<P>();
    let task = guard
        .blocked
        .get_first_where(|t| t.wait_tag() == Some(tag) && t.state() == TaskState::Blocked)?;
    task.set_wait_tag(None);
    task.set_block_reason(BlockReason::None);
    task.set_wake_reason(reason);
    task.set_state(TaskState::Ready);
    guard.ready.add(task);
    reschedule_locked::<P>(&mut guard);
    Some(task)
}

/// Re-sort `task` within the ready queue after its effective priority
/// changed (priority inheritance boost or restore, §4.6), and recheck
/// preemption. A no-op if `task` is not currently READY.
pub(crate) fn reprioritize<P: Port>(task: &'static Task<P>) {
    let mut guard = lock::<P>();
    if task.state() == TaskState::Ready {
        guard.ready.remove(task);
        guard.ready.add(task);
    }
    reschedule_locked::<P>(&mut guard);
}

/// Remove `task` from the blocked queue without waking it. Used only by
/// `mutex::abandon_held_mutexes` bookkeeping paths that need to detach a
/// task outside the normal wake flow.
pub(crate) fn blocked_queue_remove<P: Port>(task: &'static Task<P>) {
    let mut guard = lock::<P>();
    guard.blocked.remove(task);
}

/// The periodic tick handler (§4.4), invoked from the port's timer
/// interrupt once per core.
pub fn tick_handler<P: Port>() {
    let core = P::core_id();

    check_stack_guard::<P>(core);

    if core == CoreId::ZERO {
        timer::process_timers::<P>();

        let mut guard = lock::<P>();

        // Pass 1: decrement every finite timeout. `Ticks::tick` leaves
        // `Ticks::FOREVER` untouched and saturates a finite budget at
        // zero, so an already-expired (but not yet reaped) entry can
        // never wrap.
        for t in guard.blocked.iter() {
            t.set_remaining_sleep_ticks(Ticks::new(t.remaining_sleep_ticks()).tick());
        }

        // Pass 2: every task that just reached zero is newly expired —
        // no blocked task can have sat at zero since a prior tick,
        // because this loop always reaps them the tick they hit it.
        while let Some(t) = guard
            .blocked
            .get_first_where(|t| t.remaining_sleep_ticks() == 0)
        {
            t.set_wait_tag(None);
            let reason = if t.block_reason() == BlockReason::Sleep {
                WakeReason::SleepTimeTimeout
            } else {
                WakeReason::WaitTimeout
            };
            t.set_block_reason(BlockReason::None);
            t.set_wake_reason(reason);
            t.set_state(TaskState::Ready);
            guard.ready.add(t);
        }

        reschedule_locked::<P>(&mut guard);
        return;
    }

    let mut guard = lock::<P>();
    let switched = select_next_locked::<P>(&mut guard, core);
    drop(guard);
    if switched {
        P::trigger_context_switch(core);
    }
}

/// §4.4, Failure semantics: "A stack-overflow check compares the
/// current task's SP against its stack base + guard band; on violation,
/// the implementation logs and halts." Run once per core at the top of
/// every tick, the same cadence the original describes it running at.
fn check_stack_guard<P: Port>(core: CoreId) {
    let guard = lock::<P>();
    let overflowed = guard.current[core.index()]
        // Safety: populated at boot, lives for the remainder of the
        // program.
        .map(|ptr| unsafe { ptr.as_ref() })
        .filter(|t| t.stack_overflowed());
    drop(guard);

    if let Some(task) = overflowed {
        log::error!("rtkernel: task '{}' exceeded its stack", task.name());
        fatal::<P>("stack overflow");
    }
}

fn reschedule_locked<P: Port>(guard: &mut Inner<P>) {
    for i in 0..P::NUM_CORES {
        let core = CoreId(i as u8);
        if select_next_locked::<P>(guard, core) {
            P::trigger_context_switch(core);
        }
    }
}

/// `select_next(core)` (§4.4), under the scheduler lock.
fn select_next_locked<P: Port>(guard: &mut Inner<P>, core: CoreId) -> bool {
    if guard.ready.peek(core).is_none() {
        return false;
    }

    if let Some(cur_ptr) = guard.current[core.index()] {
        // Safety: populated at boot, lives for the remainder of the
        // program.
        let cur = unsafe { cur_ptr.as_ref() };
        if cur.state() == TaskState::Running {
            let head_prio = guard.ready.peek(core).expect("checked above").effective_priority();
            if head_prio <= cur.effective_priority() {
                cur.set_state(TaskState::Ready);
                guard.ready.add(cur);
            } else {
                return false;
            }
        }
    }

    let next = guard
        .ready
        .get(core)
        .expect("ready queue had an eligible head moments ago");
    next.set_state(TaskState::Running);
    guard.current[core.index()] = Some(NonNull::from(next));
    true
}

/// Insert `task` directly into the blocked queue, bypassing
/// `block_current_with_reason`. Test-only: lets a test fabricate "a
/// waiter is already queued on this primitive" as a precondition, since
/// the mock port cannot drive a real blocking call through to a later
/// wakeup (see `testing.rs`'s module doc comment). The caller is
/// responsible for setting the task's state/block-reason/wait-tag first.
#[cfg(test)]
pub(crate) fn insert_blocked_for_test<P: Port>(task: &'static Task<P>) {
    let mut guard = lock::<P>();
    guard.blocked.add(task);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::priority::Priority;
    use crate::task::Affinity;
    use crate::testing::{begin_test, set_core, spawn_task, switch_log, MockPort};

    fn boot_all_cores() {
        boot::<MockPort>().unwrap();
        for i in 0..MockPort::NUM_CORES {
            boot_select::<MockPort>(CoreId(i as u8));
        }
    }

    #[test]
    fn boot_select_picks_the_idle_task_when_nothing_else_is_ready() {
        let _g = begin_test();
        boot::<MockPort>().unwrap();
        let picked = boot_select::<MockPort>(CoreId::ZERO);
        assert_eq!(picked.name(), "idle0");
        assert_eq!(picked.state(), TaskState::Running);
    }

    #[test]
    fn make_ready_preempts_a_lower_priority_running_task() {
        let _g = begin_test();
        boot_all_cores();

        let low = spawn_task("low", Priority::new(10), Affinity::Any);
        assert_eq!(low.state(), TaskState::Running);
        assert_eq!(current_task::<MockPort>().name(), "low");
        assert!(switch_log().contains(&CoreId::ZERO));
    }

    #[test]
    fn equal_or_higher_ready_priority_preempts_current() {
        let _g = begin_test();
        boot_all_cores();

        let low = spawn_task("low", Priority::new(10), Affinity::Any);
        assert_eq!(low.state(), TaskState::Running);

        let high = spawn_task("high", Priority::new(1), Affinity::Any);
        assert_eq!(high.state(), TaskState::Running);
        assert_eq!(low.state(), TaskState::Ready);
    }

    #[test]
    fn sleep_then_tick_wakes_with_sleep_time_timeout() {
        let _g = begin_test();
        boot_all_cores();
        set_core(CoreId::ZERO);

        let worker = spawn_task("worker", Priority::new(5), Affinity::Any);
        assert_eq!(worker.state(), TaskState::Running);

        sleep::<MockPort>(Ticks::new(2)).unwrap();
        assert_eq!(worker.state(), TaskState::Blocked);
        assert_eq!(worker.remaining_sleep_ticks(), 2);

        tick_handler::<MockPort>();
        assert_eq!(worker.remaining_sleep_ticks(), 1);
        assert_eq!(worker.state(), TaskState::Blocked);

        tick_handler::<MockPort>();
        assert_eq!(worker.state(), TaskState::Ready);
        assert_eq!(worker.wake_reason(), WakeReason::SleepTimeTimeout);
    }

    #[test]
    fn suspend_removes_from_scheduling_and_resume_re_enters_ready() {
        let _g = begin_test();
        boot_all_cores();

        let low = spawn_task("low", Priority::new(10), Affinity::Any);
        let other = spawn_task("other", Priority::new(9), Affinity::Any);
        assert_eq!(other.state(), TaskState::Running);
        assert_eq!(low.state(), TaskState::Ready);

        task::suspend::<MockPort>(low).unwrap();
        assert_eq!(low.state(), TaskState::Suspended);

        task::resume::<MockPort>(low).unwrap();
        assert_eq!(low.state(), TaskState::Ready);
        assert_eq!(low.wake_reason(), WakeReason::Resume);

        assert_eq!(task::resume::<MockPort>(low), Err(Error::NotSuspended));
    }

    #[test]
    #[should_panic(expected = "stack overflow")]
    fn tick_handler_halts_when_current_tasks_sp_falls_below_its_stack() {
        let _g = begin_test();
        boot_all_cores();
        let worker = spawn_task("worker", Priority::new(5), Affinity::Any);
        set_core(CoreId::ZERO);

        // Simulate a clobbered stack pointer: one byte below the stack's
        // base address, which `Task::stack_overflowed` treats as
        // exceeding a zero-width guard band.
        let corrupted = (worker.sp.get() as usize - 1) as *mut ();
        worker.sp.set(corrupted);

        tick_handler::<MockPort>();
    }

    #[test]
    fn enqueue_blocked_is_discoverable_by_wake_waiter_before_park_runs() {
        // The condvar race this split exists to close (`condvar.rs`'s
        // `wait`): a waiter must be visible to `wake_waiter` as soon as
        // `enqueue_blocked` returns, without needing `park_current` to
        // run at all. If `wake_waiter` here had to wait for `park_current`,
        // a `signal` racing between a cv's mutex-unlock and its own
        // enqueue could find no waiter and drop the wakeup.
        let _g = begin_test();
        boot_all_cores();
        let worker = spawn_task("worker", Priority::new(5), Affinity::Any);

        let tag = 0xABCD;
        worker.set_wait_tag(Some(tag));
        enqueue_blocked::<MockPort>(BlockReason::WaitForCondVar, Ticks::FOREVER);
        assert_eq!(worker.state(), TaskState::Blocked);

        let woken = wake_waiter::<MockPort>(tag, WakeReason::CondVarSignalled);
        assert_eq!(woken.unwrap().name(), "worker");
        assert_eq!(worker.state(), TaskState::Ready);
        assert_eq!(worker.wake_reason(), WakeReason::CondVarSignalled);
    }
}
