//! Static declaration macros (§6, External interfaces).
//!
//! Every primitive and task is declared once, at file scope, as a plain
//! `'static` (§3, Lifecycle: "all primitives are statically declared and
//! initialized at their definition site; no destruction"). These macros
//! are thin sugar over each type's `const fn new` — they exist only to
//! pair a control block with the backing storage it needs (a task's
//! stack, a message queue's ring buffer) without requiring the
//! application to name and size that storage by hand.

/// Declare a statically allocated task (§6, "Task definition").
///
/// ```ignore
/// task! {
///     static WORKER: Task<MyPort> = {
///         entry: worker_main,
///         param: 0,
///         priority: 10,
///         affinity: Affinity::Any,
///         stack_size: 4096,
///     };
/// }
/// ```
///
/// `entry` must have the signature `unsafe extern "C" fn(usize) -> !`,
/// matching [`crate::port::Port::initialize_task_stack`]'s contract —
/// a task entry point never returns.
#[macro_export]
macro_rules! task {
    (
        $(#[$meta:meta])*
        $vis:vis static $name:ident: Task<$port:ty> = {
            entry: $entry:expr,
            param: $param:expr,
            priority: $priority:expr,
            affinity: $affinity:expr,
            stack_size: $stack_size:expr $(,)?
        };
    ) => {
        $(#[$meta])*
        $vis static $name: $crate::task::Task<$port> = {
            static mut __STACK: [::core::mem::MaybeUninit<u8>; $stack_size] =
                [::core::mem::MaybeUninit::uninit(); $stack_size];
            $crate::task::Task::new(
                ::core::stringify!($name),
                $entry,
                $param,
                // Safety: `addr_of_mut!` only takes the address of
                // `__STACK`; it never forms a reference, so the
                // `static mut` is not aliased by this expression.
                unsafe {
                    ::core::ptr::addr_of_mut!(__STACK) as *mut ::core::mem::MaybeUninit<u8>
                },
                $stack_size,
                $crate::priority::Priority::new($priority),
                $affinity,
            )
        };
    };
}

/// Declare the kernel's dedicated timer task (§4.5, §6). Application code
/// never provides its own entry point here — it is always
/// [`crate::timer::timer_task_entry`].
#[macro_export]
macro_rules! timer_task {
    (
        $vis:vis static $name:ident: Task<$port:ty> = {
            priority: $priority:expr,
            affinity: $affinity:expr,
            stack_size: $stack_size:expr $(,)?
        };
    ) => {
        $crate::task! {
            $vis static $name: $crate::task::Task<$port> = {
                entry: $crate::timer::timer_task_entry::<$port>,
                param: 0,
                priority: $priority,
                affinity: $affinity,
                stack_size: $stack_size,
            };
        }
    };
}

/// Declare a statically allocated mutex (§3, Mutex; §6).
#[macro_export]
macro_rules! mutex {
    ($(#[$meta:meta])* $vis:vis static $name:ident: Mutex<$port:ty>;) => {
        $(#[$meta])*
        $vis static $name: $crate::mutex::RawMutex<$port> =
            $crate::mutex::RawMutex::new(::core::stringify!($name));
    };
}

/// Declare a statically allocated counting semaphore (§3, Semaphore; §6).
#[macro_export]
macro_rules! semaphore {
    (
        $(#[$meta:meta])*
        $vis:vis static $name:ident: Semaphore<$port:ty> = {
            initial_count: $initial:expr,
            max_count: $max:expr $(,)?
        };
    ) => {
        $(#[$meta])*
        $vis static $name: $crate::semaphore::Semaphore<$port> =
            $crate::semaphore::Semaphore::new(::core::stringify!($name), $initial, $max);
    };
}

/// Declare a statically allocated bounded message queue and its backing
/// ring buffer (§3, Message queue; §6).
#[macro_export]
macro_rules! msg_queue {
    (
        $(#[$meta:meta])*
        $vis:vis static $name:ident: MsgQueue<$port:ty> = {
            item_size: $item_size:expr,
            length: $length:expr $(,)?
        };
    ) => {
        $(#[$meta])*
        $vis static $name: $crate::msgqueue::RawMsgQueue<$port> = {
            static mut __BUF: [u8; $item_size * $length] = [0u8; $item_size * $length];
            $crate::msgqueue::RawMsgQueue::new(
                ::core::stringify!($name),
                // Safety: see `task!`'s identical use of `addr_of_mut!`.
                unsafe { ::core::ptr::addr_of_mut!(__BUF) as *mut u8 },
                $item_size,
                $length,
            )
        };
    };
}

/// Declare a statically allocated condition variable paired with a
/// mutex the caller must hold across `wait` (§3, Condition variable;
/// §6).
#[macro_export]
macro_rules! cond_var {
    (
        $(#[$meta:meta])*
        $vis:vis static $name:ident: CondVar<$port:ty> = {
            mutex: $mutex:expr $(,)?
        };
    ) => {
        $(#[$meta])*
        $vis static $name: $crate::condvar::RawCondVar<$port> =
            $crate::condvar::RawCondVar::new(::core::stringify!($name), &$mutex);
    };
}

/// Declare a statically allocated software timer (§3, Timer; §6).
#[macro_export]
macro_rules! timer {
    (
        $(#[$meta:meta])*
        $vis:vis static $name:ident: Timer<$port:ty> = {
            handler: $handler:expr,
            param: $param:expr,
            mode: $mode:expr $(,)?
        };
    ) => {
        $(#[$meta])*
        $vis static $name: $crate::timer::TimerNode<$port> =
            $crate::timer::TimerNode::new(::core::stringify!($name), $handler, $param, $mode);
    };
}
