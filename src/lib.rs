//! `rtkernel` — the core of a small preemptive, priority-based RTOS
//! kernel for deeply embedded microcontrollers.
//!
//! This crate is the hardware-independent core of that kernel: a
//! priority-ordered scheduler (`sched`), the blocking
//! primitives built on top of it (`mutex`, `semaphore`, `msgqueue`,
//! `condvar`), the software timer service (`timer`), and the single
//! cross-core critical section (`spinlock`) all of the above share. It
//! does not implement a concrete microcontroller port — that is the
//! `Port` trait (`port`), which an application or board-support crate
//! supplies.
//!
//! # Example shape
//!
//! ```ignore
//! struct MyPort;
//! unsafe impl Port for MyPort { /* ... */ }
//!
//! rtkernel::task! {
//!     static WORKER: Task<MyPort> = {
//!         entry: worker_main,
//!         param: 0,
//!         priority: 10,
//!         affinity: Affinity::Any,
//!         stack_size: 4096,
//!     };
//! }
//!
//! unsafe extern "C" fn worker_main(_: usize) -> ! {
//!     loop {
//!         task::sleep::<MyPort>(Ticks::new(100)).unwrap();
//!     }
//! }
//! ```
#![cfg_attr(not(test), no_std)]

mod cfg;

pub mod condvar;
pub mod error;
pub mod mutex;
pub mod msgqueue;
pub mod port;
pub mod priority;
pub mod sched;
pub mod semaphore;
pub mod spinlock;
pub mod task;
pub mod time;
pub mod timer;
mod wait;

#[cfg(test)]
mod testing;

pub use crate::error::{Error, KernelResult};
pub use crate::port::{CoreId, Port};
pub use crate::priority::Priority;
pub use crate::time::Ticks;
