//! Bounded FIFO message queue (§4.8).

use crate::error::{Error, KernelResult};
use crate::port::Port;
use crate::sched;
use crate::spinlock::Spinlock;
use crate::task::{BlockReason, WakeReason};
use crate::time::Ticks;
use crate::wait::WaitQueue;

struct State {
    item_count: usize,
    read_index: usize,
    write_index: usize,
}

/// A bounded FIFO ring of fixed-size byte-blob items (§4.8). Spinlock-only
/// (no internal mutex): its operations are O(1) and must be ISR-callable
/// with `wait_ticks == 0` (§9, Ambiguous source behavior — this spec
/// standardizes on the revision without a message-queue-internal mutex).
/// Statically declared, never destroyed.
pub struct RawMsgQueue<P: Port> {
    name: &'static str,
    state: Spinlock<State>,
    producer_wait: WaitQueue<P>,
    consumer_wait: WaitQueue<P>,
    buffer: *mut u8,
    item_size: usize,
    length: usize,
}

/// The public name applications declare (`msg_queue!` in `cfg.rs`).
pub type MsgQueue<P> = RawMsgQueue<P>;

// Safety: `buffer` is only accessed while `state`'s spinlock is held (for
// the index bookkeeping) or immediately after reserving/releasing a slot
// under it, never concurrently from two tasks at the same byte range.
unsafe impl<P: Port> Sync for RawMsgQueue<P> {}

impl<P: Port> RawMsgQueue<P> {
    /// `buffer` must point to `length * item_size` bytes owned
    /// exclusively by this queue for `'static` (normally the array the
    /// `msg_queue!` macro declares alongside it).
    #[inline]
    pub const fn new(name: &'static str, buffer: *mut u8, item_size: usize, length: usize) -> Self {
        RawMsgQueue {
            name,
            state: Spinlock::new(State {
                item_count: 0,
                read_index: 0,
                write_index: 0,
            }),
            producer_wait: WaitQueue::new(),
            consumer_wait: WaitQueue::new(),
            buffer,
            item_size,
            length,
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn item_size(&self) -> usize {
        self.item_size
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.length
    }

    #[inline]
    fn capacity_bytes(&self) -> usize {
        self.length * self.item_size
    }

    /// `send(queue, item_ptr, wait_ticks)` (§4.8). ISR-callable only with
    /// `wait_ticks == 0`.
    pub fn send(&'static self, item: &[u8], wait: Ticks) -> KernelResult {
        if item.len() != self.item_size {
            debug_assert!(false, "item length does not match queue item_size");
            return Err(Error::InvalidArg);
        }
        let caller = sched::current_task::<P>();

        loop {
            let mut guard = self.state.lock::<P>();
            if guard.item_count < self.length {
                let write_index = guard.write_index;
                // Safety: `write_index` is always an `item_size`-aligned
                // offset within `[0, capacity_bytes)`, and this is the
                // only writer while the lock is held.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        item.as_ptr(),
                        self.buffer.add(write_index),
                        self.item_size,
                    );
                }
                guard.write_index = (write_index + self.item_size) % self.capacity_bytes();
                guard.item_count += 1;
                drop(guard);

                if let Some(waiter) = self.consumer_wait.wake_one(WakeReason::MsgQueueDataAvailable) {
                    if waiter.effective_priority() <= caller.effective_priority() {
                        sched::yield_now::<P>();
                    }
                }
                return Ok(());
            }
            drop(guard);

            if wait.is_zero() {
                return Err(Error::Full);
            }

            match self.producer_wait.block(BlockReason::WaitForMsgQueueSpace, wait) {
                WakeReason::MsgQueueSpaceAvailable => continue,
                WakeReason::WaitTimeout => return Err(Error::Timeout),
                WakeReason::Resume => continue,
                _ => return Err(Error::InvalidArg),
            }
        }
    }

    /// Non-blocking `send(queue, item_ptr, 0)`.
    #[inline]
    pub fn try_send(&'static self, item: &[u8]) -> KernelResult {
        self.send(item, Ticks::ZERO)
    }

    /// `receive(queue, out_ptr, wait_ticks)` (§4.8). ISR-callable only
    /// with `wait_ticks == 0`.
    pub fn receive(&'static self, out: &mut [u8], wait: Ticks) -> KernelResult {
        if out.len() != self.item_size {
            debug_assert!(false, "output buffer length does not match queue item_size");
            return Err(Error::InvalidArg);
        }
        let caller = sched::current_task::<P>();

        loop {
            let mut guard = self.state.lock::<P>();
            if guard.item_count > 0 {
                let read_index = guard.read_index;
                // Safety: `read_index` is always an `item_size`-aligned
                // offset within `[0, capacity_bytes)`, and this is the
                // only reader while the lock is held.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        self.buffer.add(read_index),
                        out.as_mut_ptr(),
                        self.item_size,
                    );
                }
                guard.read_index = (read_index + self.item_size) % self.capacity_bytes();
                guard.item_count -= 1;
                drop(guard);

                if let Some(waiter) = self.producer_wait.wake_one(WakeReason::MsgQueueSpaceAvailable) {
                    if waiter.effective_priority() <= caller.effective_priority() {
                        sched::yield_now::<P>();
                    }
                }
                return Ok(());
            }
            drop(guard);

            if wait.is_zero() {
                return Err(Error::Empty);
            }

            match self.consumer_wait.block(BlockReason::WaitForMsgQueueData, wait) {
                WakeReason::MsgQueueDataAvailable => continue,
                WakeReason::WaitTimeout => return Err(Error::Timeout),
                WakeReason::Resume => continue,
                _ => return Err(Error::InvalidArg),
            }
        }
    }

    /// Non-blocking `receive(queue, out_ptr, 0)`.
    #[inline]
    pub fn try_receive(&'static self, out: &mut [u8]) -> KernelResult {
        self.receive(out, Ticks::ZERO)
    }
}

#[cfg(test)]
impl<P: Port> RawMsgQueue<P> {
    pub(crate) fn consumer_wait_tag_for_test(&self) -> usize {
        self.consumer_wait.tag_for_test()
    }

    pub(crate) fn producer_wait_tag_for_test(&self) -> usize {
        self.producer_wait.tag_for_test()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::priority::Priority;
    use crate::task::{Affinity, TaskState};
    use crate::testing::{begin_test, block_waiter, new_task, spawn_task, MockPort};

    #[test]
    fn send_then_receive_round_trips_fifo_order() {
        let _g = begin_test();
        spawn_task("t", Priority::new(5), Affinity::Any);
        crate::msg_queue! {
            static Q: MsgQueue<MockPort> = { item_size: 2, length: 4 };
        }

        Q.send(&[1, 2], Ticks::ZERO).unwrap();
        Q.send(&[3, 4], Ticks::ZERO).unwrap();

        let mut out = [0u8; 2];
        Q.receive(&mut out, Ticks::ZERO).unwrap();
        assert_eq!(out, [1, 2]);
        Q.receive(&mut out, Ticks::ZERO).unwrap();
        assert_eq!(out, [3, 4]);
    }

    #[test]
    fn try_receive_reports_empty() {
        let _g = begin_test();
        spawn_task("t", Priority::new(5), Affinity::Any);
        crate::msg_queue! {
            static Q: MsgQueue<MockPort> = { item_size: 2, length: 4 };
        }

        let mut out = [0u8; 2];
        assert_eq!(Q.try_receive(&mut out), Err(Error::Empty));
    }

    #[test]
    fn try_send_reports_full_at_capacity() {
        let _g = begin_test();
        spawn_task("t", Priority::new(5), Affinity::Any);
        crate::msg_queue! {
            static Q: MsgQueue<MockPort> = { item_size: 2, length: 4 };
        }

        for _ in 0..Q.capacity() {
            Q.try_send(&[9, 9]).unwrap();
        }
        assert_eq!(Q.try_send(&[9, 9]), Err(Error::Full));
    }

    #[test]
    fn send_rejects_mismatched_item_length() {
        let _g = begin_test();
        spawn_task("t", Priority::new(5), Affinity::Any);
        crate::msg_queue! {
            static Q: MsgQueue<MockPort> = { item_size: 2, length: 4 };
        }

        assert_eq!(Q.send(&[1, 2, 3], Ticks::ZERO), Err(Error::InvalidArg));
    }

    #[test]
    fn send_wakes_a_queued_consumer_directly() {
        let _g = begin_test();
        spawn_task("t", Priority::new(1), Affinity::Any);
        crate::msg_queue! {
            static Q: MsgQueue<MockPort> = { item_size: 2, length: 4 };
        }
        // Lower priority than `t`, so waking it doesn't also preempt `t`.
        let waiter = new_task("waiter", Priority::new(10), Affinity::Any);
        block_waiter(
            waiter,
            BlockReason::WaitForMsgQueueData,
            Q.consumer_wait_tag_for_test(),
        );

        Q.send(&[7, 7], Ticks::ZERO).unwrap();
        assert_eq!(waiter.state(), TaskState::Ready);
        assert_eq!(waiter.wake_reason(), WakeReason::MsgQueueDataAvailable);
    }

    #[test]
    fn receive_wakes_a_queued_producer_directly() {
        let _g = begin_test();
        spawn_task("t", Priority::new(1), Affinity::Any);
        crate::msg_queue! {
            static Q: MsgQueue<MockPort> = { item_size: 2, length: 4 };
        }
        Q.try_send(&[1, 1]).unwrap();
        // Lower priority than `t`, so waking it doesn't also preempt `t`.
        let waiter = new_task("waiter", Priority::new(10), Affinity::Any);
        block_waiter(
            waiter,
            BlockReason::WaitForMsgQueueSpace,
            Q.producer_wait_tag_for_test(),
        );

        let mut out = [0u8; 2];
        Q.receive(&mut out, Ticks::ZERO).unwrap();
        assert_eq!(waiter.state(), TaskState::Ready);
        assert_eq!(waiter.wake_reason(), WakeReason::MsgQueueSpaceAvailable);
    }
}
