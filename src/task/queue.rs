//! Priority-ordered singly linked task queue (§4.3).
//!
//! Reused, unmodified, as the scheduler's ready queue, the scheduler's
//! blocked queue, and every primitive's wait queue: all of them are
//! "a priority-ordered list of tasks" per the glossary, and a task is a
//! member of at most one such queue at a time, so they can all share the
//! task's single intrusive `link` field (§9, Design Notes).

use core::ptr::NonNull;

use super::Task;
use crate::port::{CoreId, Port};

pub struct TaskQueue<P: Port> {
    head: Option<NonNull<Task<P>>>,
}

impl<P: Port> TaskQueue<P> {
    #[inline]
    pub const fn new() -> Self {
        TaskQueue { head: None }
    }

    #[inline]
    pub fn empty(&self) -> bool {
        self.head.is_none()
    }

    /// Insert in ascending effective-priority order. Among equal
    /// priorities, inserts after every existing task at that priority,
    /// which is what makes round-robin emerge from re-insertion (§4.4).
    pub fn add(&mut self, task: &'static Task<P>) {
        debug_assert!(task.link().is_none(), "task already queued");

        let new = NonNull::from(task);
        let prio = task.effective_priority();

        let mut prev: Option<NonNull<Task<P>>> = None;
        let mut cursor = self.head;
        while let Some(node) = cursor {
            // Safety: every linked node is a live `'static` task.
            let node_ref = unsafe { node.as_ref() };
            if node_ref.effective_priority() > prio {
                break;
            }
            prev = Some(node);
            cursor = node_ref.link();
        }

        task.set_link(cursor);
        match prev {
            Some(p) => unsafe { p.as_ref().set_link(Some(new)) },
            None => self.head = Some(new),
        }
    }

    /// Unlink and return the highest-priority task whose affinity admits
    /// `core`, skipping ineligible heads.
    pub fn get(&mut self, core: CoreId) -> Option<&'static Task<P>> {
        let mut prev: Option<NonNull<Task<P>>> = None;
        let mut cursor = self.head;
        while let Some(node) = cursor {
            // Safety: every linked node is a live `'static` task.
            let node_ref = unsafe { node.as_ref() };
            let next = node_ref.link();
            if node_ref.affinity().admits_core(core) {
                node_ref.set_link(None);
                match prev {
                    Some(p) => unsafe { p.as_ref().set_link(next) },
                    None => self.head = next,
                }
                return Some(node_ref);
            }
            prev = Some(node);
            cursor = next;
        }
        None
    }

    /// Same scan as `get`, without unlinking.
    pub fn peek(&self, core: CoreId) -> Option<&'static Task<P>> {
        let mut cursor = self.head;
        while let Some(node) = cursor {
            // Safety: every linked node is a live `'static` task.
            let node_ref = unsafe { node.as_ref() };
            if node_ref.affinity().admits_core(core) {
                return Some(node_ref);
            }
            cursor = node_ref.link();
        }
        None
    }

    /// Unlink and return the highest-priority task admitted by both
    /// `core` affinity and `pred`. Used by `wait.rs` to pop a primitive's
    /// own waiters out of the shared blocked queue.
    pub fn get_where(
        &mut self,
        core: CoreId,
        pred: impl Fn(&'static Task<P>) -> bool,
    ) -> Option<&'static Task<P>> {
        let mut prev: Option<NonNull<Task<P>>> = None;
        let mut cursor = self.head;
        while let Some(node) = cursor {
            // Safety: every linked node is a live `'static` task.
            let node_ref = unsafe { node.as_ref() };
            let next = node_ref.link();
            if node_ref.affinity().admits_core(core) && pred(node_ref) {
                node_ref.set_link(None);
                match prev {
                    Some(p) => unsafe { p.as_ref().set_link(next) },
                    None => self.head = next,
                }
                return Some(node_ref);
            }
            prev = Some(node);
            cursor = next;
        }
        None
    }

    /// Same scan as `get_where`, without unlinking.
    pub fn peek_where(
        &self,
        core: CoreId,
        pred: impl Fn(&'static Task<P>) -> bool,
    ) -> Option<&'static Task<P>> {
        let mut cursor = self.head;
        while let Some(node) = cursor {
            // Safety: every linked node is a live `'static` task.
            let node_ref = unsafe { node.as_ref() };
            if node_ref.affinity().admits_core(core) && pred(node_ref) {
                return Some(node_ref);
            }
            cursor = node_ref.link();
        }
        None
    }

    /// O(n) removal by identity. Used when a waiter is suspended or times
    /// out while queued.
    pub fn remove(&mut self, task: &'static Task<P>) {
        let target = NonNull::from(task);
        let mut prev: Option<NonNull<Task<P>>> = None;
        let mut cursor = self.head;
        while let Some(node) = cursor {
            // Safety: every linked node is a live `'static` task.
            let node_ref = unsafe { node.as_ref() };
            let next = node_ref.link();
            if node == target {
                node_ref.set_link(None);
                match prev {
                    Some(p) => unsafe { p.as_ref().set_link(next) },
                    None => self.head = next,
                }
                return;
            }
            prev = Some(node);
            cursor = next;
        }
    }

    /// Unlink and return the highest-priority task matching `pred`,
    /// ignoring core affinity entirely. Used to pop a primitive's own
    /// waiters out of the shared blocked queue: affinity only matters at
    /// ready-queue dispatch time, not while a task merely waits to be
    /// marked READY again.
    pub fn get_first_where(&mut self, pred: impl Fn(&'static Task<P>) -> bool) -> Option<&'static Task<P>> {
        let mut prev: Option<NonNull<Task<P>>> = None;
        let mut cursor = self.head;
        while let Some(node) = cursor {
            // Safety: every linked node is a live `'static` task.
            let node_ref = unsafe { node.as_ref() };
            let next = node_ref.link();
            if pred(node_ref) {
                node_ref.set_link(None);
                match prev {
                    Some(p) => unsafe { p.as_ref().set_link(next) },
                    None => self.head = next,
                }
                return Some(node_ref);
            }
            prev = Some(node);
            cursor = next;
        }
        None
    }

    /// Same scan as `get_first_where`, without unlinking.
    pub fn peek_first_where(&self, pred: impl Fn(&'static Task<P>) -> bool) -> Option<&'static Task<P>> {
        let mut cursor = self.head;
        while let Some(node) = cursor {
            // Safety: every linked node is a live `'static` task.
            let node_ref = unsafe { node.as_ref() };
            if pred(node_ref) {
                return Some(node_ref);
            }
            cursor = node_ref.link();
        }
        None
    }

    /// Iterate without unlinking, for the tick handler's sleep-timeout
    /// walk over the blocked queue (§4.4).
    pub(crate) fn iter(&self) -> TaskQueueIter<'_, P> {
        TaskQueueIter {
            cursor: self.head,
            _marker: core::marker::PhantomData,
        }
    }
}

pub(crate) struct TaskQueueIter<'a, P: Port> {
    cursor: Option<NonNull<Task<P>>>,
    _marker: core::marker::PhantomData<&'a TaskQueue<P>>,
}

impl<'a, P: Port> Iterator for TaskQueueIter<'a, P> {
    type Item = &'static Task<P>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.cursor?;
        // Safety: every linked node is a live `'static` task.
        let node_ref = unsafe { node.as_ref() };
        self.cursor = node_ref.link();
        Some(node_ref)
    }
}

impl super::Affinity {
    #[inline]
    pub(crate) fn admits_core(self, core: CoreId) -> bool {
        match self {
            super::Affinity::Any => true,
            super::Affinity::Core(c) => c == core,
        }
    }
}
