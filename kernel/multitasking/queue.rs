// Copyright 2026 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Intrusive scheduling queues.
//!
//! Tasks carry their queue links inline, so a queue never allocates
//! and unlinking a task is O(1). The rules that make the raw
//! pointers sound:
//!
//! - A task is linked into at most one queue at a time. Its
//!   `parent_queue` pointer names that queue, or null.
//! - The link fields of a task are only read or written while the
//!   owning queue's lock is held.
//! - A queue holds one `Arc` reference (as a raw pointer) for every
//!   task linked into it, so a queued task can never be freed.
//! - Changing *which* queue a task is in additionally requires the
//!   task's `sched_lock`, which serialises competing unblock and
//!   kill paths; the queue lock alone only protects the list
//!   structure.

use crate::task::Task;
use alloc::sync::Arc;
use core::ptr;
use spin::{lock, Mutex};

// The queue links embedded in every task. The cells are guarded
// by the lock of the queue named by `parent`.
pub(crate) struct QueueLink {
    prev: core::cell::Cell<*const Task>,
    next: core::cell::Cell<*const Task>,
    parent: core::sync::atomic::AtomicPtr<SchedQueue>,
}

impl QueueLink {
    pub(crate) const fn new() -> Self {
        QueueLink {
            prev: core::cell::Cell::new(ptr::null()),
            next: core::cell::Cell::new(ptr::null()),
            parent: core::sync::atomic::AtomicPtr::new(ptr::null_mut()),
        }
    }

    // The queue the task is currently linked into, if any.
    pub(crate) fn parent(&self) -> *const SchedQueue {
        self.parent.load(core::sync::atomic::Ordering::Relaxed)
    }
}

// The links are only touched under the owning queue's lock.
unsafe impl Send for QueueLink {}
unsafe impl Sync for QueueLink {}

struct QueueInner {
    head: *const Task,
    tail: *const Task,
    len: usize,
}

unsafe impl Send for QueueInner {}

/// A doubly-linked queue of tasks, linked through the tasks
/// themselves.
///
pub struct SchedQueue {
    inner: Mutex<QueueInner>,
}

impl SchedQueue {
    /// Returns an empty queue.
    ///
    pub const fn new() -> Self {
        SchedQueue {
            inner: Mutex::new(QueueInner {
                head: ptr::null(),
                tail: ptr::null(),
                len: 0,
            }),
        }
    }

    /// Returns the number of tasks in the queue.
    ///
    pub fn len(&self) -> usize {
        lock!(self.inner).len
    }

    /// Returns whether the queue is empty.
    ///
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends the task to the tail of the queue.
    ///
    /// The caller must hold the task's `sched_lock` and the
    /// task must not be in any queue.
    ///
    pub fn push_back(&self, task: Arc<Task>) {
        let mut inner = lock!(self.inner);
        let raw = Arc::into_raw(task);
        let link = unsafe { &(*raw).link };
        debug_assert!(link.parent().is_null(), "task is already queued");

        link.prev.set(inner.tail);
        link.next.set(ptr::null());
        link.parent
            .store(self as *const SchedQueue as *mut SchedQueue, core::sync::atomic::Ordering::Relaxed);

        if inner.tail.is_null() {
            inner.head = raw;
        } else {
            unsafe { (*inner.tail).link.next.set(raw) };
        }

        inner.tail = raw;
        inner.len += 1;
    }

    /// Removes and returns the task at the head of the queue.
    ///
    pub fn pop_front(&self) -> Option<Arc<Task>> {
        let mut inner = lock!(self.inner);
        let raw = inner.head;
        if raw.is_null() {
            return None;
        }

        let link = unsafe { &(*raw).link };
        inner.head = link.next.get();
        if inner.head.is_null() {
            inner.tail = ptr::null();
        } else {
            unsafe { (*inner.head).link.prev.set(ptr::null()) };
        }

        link.prev.set(ptr::null());
        link.next.set(ptr::null());
        link.parent
            .store(ptr::null_mut(), core::sync::atomic::Ordering::Relaxed);
        inner.len -= 1;

        Some(unsafe { Arc::from_raw(raw) })
    }

    /// Unlinks the given task from this queue, returning the
    /// queue's reference to it.
    ///
    /// The caller must hold the task's `sched_lock` and the
    /// task must be linked into this queue.
    ///
    pub fn remove(&self, task: &Task) -> Arc<Task> {
        let mut inner = lock!(self.inner);
        debug_assert!(core::ptr::eq(task.link.parent(), self));

        let raw = task as *const Task;
        let prev = task.link.prev.get();
        let next = task.link.next.get();

        if prev.is_null() {
            inner.head = next;
        } else {
            unsafe { (*prev).link.next.set(next) };
        }

        if next.is_null() {
            inner.tail = prev;
        } else {
            unsafe { (*next).link.prev.set(prev) };
        }

        task.link.prev.set(ptr::null());
        task.link.next.set(ptr::null());
        task.link
            .parent
            .store(ptr::null_mut(), core::sync::atomic::Ordering::Relaxed);
        inner.len -= 1;

        unsafe { Arc::from_raw(raw) }
    }
}

impl Default for SchedQueue {
    fn default() -> Self {
        Self::new()
    }
}
