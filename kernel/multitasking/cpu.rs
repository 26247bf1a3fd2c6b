// Copyright 2026 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Per-CPU state.
//!
//! Each CPU owns its current task, an idle task to fall back on,
//! sixteen local ready queues for tasks bound to it, and the queue of
//! timer ports armed on it. The CPU table is built once during boot
//! by [`init`]; the arch layer tells the kernel which CPU is
//! executing through [`set_current_cpu`], called from each CPU's
//! early bring-up.

use crate::queue::SchedQueue;
use crate::task::Task;
use crate::PRIORITY_LEVELS;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use lazy_static::lazy_static;
use spin::{lock, Mutex};

lazy_static! {
    static ref CPUS: Mutex<Vec<Arc<Cpu>>> = Mutex::new(Vec::new());
}

static CURRENT_CPU: AtomicUsize = AtomicUsize::new(0);

/// One CPU's scheduling state.
///
pub struct Cpu {
    id: usize,

    // The local ready queues, one per priority, for tasks bound
    // to this CPU.
    pub(crate) ready: [SchedQueue; PRIORITY_LEVELS],

    // The task this CPU is running. Leaf lock: never acquire
    // anything else while holding it.
    current: Mutex<Arc<Task>>,

    idle: Arc<Task>,

    // Mirror of the running task's priority, so other CPUs can
    // make preemption decisions without taking locks.
    current_priority: AtomicUsize,

    // Timers armed on this CPU: absolute tick -> the timers
    // that fire then.
    pub(crate) timers: Mutex<BTreeMap<u64, Vec<(u64, crate::port::PortId)>>>,
}

impl Cpu {
    fn new(id: usize) -> Arc<Cpu> {
        const QUEUE: SchedQueue = SchedQueue::new();
        let idle = Task::new_idle(id);
        Arc::new(Cpu {
            id,
            ready: [QUEUE; PRIORITY_LEVELS],
            current: Mutex::new(idle.clone()),
            idle,
            current_priority: AtomicUsize::new(PRIORITY_LEVELS),
            timers: Mutex::new(BTreeMap::new()),
        })
    }

    /// Returns the CPU's id.
    ///
    pub fn id(&self) -> usize {
        self.id
    }

    /// Returns the task the CPU is running.
    ///
    pub fn current_task(&self) -> Arc<Task> {
        lock!(self.current).clone()
    }

    /// Returns the CPU's idle task.
    ///
    pub fn idle_task(&self) -> Arc<Task> {
        self.idle.clone()
    }

    /// Returns the priority of the task the CPU is running.
    ///
    pub fn current_priority(&self) -> usize {
        self.current_priority.load(Ordering::Relaxed)
    }

    // Installs a new current task, returning the previous one.
    pub(crate) fn replace_current(&self, task: Arc<Task>, priority: usize) -> Arc<Task> {
        self.current_priority.store(priority, Ordering::Relaxed);
        core::mem::replace(&mut *lock!(self.current), task)
    }
}

/// Builds the CPU table for `count` CPUs. Idempotent: later
/// calls with the same count are ignored.
///
/// # Panics
///
/// `init` panics if called again with a different count.
///
pub fn init(count: usize) {
    let mut cpus = lock!(CPUS);
    if !cpus.is_empty() {
        assert!(cpus.len() == count, "CPU table already built");
        return;
    }

    for id in 0..count {
        cpus.push(Cpu::new(id));
    }
}

/// Returns the number of CPUs.
///
pub fn count() -> usize {
    lock!(CPUS).len()
}

/// Records which CPU is executing. Called once per CPU by the
/// arch bring-up (the value is thereafter read through the
/// arch's CPU-local storage).
///
pub fn set_current_cpu(id: usize) {
    CURRENT_CPU.store(id, Ordering::SeqCst);
}

/// Returns the executing CPU.
///
/// # Panics
///
/// `current` panics before [`init`] has built the CPU table.
///
pub fn current() -> Arc<Cpu> {
    get(CURRENT_CPU.load(Ordering::Relaxed))
}

/// Returns the CPU with the given id.
///
/// # Panics
///
/// `get` panics if `id` is out of range.
///
pub fn get(id: usize) -> Arc<Cpu> {
    lock!(CPUS)[id].clone()
}

/// Returns the id of the CPU currently running the given task,
/// if any.
///
pub fn find_running(task: crate::task::TaskId) -> Option<usize> {
    let cpus = lock!(CPUS);
    for cpu in cpus.iter() {
        if cpu.current_task().id() == task {
            return Some(cpu.id);
        }
    }

    None
}
