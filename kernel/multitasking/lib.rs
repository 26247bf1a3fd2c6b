// Copyright 2026 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Preemptive multitasking: tasks, task groups, the per-CPU
//! scheduler, and port IPC.
//!
//! The pieces fit together as follows:
//!
//! - [`task`] holds the task descriptor: register file, scheduling
//!   state behind the task's `sched_lock`, the task's address space,
//!   and the blocking/unblocking and lifecycle transitions.
//! - [`queue`] is the intrusive doubly-linked list the scheduler
//!   strings tasks on. A task is linked into at most one queue at a
//!   time and unlinking is O(1).
//! - [`cpu`] is the per-CPU state: the running task, the idle task,
//!   sixteen local ready queues and the timer-port queue.
//! - [`scheduler`] implements priority scheduling with the quantum
//!   table, preemption, blocking and the cooperative switch points.
//! - [`port`] is the IPC layer: owner-bound message queues, send
//!   rights scoped to task groups, and the atomic send-with-reply
//!   operation.
//! - [`group`] implements task groups, which double as the rights
//!   namespaces, with watcher-port notifications.
//!
//! Context switching itself (saving and restoring the register file)
//! belongs to the external exception shim: the scheduler only decides
//! *which* task each CPU runs and keeps every queue consistent; the
//! shim reads the decision on the way back to userspace. For the same
//! reason the reschedule IPI and the preemption timer are reached
//! through hooks installed at boot with [`set_sched_hooks`].

#![no_std]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

extern crate alloc;

pub mod cpu;
pub mod group;
pub mod port;
pub mod queue;
pub mod scheduler;
pub mod task;
pub mod timers;

pub use crate::task::{BlockedOn, RegisterFile, Task, TaskId, TaskStatus};

use core::mem;
use core::sync::atomic::{AtomicUsize, Ordering};

/// The number of scheduling priority levels. Priority 0 is the
/// most urgent.
///
pub const PRIORITY_LEVELS: usize = 16;

/// The quantum granted per priority level, in milliseconds.
///
pub const QUANTUMS: [u32; PRIORITY_LEVELS] =
    [50, 50, 20, 20, 10, 10, 10, 5, 5, 5, 5, 5, 5, 5, 5, 5];

/// Returns the quantum for the given priority, in
/// milliseconds.
///
pub fn quantum_for_priority(priority: usize) -> u32 {
    if priority < PRIORITY_LEVELS {
        QUANTUMS[priority]
    } else {
        100
    }
}

/// Sends a reschedule interrupt to the given CPU.
///
pub type RescheduleIpiFn = fn(usize);

/// Arms the executing CPU's preemption timer for the given
/// number of milliseconds.
///
pub type SetTimerFn = fn(u32);

static IPI_HOOK: AtomicUsize = AtomicUsize::new(0);
static TIMER_HOOK: AtomicUsize = AtomicUsize::new(0);

/// Installs the scheduler's architecture hooks: the reschedule
/// IPI sender and the preemption timer. No-ops until installed.
///
pub fn set_sched_hooks(ipi: RescheduleIpiFn, set_timer: SetTimerFn) {
    IPI_HOOK.store(ipi as usize, Ordering::SeqCst);
    TIMER_HOOK.store(set_timer as usize, Ordering::SeqCst);
}

pub(crate) fn send_reschedule_ipi(cpu: usize) {
    let hook = IPI_HOOK.load(Ordering::Relaxed);
    if hook != 0 {
        let hook: RescheduleIpiFn = unsafe { mem::transmute(hook) };
        hook(cpu);
    }
}

pub(crate) fn arm_timer(milliseconds: u32) {
    let hook = TIMER_HOOK.load(Ordering::Relaxed);
    if hook != 0 {
        let hook: SetTimerFn = unsafe { mem::transmute(hook) };
        hook(milliseconds);
    }
}
