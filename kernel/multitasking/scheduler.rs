// Copyright 2026 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The scheduler: multilevel ready queues, priority preemption,
//! blocking, and the cooperative switch points.
//!
//! Ready tasks with no CPU affinity sit in the sixteen
//! [`GLOBAL_READY`] queues; tasks bound to a CPU sit in that CPU's
//! local queues. Blocked, uninitialised and paused tasks are parked
//! on their own queues; tasks that died are moved to the reap queue
//! and handed back through [`take_dead_task`], so their destructors
//! run outside scheduler context, on the CPU they last ran on.
//!
//! "Switching" here means deciding which task a CPU runs: the
//! decision is recorded in the CPU's current-task slot and its
//! preemption timer armed; the exception shim performs the actual
//! register switch on the way out of the kernel.

use crate::cpu::{self, Cpu};
use crate::queue::SchedQueue;
use crate::task::{SchedState, Task, TaskStatus};
use crate::{arm_timer, quantum_for_priority, send_reschedule_ipi, PRIORITY_LEVELS};
use alloc::sync::Arc;
use spin::lock;

const QUEUE: SchedQueue = SchedQueue::new();

/// The ready queues for tasks with no CPU affinity, one per
/// priority level.
///
pub static GLOBAL_READY: [SchedQueue; PRIORITY_LEVELS] = [QUEUE; PRIORITY_LEVELS];

/// The queue of blocked tasks.
///
pub static BLOCKED: SchedQueue = SchedQueue::new();

/// The queue of created-but-unstarted tasks.
///
pub static UNINIT: SchedQueue = SchedQueue::new();

/// The queue of paused tasks.
///
pub static PAUSED: SchedQueue = SchedQueue::new();

/// The queue of dying tasks awaiting their destructors.
///
pub static REAP: SchedQueue = SchedQueue::new();

/// Makes the task Ready and queues it by its affinity and
/// priority.
///
pub fn push_ready(task: &Arc<Task>) {
    let mut sched = lock!(task.sched);
    push_ready_locked(task, &mut sched);
}

// As push_ready, with the task's sched_lock already held. A
// Dying task keeps its status so the scheduler reaps it on
// pickup.
pub(crate) fn push_ready_locked(task: &Arc<Task>, sched: &mut SchedState) {
    if sched.status != TaskStatus::Dying {
        sched.status = TaskStatus::Ready;
    }

    let priority = sched.priority.min(PRIORITY_LEVELS - 1);
    if sched.affinity == 0 {
        GLOBAL_READY[priority].push_back(task.clone());
    } else {
        let cpu = cpu::get(sched.affinity - 1);
        cpu.ready[priority].push_back(task.clone());
    }
}

// Pops the next runnable task from the queue, diverting any
// dying tasks to the reap queue.
fn pop_runnable(queue: &SchedQueue) -> Option<Arc<Task>> {
    loop {
        let task = queue.pop_front()?;
        let sched = lock!(task.sched);
        if sched.status == TaskStatus::Dying {
            REAP.push_back(task.clone());
            drop(sched);
            continue;
        }

        drop(sched);
        return Some(task);
    }
}

/// Scans priorities `0..=max_priority`, local queue first, then
/// global, returning the first ready task.
///
pub fn pick_highest_priority(cpu: &Cpu, max_priority: usize) -> Option<Arc<Task>> {
    let max_priority = max_priority.min(PRIORITY_LEVELS - 1);
    for priority in 0..=max_priority {
        if let Some(task) = pop_runnable(&cpu.ready[priority]) {
            return Some(task);
        }

        if let Some(task) = pop_runnable(&GLOBAL_READY[priority]) {
            return Some(task);
        }
    }

    None
}

/// Removes and returns a task whose destructors are due, if
/// any. Drained by the reaper after each switch point.
///
pub fn take_dead_task() -> Option<Arc<Task>> {
    REAP.pop_front()
}

// Loads `next`'s address space if it differs from `old`'s. A
// task without an address space keeps whatever root is loaded
// (only the shared kernel half is reachable from kernel code),
// but the old space's active count is still released so it can
// be torn down.
fn switch_address_space(old: &Arc<Task>, next: &Arc<Task>) {
    let old_space = old.address_space();
    let next_space = next.address_space();

    let same = match (&old_space, &next_space) {
        (Some(old_space), Some(next_space)) => old_space.id() == next_space.id(),
        (None, None) => true,
        _ => false,
    };
    if same {
        return;
    }

    if let Some(space) = old_space {
        space.deactivate();
    }

    if let Some(space) = next_space {
        space.activate();
    }
}

// Makes `next` the CPU's current task and arms its quantum.
// Returns the displaced task, which the caller must park (or
// have parked already).
fn install(cpu: &Arc<Cpu>, next: Arc<Task>) -> Arc<Task> {
    let priority = {
        let mut sched = lock!(next.sched);
        if sched.status != TaskStatus::Dying && sched.status != TaskStatus::Idle {
            sched.status = TaskStatus::Running;
        }

        sched.priority
    };

    let old = cpu.replace_current(next.clone(), priority);
    switch_address_space(&old, &next);
    arm_timer(quantum_for_priority(priority));
    old
}

// Parks a task displaced from a CPU: a still-Running task goes
// back to ready (honouring a pending pause), a Dying task to
// the reap queue, and everything else has already been parked
// by whoever changed its state.
fn park_displaced(old: Arc<Task>) {
    let mut sched = lock!(old.sched);
    match sched.status {
        TaskStatus::Running => {
            if sched.pending_pause {
                sched.pending_pause = false;
                sched.status = TaskStatus::Paused;
                PAUSED.push_back(old.clone());
            } else {
                push_ready_locked(&old, &mut sched);
            }
        }
        TaskStatus::Dying => {
            if old.link.parent().is_null() {
                REAP.push_back(old.clone());
            }
        }
        _ => {}
    }
}

/// Finds the next task for this CPU and makes it current,
/// falling back to the idle task.
///
/// The displaced task is parked if it is still marked Running
/// or Dying; blocked and paused callers have parked themselves
/// beforehand.
///
pub fn find_new_process() {
    let cpu = cpu::current();
    let next = match pick_highest_priority(&cpu, PRIORITY_LEVELS - 1) {
        Some(task) => task,
        None => cpu.idle_task(),
    };

    let old = install(&cpu, next);
    park_displaced(old);
}

/// Preempts the current task if a strictly more urgent task is
/// ready.
///
pub fn reschedule() {
    let cpu = cpu::current();
    let current_priority = cpu.current_priority();
    if current_priority == 0 {
        return;
    }

    if let Some(next) = pick_highest_priority(&cpu, current_priority - 1) {
        let old = install(&cpu, next);
        park_displaced(old);
    }
}

/// The periodic scheduling tick: delivers due timer ports, then
/// round-robins among tasks at least as urgent as the current
/// one, or re-arms the quantum timer.
///
pub fn sched_periodic() {
    crate::timers::service_timer_ports();

    let cpu = cpu::current();
    let current_priority = cpu.current_priority();
    match pick_highest_priority(&cpu, current_priority) {
        Some(next) => {
            let old = install(&cpu, next);
            park_displaced(old);
        }
        None => arm_timer(quantum_for_priority(current_priority)),
    }
}

/// Voluntarily yields the CPU to any ready task, of any
/// priority.
///
pub fn yield_current() {
    let cpu = cpu::current();
    if let Some(next) = pick_highest_priority(&cpu, PRIORITY_LEVELS - 1) {
        let old = install(&cpu, next);
        park_displaced(old);
    }
}

/// Blocks the current task until a message arrives on `port`,
/// then switches away.
///
pub fn block_current_on_port(port: crate::port::PortId) {
    block_current(crate::task::BlockedOn::Port(port));
}

/// Blocks the current task until a page arrives at `page`, then
/// switches away.
///
pub fn block_current_on_page(page: usize) {
    block_current(crate::task::BlockedOn::Page(page));
}

/// Blocks the current task until a named port it is waiting for
/// is published, then switches away.
///
pub fn block_current_on_named_port() {
    block_current(crate::task::BlockedOn::PortName);
}

fn block_current(reason: crate::task::BlockedOn) {
    let cpu = cpu::current();
    let current = cpu.current_task();

    {
        let mut sched = lock!(current.sched);
        if sched.status == TaskStatus::Dying || sched.status == TaskStatus::Idle {
            return;
        }

        sched.status = TaskStatus::Blocked;
        sched.blocked_by = reason;
        BLOCKED.push_back(current.clone());
    }

    find_new_process();
}

// Places a just-woken task: it preempts the local CPU if it
// beats the running priority, queues locally or globally
// otherwise, and pokes its bound CPU when it is more urgent
// than what runs there. Requires the task's sched_lock.
pub(crate) fn place_woken(task: &Arc<Task>, sched: &mut SchedState) {
    let cpu = cpu::current();
    let local = sched.affinity == 0 || sched.affinity == cpu.id() + 1;

    if local && cpu.current_priority() > sched.priority {
        sched.status = TaskStatus::Running;
        let old = cpu.replace_current(task.clone(), sched.priority);
        switch_address_space(&old, task);
        arm_timer(quantum_for_priority(sched.priority));
        park_displaced(old);
        return;
    }

    push_ready_locked(task, sched);

    if !local {
        let remote = sched.affinity - 1;
        if cpu::get(remote).current_priority() > sched.priority {
            send_reschedule_ipi(remote);
        }
    }
}

/// Starts scheduling on this CPU by arming the quantum timer
/// for whatever is current (initially the idle task).
///
pub fn start() {
    let cpu = cpu::current();
    arm_timer(quantum_for_priority(cpu.current_priority()));
}

#[cfg(test)]
mod tests {
    use super::{
        block_current_on_port, find_new_process, pick_highest_priority, reschedule,
        sched_periodic, take_dead_task, yield_current, BLOCKED, GLOBAL_READY, PAUSED, REAP,
        UNINIT,
    };
    use crate::cpu;
    use crate::queue::SchedQueue;
    use crate::task::{Task, TaskStatus};
    use crate::PRIORITY_LEVELS;
    use alloc::string::ToString;
    use alloc::sync::Arc;
    use spin::{lock, Mutex, MutexGuard};

    // The scheduler tests share the per-CPU state, so they run
    // one at a time.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    fn drain(queue: &SchedQueue) {
        while queue.pop_front().is_some() {}
    }

    fn setup() -> MutexGuard<'static, ()> {
        let guard = lock!(TEST_LOCK);
        cpu::init(1);
        cpu::set_current_cpu(0);

        let cpu = cpu::current();
        cpu.replace_current(cpu.idle_task(), PRIORITY_LEVELS);
        for queue in GLOBAL_READY.iter().chain(cpu.ready.iter()) {
            drain(queue);
        }
        drain(&BLOCKED);
        drain(&UNINIT);
        drain(&PAUSED);
        drain(&REAP);

        guard
    }

    fn started_task(name: &str, priority: usize) -> Arc<Task> {
        let task = Task::create(name.to_string());
        task.set_priority(priority).unwrap();
        task.start(0x40_0000, 0, 0).unwrap();
        task
    }

    #[test]
    fn waking_a_more_urgent_task_preempts() {
        let _serial = setup();
        let cpu = cpu::current();

        let background = started_task("background", 8);
        find_new_process();
        assert_eq!(cpu.current_task().id(), background.id());
        assert_eq!(cpu.current_priority(), 8);

        // A priority-2 task blocks, then wakes: it must take
        // the CPU at once, with the old task at the head of its
        // ready queue.
        let urgent = started_task("urgent", 2);
        urgent.atomic_block_by_page(0x7000).unwrap();
        assert_eq!(urgent.status(), TaskStatus::Blocked);

        assert!(urgent.atomic_try_unblock_by_page(0x7000));
        assert_eq!(cpu.current_task().id(), urgent.id());
        assert_eq!(cpu.current_priority(), 2);
        assert_eq!(background.status(), TaskStatus::Ready);
        let head = GLOBAL_READY[8].pop_front().expect("old task is queued");
        assert_eq!(head.id(), background.id());

        // A second unblock of the same page is a no-op.
        assert!(!urgent.atomic_try_unblock_by_page(0x7000));
    }

    #[test]
    fn periodic_tick_round_robins_equals() {
        let _serial = setup();
        let cpu = cpu::current();

        let first = started_task("first", 8);
        find_new_process();
        assert_eq!(cpu.current_task().id(), first.id());

        let second = started_task("second", 8);

        // The tick switches between equal priorities...
        sched_periodic();
        assert_eq!(cpu.current_task().id(), second.id());
        sched_periodic();
        assert_eq!(cpu.current_task().id(), first.id());

        // ...but reschedule only preempts for strictly more
        // urgent work.
        reschedule();
        assert_eq!(cpu.current_task().id(), first.id());

        let urgent = started_task("urgent", 3);
        reschedule();
        assert_eq!(cpu.current_task().id(), urgent.id());
    }

    #[test]
    fn yield_hands_over_to_equals() {
        let _serial = setup();
        let cpu = cpu::current();

        let first = started_task("yielder", 8);
        find_new_process();
        let second = started_task("peer", 8);

        yield_current();
        assert_eq!(cpu.current_task().id(), second.id());
        assert_eq!(first.status(), TaskStatus::Ready);

        // With nothing else ready, yielding is a no-op.
        drain(&GLOBAL_READY[8]);
        yield_current();
        assert_eq!(cpu.current_task().id(), second.id());
    }

    #[test]
    fn blocking_on_a_port_parks_the_task() {
        let _serial = setup();
        let cpu = cpu::current();

        let task = started_task("receiver", 8);
        find_new_process();
        assert_eq!(cpu.current_task().id(), task.id());

        block_current_on_port(4242);
        assert_eq!(task.status(), TaskStatus::Blocked);

        // With nothing ready, the CPU idles.
        assert_eq!(cpu.current_task().id(), cpu.idle_task().id());
        assert_eq!(cpu.current_priority(), PRIORITY_LEVELS);

        // The message arrives: the receiver beats the idle task
        // and runs again.
        assert!(task.atomic_unblock_if_blocked_on(4242));
        assert_eq!(cpu.current_task().id(), task.id());
        assert_eq!(task.status(), TaskStatus::Running);
    }

    #[test]
    fn killed_tasks_are_reaped_not_run() {
        let _serial = setup();
        let cpu = cpu::current();

        let victim = started_task("victim", 8);
        victim.atomic_kill();
        assert_eq!(victim.status(), TaskStatus::Dying);

        // The scheduler diverts it to the reap queue instead of
        // running it.
        assert!(pick_highest_priority(&cpu, PRIORITY_LEVELS - 1).is_none());
        let dead = take_dead_task().expect("the victim is due for reaping");
        assert_eq!(dead.id(), victim.id());
        dead.mark_dead();
        assert_eq!(dead.status(), TaskStatus::Dead);
        assert!(Task::get(dead.id()).is_none());

        // A Dying task is never re-queued as ready.
        victim.atomic_kill();
        assert!(pick_highest_priority(&cpu, PRIORITY_LEVELS - 1).is_none());
    }

    #[test]
    fn killing_the_current_task_reaps_at_the_switch() {
        let _serial = setup();
        let cpu = cpu::current();

        let task = started_task("doomed", 8);
        find_new_process();
        assert_eq!(cpu.current_task().id(), task.id());

        // Exit path: the task kills itself, then the CPU finds
        // other work and the corpse lands on the reap queue.
        task.atomic_kill();
        find_new_process();
        assert_eq!(cpu.current_task().id(), cpu.idle_task().id());
        assert_eq!(take_dead_task().expect("reaped").id(), task.id());
    }

    #[test]
    fn pause_and_resume() {
        let _serial = setup();
        let cpu = cpu::current();

        let task = started_task("pausable", 8);
        find_new_process();

        // Pausing self parks the task; the CPU moves on.
        task.pause().unwrap();
        find_new_process();
        assert_eq!(task.status(), TaskStatus::Paused);
        assert_eq!(cpu.current_task().id(), cpu.idle_task().id());

        // Resume makes it ready again.
        task.resume().unwrap();
        assert_eq!(task.status(), TaskStatus::Ready);
        find_new_process();
        assert_eq!(cpu.current_task().id(), task.id());

        // Resuming a running task reports the state error.
        assert!(task.resume().is_err());
    }

    #[test]
    fn uninit_tasks_wait_for_start() {
        let _serial = setup();
        let cpu = cpu::current();

        let task = Task::create("not yet".to_string());
        assert_eq!(task.status(), TaskStatus::Uninit);
        assert!(pick_highest_priority(&cpu, PRIORITY_LEVELS - 1).is_none());

        // Starting twice is refused.
        task.start(0x40_0000, 1, 2).unwrap();
        assert!(task.start(0x40_0000, 1, 2).is_err());

        let picked = pick_highest_priority(&cpu, PRIORITY_LEVELS - 1).expect("now ready");
        assert_eq!(picked.id(), task.id());
        assert_eq!(task.with_regs(|regs| regs.args[0]), 1);
    }
}
