// Copyright 2026 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The task descriptor and its state transitions.

use crate::port::PortId;
use crate::queue::QueueLink;
use crate::{cpu, scheduler};
use abi::Error;
use addrspace::AddressSpace;
use alloc::collections::BTreeSet;
use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};
use lazy_static::lazy_static;
use spin::{lock, Mutex};

/// Uniquely identifies a task throughout the kernel.
///
pub type TaskId = u64;

lazy_static! {
    /// The global task index.
    ///
    pub static ref TASKS: Mutex<alloc::collections::BTreeMap<TaskId, Arc<Task>>> =
        Mutex::new(alloc::collections::BTreeMap::new());
}

fn next_task_id() -> TaskId {
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// The scheduling state of a task.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    /// Created but not yet started; has no entry point.
    Uninit,

    /// On a ready queue, waiting for a CPU.
    Ready,

    /// The current task of some CPU.
    Running,

    /// Waiting for a port, a named port, or a page.
    Blocked,

    /// Taken off the scheduler until resumed.
    Paused,

    /// Killed; awaiting its reaping by the scheduler.
    Dying,

    /// Reaped. Only the task index reference remains.
    Dead,

    /// A per-CPU idle task. Never queued.
    Idle,
}

/// What a blocked task is waiting for.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockedOn {
    /// Not blocked.
    Nothing,

    /// A message arriving on the port.
    Port(PortId),

    /// A port appearing under a name.
    PortName,

    /// A page arriving at the virtual address.
    Page(usize),
}

/// A task's saved user-visible registers, in the
/// architecture-neutral shape the syscall layer works with.
///
/// The exception shim translates between this and the real
/// trap frame.
///
#[derive(Clone, Copy, Debug, Default)]
pub struct RegisterFile {
    /// The user program counter.
    pub program_counter: usize,

    /// The user stack pointer.
    pub stack_pointer: usize,

    /// The syscall number of the in-flight syscall.
    pub syscall_number: u64,

    /// The syscall argument registers.
    pub args: [u64; 6],

    /// The success-value return register.
    pub ret_value: u64,

    /// The error return register: zero or a negative errno.
    pub ret_error: i64,

    // When set, the task re-enters the same syscall, with the
    // same arguments, on its next run.
    restart: bool,
}

impl RegisterFile {
    /// Returns the 64-bit syscall argument at `index`.
    ///
    pub fn arg(&self, index: usize) -> u64 {
        self.args[index]
    }

    /// Returns the 32-bit syscall argument at `index`.
    ///
    pub fn arg32(&self, index: usize) -> u32 {
        self.args[index] as u32
    }

    /// Marks the in-flight syscall for re-entry on wake.
    ///
    pub fn request_restart(&mut self) {
        self.restart = true;
    }

    /// Clears the restart mark.
    ///
    pub fn clear_restart(&mut self) {
        self.restart = false;
    }

    /// Returns whether a syscall restart is pending.
    ///
    pub fn restart_pending(&self) -> bool {
        self.restart
    }
}

// The state guarded by the task's sched_lock.
pub(crate) struct SchedState {
    pub(crate) status: TaskStatus,

    // 0 (most urgent) to 15.
    pub(crate) priority: usize,

    // 0 = any CPU; otherwise CPU id + 1.
    pub(crate) affinity: usize,

    pub(crate) blocked_by: BlockedOn,

    // Set when another CPU asked for this (running) task to be
    // paused; honoured at the next switch point.
    pub(crate) pending_pause: bool,
}

/// A task: the unit of scheduling and resource ownership.
///
pub struct Task {
    id: TaskId,

    // The intrusive queue links; see the queue module for the
    // locking rules.
    pub(crate) link: QueueLink,

    // Scheduling state, under the sched_lock.
    pub(crate) sched: Mutex<SchedState>,

    // The saved register file. Only ever touched while the task
    // is not running user code: by the task's own syscalls, or
    // by syscalls targeting an Uninit/Blocked/Paused task.
    regs: Mutex<RegisterFile>,

    // The task's address space, absent until assigned.
    space: Mutex<Option<Arc<AddressSpace>>>,

    // Ports owned by this task.
    owned_ports: Mutex<BTreeSet<PortId>>,

    // Groups the task belongs to, and the group whose rights
    // table the task currently uses.
    groups: Mutex<BTreeSet<u64>>,
    rights_namespace: Mutex<Option<u64>>,

    name: Mutex<String>,

    // (low, high) words recorded by exit.
    exit_code: Mutex<(u64, u64)>,
}

impl Task {
    /// Creates a task in the Uninit state, registers it, and
    /// parks it on the uninit queue.
    ///
    pub fn create(name: String) -> Arc<Task> {
        let task = Arc::new(Task {
            id: next_task_id(),
            link: QueueLink::new(),
            sched: Mutex::new(SchedState {
                status: TaskStatus::Uninit,
                priority: 8,
                affinity: 0,
                blocked_by: BlockedOn::Nothing,
                pending_pause: false,
            }),
            regs: Mutex::new(RegisterFile::default()),
            space: Mutex::new(None),
            owned_ports: Mutex::new(BTreeSet::new()),
            groups: Mutex::new(BTreeSet::new()),
            rights_namespace: Mutex::new(None),
            name: Mutex::new(name),
            exit_code: Mutex::new((0, 0)),
        });

        lock!(TASKS).insert(task.id, task.clone());
        {
            let _sched = lock!(task.sched);
            scheduler::UNINIT.push_back(task.clone());
        }

        task
    }

    // A bare task for unit tests: registered nowhere, queued
    // nowhere.
    #[cfg(test)]
    pub(crate) fn create_for_test(name: &str) -> Arc<Task> {
        Arc::new(Task {
            id: next_task_id(),
            link: QueueLink::new(),
            sched: Mutex::new(SchedState {
                status: TaskStatus::Uninit,
                priority: 8,
                affinity: 0,
                blocked_by: BlockedOn::Nothing,
                pending_pause: false,
            }),
            regs: Mutex::new(RegisterFile::default()),
            space: Mutex::new(None),
            owned_ports: Mutex::new(BTreeSet::new()),
            groups: Mutex::new(BTreeSet::new()),
            rights_namespace: Mutex::new(None),
            name: Mutex::new(String::from(name)),
            exit_code: Mutex::new((0, 0)),
        })
    }

    #[cfg(test)]
    pub(crate) fn link_parent(&self) -> *const crate::queue::SchedQueue {
        self.link.parent()
    }

    // The idle task for a CPU. Bound to that CPU, never queued,
    // never in the task index.
    pub(crate) fn new_idle(cpu_id: usize) -> Arc<Task> {
        Arc::new(Task {
            id: 0,
            link: QueueLink::new(),
            sched: Mutex::new(SchedState {
                status: TaskStatus::Idle,
                priority: crate::PRIORITY_LEVELS,
                affinity: cpu_id + 1,
                blocked_by: BlockedOn::Nothing,
                pending_pause: false,
            }),
            regs: Mutex::new(RegisterFile::default()),
            space: Mutex::new(None),
            owned_ports: Mutex::new(BTreeSet::new()),
            groups: Mutex::new(BTreeSet::new()),
            rights_namespace: Mutex::new(None),
            name: Mutex::new(String::from("idle")),
            exit_code: Mutex::new((0, 0)),
        })
    }

    /// Returns the task with the given id, or `None`.
    ///
    pub fn get(id: TaskId) -> Option<Arc<Task>> {
        lock!(TASKS).get(&id).cloned()
    }

    /// Returns the task's unique id.
    ///
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Returns the task's name.
    ///
    pub fn name(&self) -> String {
        lock!(self.name).clone()
    }

    /// Renames the task.
    ///
    pub fn set_name(&self, name: String) {
        *lock!(self.name) = name;
    }

    /// Returns the task's scheduling status.
    ///
    pub fn status(&self) -> TaskStatus {
        lock!(self.sched).status
    }

    /// Returns the task's priority.
    ///
    pub fn priority(&self) -> usize {
        lock!(self.sched).priority
    }

    /// Changes the task's priority.
    ///
    /// Takes effect at the task's next scheduling decision.
    ///
    pub fn set_priority(&self, priority: usize) -> Result<(), Error> {
        if priority >= crate::PRIORITY_LEVELS {
            return Err(Error::InvalidArgument);
        }

        lock!(self.sched).priority = priority;
        Ok(())
    }

    /// Returns what the task is blocked on.
    ///
    pub fn blocked_on(&self) -> BlockedOn {
        lock!(self.sched).blocked_by
    }

    /// Runs `f` on the task's register file.
    ///
    pub fn with_regs<R>(&self, f: impl FnOnce(&mut RegisterFile) -> R) -> R {
        f(&mut *lock!(self.regs))
    }

    /// Returns the task's address space, if assigned.
    ///
    pub fn address_space(&self) -> Option<Arc<AddressSpace>> {
        lock!(self.space).clone()
    }

    /// Assigns the task's address space.
    ///
    /// Fails with [`Error::HasPageTable`] if one is already
    /// assigned.
    ///
    pub fn assign_address_space(&self, space: Arc<AddressSpace>) -> Result<(), Error> {
        let mut slot = lock!(self.space);
        if slot.is_some() {
            return Err(Error::HasPageTable);
        }

        *slot = Some(space);
        Ok(())
    }

    /// Takes the task's address space away, for teardown.
    ///
    pub fn take_address_space(&self) -> Option<Arc<AddressSpace>> {
        lock!(self.space).take()
    }

    /// Records that the task owns the given port.
    ///
    pub fn add_owned_port(&self, port: PortId) {
        lock!(self.owned_ports).insert(port);
    }

    /// Removes a port from the task's owned set.
    ///
    pub fn remove_owned_port(&self, port: PortId) {
        lock!(self.owned_ports).remove(&port);
    }

    /// Takes the set of ports the task owns, for teardown.
    ///
    pub fn take_owned_ports(&self) -> BTreeSet<PortId> {
        core::mem::take(&mut *lock!(self.owned_ports))
    }

    /// Records group membership.
    ///
    pub fn add_group(&self, group: u64) {
        lock!(self.groups).insert(group);
    }

    /// Removes group membership.
    ///
    pub fn remove_group(&self, group: u64) {
        lock!(self.groups).remove(&group);
    }

    /// Returns the groups the task belongs to.
    ///
    pub fn group_ids(&self) -> alloc::vec::Vec<u64> {
        lock!(self.groups).iter().copied().collect()
    }

    /// Returns the group whose rights table the task uses.
    ///
    pub fn rights_namespace(&self) -> Option<u64> {
        *lock!(self.rights_namespace)
    }

    /// Switches the task's active rights namespace, returning
    /// the previous one.
    ///
    pub fn set_rights_namespace(&self, group: u64) -> Option<u64> {
        lock!(self.rights_namespace).replace(group)
    }

    /// Records the task's exit code.
    ///
    pub fn set_exit_code(&self, low: u64, high: u64) {
        *lock!(self.exit_code) = (low, high);
    }

    /// Returns the task's recorded exit code.
    ///
    pub fn exit_code(&self) -> (u64, u64) {
        *lock!(self.exit_code)
    }

    /// Starts an Uninit task: sets its entry point and initial
    /// arguments and makes it Ready.
    ///
    pub fn start(self: &Arc<Self>, entry: usize, arg1: u64, arg2: u64) -> Result<(), Error> {
        let mut sched = lock!(self.sched);
        if sched.status != TaskStatus::Uninit {
            return Err(Error::ProcessInited);
        }

        self.with_regs(|regs| {
            regs.program_counter = entry;
            regs.args[0] = arg1;
            regs.args[1] = arg2;
        });

        self.unlink_from_parent();
        scheduler::push_ready_locked(self, &mut sched);
        Ok(())
    }

    /// Marks the task Dying. A blocked or parked task is made
    /// runnable so its CPU picks it up and reaps it; a task
    /// running on a CPU is reaped at that CPU's next switch
    /// point.
    ///
    pub fn atomic_kill(self: &Arc<Self>) {
        let mut sched = lock!(self.sched);
        match sched.status {
            TaskStatus::Dying | TaskStatus::Dead | TaskStatus::Idle => return,
            TaskStatus::Running => {
                sched.status = TaskStatus::Dying;
            }
            TaskStatus::Ready => {
                // Already queued; the scheduler reaps it on
                // pickup.
                sched.status = TaskStatus::Dying;
            }
            TaskStatus::Uninit | TaskStatus::Paused | TaskStatus::Blocked => {
                sched.status = TaskStatus::Dying;
                sched.blocked_by = BlockedOn::Nothing;
                self.unlink_from_parent();
                scheduler::push_ready_locked(self, &mut sched);
            }
        }
    }

    /// Blocks the task on a page arriving at `page`.
    ///
    /// If the task is the executing CPU's current task, the
    /// caller must follow up with
    /// [`scheduler::find_new_process`].
    ///
    pub fn atomic_block_by_page(self: &Arc<Self>, page: usize) -> Result<(), Error> {
        let mut sched = lock!(self.sched);
        if sched.status == TaskStatus::Dying {
            return Ok(());
        }

        if sched.status == TaskStatus::Blocked {
            return Err(Error::AlreadyBlocked);
        }

        sched.status = TaskStatus::Blocked;
        sched.blocked_by = BlockedOn::Page(page);
        self.unlink_from_parent();
        scheduler::BLOCKED.push_back(self.clone());
        Ok(())
    }

    /// Unblocks the task if it is blocked waiting for the page
    /// at `page`. Returns whether it was.
    ///
    pub fn atomic_try_unblock_by_page(self: &Arc<Self>, page: usize) -> bool {
        let mut sched = lock!(self.sched);
        if sched.status != TaskStatus::Blocked || sched.blocked_by != BlockedOn::Page(page) {
            return false;
        }

        sched.blocked_by = BlockedOn::Nothing;
        self.unblock_locked(&mut sched);
        true
    }

    /// Unblocks the task if it is blocked waiting for the given
    /// port. Returns whether it was.
    ///
    pub fn atomic_unblock_if_blocked_on(self: &Arc<Self>, port: PortId) -> bool {
        let mut sched = lock!(self.sched);
        if sched.status != TaskStatus::Blocked || sched.blocked_by != BlockedOn::Port(port) {
            return false;
        }

        sched.blocked_by = BlockedOn::Nothing;
        self.unblock_locked(&mut sched);
        true
    }

    /// Unblocks the task if it is blocked waiting for a named
    /// port to appear. Returns whether it was.
    ///
    pub fn atomic_unblock_if_waiting_for_name(self: &Arc<Self>) -> bool {
        let mut sched = lock!(self.sched);
        if sched.status != TaskStatus::Blocked || sched.blocked_by != BlockedOn::PortName {
            return false;
        }

        sched.blocked_by = BlockedOn::Nothing;
        self.unblock_locked(&mut sched);
        true
    }

    // Takes the task off the blocked queue and hands it to the
    // scheduler, preempting the local CPU if the task beats the
    // running priority, or signalling the task's CPU if it is
    // bound elsewhere. Requires the sched_lock.
    fn unblock_locked(self: &Arc<Self>, sched: &mut SchedState) {
        self.unlink_from_parent();
        scheduler::place_woken(self, sched);
    }

    /// Pauses the task, taking it off the scheduler until
    /// [`resume`](Task::resume).
    ///
    /// Pausing the task currently running on another CPU sets
    /// the pending-pause flag and interrupts that CPU; the pause
    /// lands at its next switch point. The caller pausing
    /// *itself* must follow up with
    /// [`scheduler::find_new_process`].
    ///
    pub fn pause(self: &Arc<Self>) -> Result<(), Error> {
        let mut sched = lock!(self.sched);
        match sched.status {
            TaskStatus::Paused => Ok(()),
            TaskStatus::Ready => {
                sched.status = TaskStatus::Paused;
                self.unlink_from_parent();
                scheduler::PAUSED.push_back(self.clone());
                Ok(())
            }
            TaskStatus::Running => {
                let cpu = cpu::current();
                if cpu.current_task().id() == self.id {
                    // Pausing self: park and let the caller
                    // switch away.
                    sched.status = TaskStatus::Paused;
                    scheduler::PAUSED.push_back(self.clone());
                } else {
                    sched.pending_pause = true;
                    if let Some(other) = cpu::find_running(self.id) {
                        crate::send_reschedule_ipi(other);
                    }
                }
                Ok(())
            }
            TaskStatus::Uninit | TaskStatus::Blocked => Err(Error::Busy),
            TaskStatus::Dying | TaskStatus::Dead | TaskStatus::Idle => Err(Error::NoSuchTask),
        }
    }

    /// Makes a paused task runnable again. Also cancels a
    /// pending pause that has not landed yet.
    ///
    pub fn resume(self: &Arc<Self>) -> Result<(), Error> {
        let mut sched = lock!(self.sched);
        if sched.pending_pause {
            sched.pending_pause = false;
            return Ok(());
        }

        if sched.status != TaskStatus::Paused {
            return Err(Error::Busy);
        }

        self.unlink_from_parent();
        scheduler::push_ready_locked(self, &mut sched);
        Ok(())
    }

    /// Binds the task to a CPU (`Some(id)`) or to no CPU in
    /// particular (`None`).
    ///
    /// A queued task is moved to the right queue. A task
    /// changing its *own* affinity to another CPU must follow up
    /// with [`scheduler::find_new_process`]; this method parks
    /// it on the remote queue and interrupts the remote CPU if
    /// it is running something less urgent.
    ///
    pub fn set_affinity(self: &Arc<Self>, affinity: Option<usize>) -> Result<(), Error> {
        let affinity = match affinity {
            None => 0,
            Some(id) if id < cpu::count() => id + 1,
            Some(_) => return Err(Error::InvalidArgument),
        };

        let mut sched = lock!(self.sched);
        sched.affinity = affinity;

        match sched.status {
            TaskStatus::Ready => {
                // Requeue under the new affinity.
                self.unlink_from_parent();
                scheduler::push_ready_locked(self, &mut sched);
                Ok(())
            }
            TaskStatus::Running => {
                let cpu = cpu::current();
                if cpu.current_task().id() == self.id
                    && affinity != 0
                    && affinity != cpu.id() + 1
                {
                    // Moving self to another CPU: park there and
                    // poke it; the caller switches away.
                    sched.status = TaskStatus::Ready;
                    scheduler::push_ready_locked(self, &mut sched);
                    let remote = affinity - 1;
                    if cpu::get(remote).current_priority() > sched.priority {
                        crate::send_reschedule_ipi(remote);
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Marks the task Dead and removes it from the task index.
    /// The caller (the reaper) then releases the task's ports,
    /// groups and address space.
    ///
    pub fn mark_dead(&self) {
        lock!(self.sched).status = TaskStatus::Dead;
        lock!(TASKS).remove(&self.id);
    }

    // Unlinks the task from whatever queue it is in. Requires
    // the sched_lock.
    fn unlink_from_parent(&self) {
        let parent = self.link.parent();
        if !parent.is_null() {
            let queue = unsafe { &*parent };
            let held = queue.remove(self);
            drop(held);
        }
    }
}
