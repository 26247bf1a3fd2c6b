// Copyright 2026 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The syscall dispatch table and handlers.
//!
//! The exception shim saves the trapping task's registers into its
//! [`RegisterFile`](multitasking::RegisterFile) and calls
//! [`dispatch`]. The syscall number sits in the low half of the
//! number register, per-call flag bits in the high half; up to six
//! arguments arrive in the argument registers. Results go back as a
//! success value plus a zero-or-negative-errno error register.
//!
//! A handler that needs a user page that is not resident does not
//! fail: the copy helpers mark the syscall for restart and block the
//! task, and the whole handler re-runs, with its original arguments,
//! when the page arrives. Handlers are therefore written to be
//! harmless to re-run up to their first irreversible step.

use crate::usercopy::{copy_from_user, copy_to_user, CopyOutcome};
use crate::{reap_dead_tasks, wake_page_waiter};
use abi::{Error, Syscall, SYSCALL_COUNT};
use addrspace::{transfer_region, Access, AddressSpace, RegionKind};
use alloc::string::String;
use alloc::sync::Arc;
use loader::STACK_PAGES;
use memobj::MemoryObject;
use memory::{PhysAddr, VirtAddr, PAGE_SIZE};
use multitasking::group::TaskGroup;
use multitasking::port::{self, Port, RightKind, SendFailure};
use multitasking::{cpu, scheduler, timers, Task, TaskStatus};
use spin::lock;

/// What a handler produced.
///
enum Outcome {
    /// Write this success value back.
    Value(u64),

    /// The task blocked with the restart flag set, or the
    /// handler wrote the registers itself; leave them alone.
    Handled,
}

type Handler = fn(&Arc<Task>) -> Result<Outcome, Error>;

static SYSCALL_TABLE: [Option<Handler>; SYSCALL_COUNT] = build_table();

const fn build_table() -> [Option<Handler>; SYSCALL_COUNT] {
    let mut table: [Option<Handler>; SYSCALL_COUNT] = [None; SYSCALL_COUNT];
    table[Syscall::Exit as usize] = Some(sys_exit);
    table[Syscall::GetTaskId as usize] = Some(sys_get_task_id);
    table[Syscall::CreateProcess as usize] = Some(sys_create_process);
    table[Syscall::StartProcess as usize] = Some(sys_start_process);
    table[Syscall::InitStack as usize] = Some(sys_init_stack);
    table[Syscall::SetPriority as usize] = Some(sys_set_priority);
    table[Syscall::SetTaskName as usize] = Some(sys_set_task_name);
    table[Syscall::GetMessageInfo as usize] = Some(sys_get_message_info);
    table[Syscall::GetFirstMessage as usize] = Some(sys_get_first_message);
    table[Syscall::SendMessageRight as usize] = Some(sys_send_message_right);
    table[Syscall::AcceptRights as usize] = Some(sys_accept_rights);
    table[Syscall::CreatePort as usize] = Some(sys_create_port);
    table[Syscall::NamePort as usize] = Some(sys_name_port);
    table[Syscall::GetPortByName as usize] = Some(sys_get_port_by_name);
    table[Syscall::CreateRight as usize] = Some(sys_create_right);
    table[Syscall::SetNamespace as usize] = Some(sys_set_namespace);
    table[Syscall::SetLogPort as usize] = Some(sys_set_log_port);
    table[Syscall::SendMessagePort as usize] = Some(sys_send_message_port);
    table[Syscall::TransferRegion as usize] = Some(sys_transfer_region);
    table[Syscall::CreateNormalRegion as usize] = Some(sys_create_normal_region);
    table[Syscall::DeleteSendRight as usize] = Some(sys_delete_send_right);
    table[Syscall::CreatePhysMapRegion as usize] = Some(sys_create_phys_map_region);
    table[Syscall::DeleteRegion as usize] = Some(sys_delete_region);
    table[Syscall::CreateMemObject as usize] = Some(sys_create_mem_object);
    table[Syscall::CreateTaskGroup as usize] = Some(sys_create_task_group);
    table[Syscall::AddTaskToGroup as usize] = Some(sys_add_task_to_group);
    table[Syscall::RemoveTaskFromGroup as usize] = Some(sys_remove_task_from_group);
    table[Syscall::TaskInGroup as usize] = Some(sys_task_in_group);
    table[Syscall::SetNotifyMask as usize] = Some(sys_set_notify_mask);
    table[Syscall::LoadExecutable as usize] = Some(sys_load_executable);
    table[Syscall::RequestTimer as usize] = Some(sys_request_timer);
    table[Syscall::SetAffinity as usize] = Some(sys_set_affinity);
    table[Syscall::Yield as usize] = Some(sys_yield);
    table[Syscall::MapMemObject as usize] = Some(sys_map_mem_object);
    table[Syscall::GetTime as usize] = Some(sys_get_time);
    table[Syscall::KillTask as usize] = Some(sys_kill_task);
    table[Syscall::PauseTask as usize] = Some(sys_pause_task);
    table[Syscall::ResumeTask as usize] = Some(sys_resume_task);
    table[Syscall::GetPageAddress as usize] = Some(sys_get_page_address);
    table[Syscall::ReleaseMemObject as usize] = Some(sys_release_mem_object);
    table[Syscall::GetPageAddressFromObject as usize] = Some(sys_get_page_address_from_object);
    table
}

/// Dispatches the syscall recorded in the current task's
/// register file. Called by the exception shim on every
/// syscall trap.
///
pub fn dispatch() {
    let task = cpu::current().current_task();
    let number = task.with_regs(|regs| {
        regs.clear_restart();
        regs.syscall_number & 0xffff_ffff
    });

    let handler = SYSCALL_TABLE
        .get(number as usize)
        .copied()
        .flatten();

    let result = match handler {
        Some(handler) => handler(&task),
        None => Err(Error::NotSupported),
    };

    match result {
        Ok(Outcome::Value(value)) => task.with_regs(|regs| {
            regs.ret_value = value;
            regs.ret_error = 0;
        }),
        Ok(Outcome::Handled) => {}
        Err(err) => task.with_regs(|regs| {
            regs.ret_value = 0;
            regs.ret_error = err.to_errno();
        }),
    }

    reap_dead_tasks();
}

fn arg(task: &Arc<Task>, index: usize) -> u64 {
    task.with_regs(|regs| regs.arg(index))
}

fn flags(task: &Arc<Task>) -> u32 {
    task.with_regs(|regs| (regs.syscall_number >> 32) as u32)
}

// Resolves a task argument, with zero meaning the caller.
fn resolve_task(current: &Arc<Task>, id: u64) -> Result<Arc<Task>, Error> {
    if id == abi::TASK_ID_SELF {
        Ok(current.clone())
    } else {
        Task::get(id).ok_or(Error::NoSuchTask)
    }
}

fn space_of(task: &Arc<Task>) -> Result<Arc<AddressSpace>, Error> {
    task.address_space().ok_or(Error::PageNotAllocated)
}

fn access_from_flags(bits: u32) -> Access {
    Access::from_bits_masked(bits as u8 & 0x7)
}

fn sys_exit(task: &Arc<Task>) -> Result<Outcome, Error> {
    task.set_exit_code(arg(task, 0), arg(task, 1));
    task.atomic_kill();
    scheduler::find_new_process();
    Ok(Outcome::Value(0))
}

fn sys_get_task_id(task: &Arc<Task>) -> Result<Outcome, Error> {
    Ok(Outcome::Value(task.id()))
}

fn sys_create_process(_task: &Arc<Task>) -> Result<Outcome, Error> {
    let new = Task::create(String::new());
    Ok(Outcome::Value(new.id()))
}

fn sys_start_process(task: &Arc<Task>) -> Result<Outcome, Error> {
    let target = resolve_task(task, arg(task, 0))?;
    target.start(arg(task, 1) as usize, arg(task, 2), arg(task, 3))?;
    Ok(Outcome::Value(0))
}

// The stack sits at the top of userspace, like the loader
// places it.
const STACK_TOP: usize = 0x7fff_ffff_f000;

fn sys_init_stack(task: &Arc<Task>) -> Result<Outcome, Error> {
    let target = resolve_task(task, arg(task, 0))?;
    let space = space_of(&target)?;

    let size = STACK_PAGES * PAGE_SIZE;
    let (_, start) = space.create_region(
        Some(VirtAddr::new(STACK_TOP - size)),
        size,
        String::from("stack"),
        Access::READ | Access::WRITE,
        RegionKind::Anonymous { pattern: 0 },
    )?;

    let stack_top = start.as_usize() + size;
    target.with_regs(|regs| regs.stack_pointer = stack_top);
    Ok(Outcome::Value(stack_top as u64))
}

fn sys_set_priority(task: &Arc<Task>) -> Result<Outcome, Error> {
    let target = resolve_task(task, arg(task, 0))?;
    target.set_priority(arg(task, 1) as usize)?;
    Ok(Outcome::Value(0))
}

fn sys_set_task_name(task: &Arc<Task>) -> Result<Outcome, Error> {
    let target = resolve_task(task, arg(task, 0))?;
    let name = match copy_from_user(task, arg(task, 1), arg(task, 2) as usize)? {
        CopyOutcome::Done(bytes) => bytes,
        CopyOutcome::Suspended => return Ok(Outcome::Handled),
    };

    target.set_name(String::from_utf8_lossy(&name).into_owned());
    Ok(Outcome::Value(0))
}

fn sys_get_message_info(task: &Arc<Task>) -> Result<Outcome, Error> {
    let port = Port::get(arg(task, 0)).ok_or(Error::NoSuchObject)?;

    let descriptor = match port.peek_info(task.id()) {
        Ok(descriptor) => descriptor,
        Err(Error::NoMessages) => {
            if flags(task) & abi::FLAG_NOBLOCK != 0 {
                return Err(Error::WouldBlock);
            }

            // Sleep until a message arrives, then re-run.
            task.with_regs(|regs| regs.request_restart());
            scheduler::block_current_on_port(port.id());
            return Ok(Outcome::Handled);
        }
        Err(err) => return Err(err),
    };

    match copy_to_user(task, arg(task, 1), &descriptor.encode())? {
        CopyOutcome::Done(()) => Ok(Outcome::Value(0)),
        CopyOutcome::Suspended => Ok(Outcome::Handled),
    }
}

fn sys_get_first_message(task: &Arc<Task>) -> Result<Outcome, Error> {
    let port = Port::get(arg(task, 0)).ok_or(Error::NoSuchObject)?;
    let payload = port.peek_payload(task.id())?;

    match copy_to_user(task, arg(task, 1), &payload)? {
        CopyOutcome::Done(()) => {}
        CopyOutcome::Suspended => return Ok(Outcome::Handled),
    }

    let call_flags = flags(task);
    if call_flags & abi::MSG_ARG_NOPOP != 0 {
        return Ok(Outcome::Value(0));
    }

    let reject = call_flags & abi::MSG_ARG_REJECT_RIGHT != 0;
    let (_message, adopted) = port::finish_receive(&port, task, reject)?;
    Ok(Outcome::Value(adopted))
}

fn sys_send_message_right(task: &Arc<Task>) -> Result<Outcome, Error> {
    let right_id = arg(task, 0);
    let reply_port = match arg(task, 1) {
        0 => None,
        id => Some(id),
    };

    let payload = match copy_from_user(task, arg(task, 2), arg(task, 3) as usize)? {
        CopyOutcome::Done(bytes) => bytes,
        CopyOutcome::Suspended => return Ok(Outcome::Handled),
    };

    let mut aux = [0u64; 4];
    if arg(task, 4) != 0 {
        let bytes = match copy_from_user(task, arg(task, 4), 32)? {
            CopyOutcome::Done(bytes) => bytes,
            CopyOutcome::Suspended => return Ok(Outcome::Handled),
        };
        for (slot, chunk) in aux.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            *slot = u64::from_le_bytes(word);
        }
    }

    let call_flags = flags(task);
    let result = port::send_message_right(
        task,
        right_id,
        reply_port,
        payload,
        aux,
        call_flags & abi::REPLY_CREATE_SEND_MANY != 0,
        call_flags & abi::SEND_MESSAGE_DELETE_RIGHT != 0,
    );

    match result {
        Ok(()) => Ok(Outcome::Value(0)),
        Err(SendFailure::Plain(err)) => Err(err),
        Err(SendFailure::AuxRight(index)) => {
            // The failing argument's index rides in the value
            // register next to the error.
            task.with_regs(|regs| {
                regs.ret_value = index as u64;
                regs.ret_error = Error::NoSuchObject.to_errno();
            });
            Ok(Outcome::Handled)
        }
    }
}

fn sys_accept_rights(task: &Arc<Task>) -> Result<Outcome, Error> {
    let port = Port::get(arg(task, 0)).ok_or(Error::NoSuchObject)?;
    let ids = port::accept_rights(&port, task)?;

    let mut bytes = [0u8; 32];
    for (chunk, id) in bytes.chunks_exact_mut(8).zip(ids.iter()) {
        chunk.copy_from_slice(&id.to_le_bytes());
    }

    match copy_to_user(task, arg(task, 1), &bytes)? {
        CopyOutcome::Done(()) => Ok(Outcome::Value(0)),
        CopyOutcome::Suspended => Ok(Outcome::Handled),
    }
}

fn sys_create_port(task: &Arc<Task>) -> Result<Outcome, Error> {
    let owner = resolve_task(task, arg(task, 0))?;
    let port = Port::create(owner.id());
    Ok(Outcome::Value(port.id()))
}

fn sys_name_port(task: &Arc<Task>) -> Result<Outcome, Error> {
    let port = arg(task, 0);
    let name = match copy_from_user(task, arg(task, 1), arg(task, 2) as usize)? {
        CopyOutcome::Done(bytes) => bytes,
        CopyOutcome::Suspended => return Ok(Outcome::Handled),
    };

    port::name_port(&name, port)?;
    Ok(Outcome::Value(0))
}

fn sys_get_port_by_name(task: &Arc<Task>) -> Result<Outcome, Error> {
    let name = match copy_from_user(task, arg(task, 0), arg(task, 1) as usize)? {
        CopyOutcome::Done(bytes) => bytes,
        CopyOutcome::Suspended => return Ok(Outcome::Handled),
    };

    match port::get_port_by_name(&name) {
        Some(port) => Ok(Outcome::Value(port)),
        None => {
            if flags(task) & abi::FLAG_NOBLOCK != 0 {
                return Err(Error::WouldBlock);
            }

            // Sleep until some port is published under a name,
            // then look again.
            port::register_name_waiter(task.id());
            task.with_regs(|regs| regs.request_restart());
            scheduler::block_current_on_named_port();
            Ok(Outcome::Handled)
        }
    }
}

fn sys_create_right(task: &Arc<Task>) -> Result<Outcome, Error> {
    let port = Port::get(arg(task, 0)).ok_or(Error::NoSuchObject)?;
    let group = task
        .rights_namespace()
        .and_then(TaskGroup::get)
        .ok_or(Error::NoSuchObject)?;

    let kind = if flags(task) & abi::CREATE_RIGHT_SEND_ONCE != 0 {
        RightKind::SendOnce
    } else {
        RightKind::SendMany
    };

    let id = port::create_right(&port, task.id(), &group, kind)?;
    Ok(Outcome::Value(id))
}

fn sys_set_namespace(task: &Arc<Task>) -> Result<Outcome, Error> {
    if arg(task, 1) as u32 != abi::NAMESPACE_RIGHTS {
        return Err(Error::InvalidArgument);
    }

    let group = TaskGroup::get(arg(task, 0)).ok_or(Error::NoSuchObject)?;
    if !group.has_task(task.id()) {
        return Err(Error::NotPermitted);
    }

    let previous = task.set_rights_namespace(group.id());
    Ok(Outcome::Value(previous.unwrap_or(0)))
}

fn sys_set_log_port(task: &Arc<Task>) -> Result<Outcome, Error> {
    let port = arg(task, 0);
    if Port::get(port).is_none() {
        return Err(Error::NoSuchObject);
    }

    crate::set_log_port(port);
    Ok(Outcome::Value(0))
}

fn sys_send_message_port(task: &Arc<Task>) -> Result<Outcome, Error> {
    let payload = match copy_from_user(task, arg(task, 1), arg(task, 2) as usize)? {
        CopyOutcome::Done(bytes) => bytes,
        CopyOutcome::Suspended => return Ok(Outcome::Handled),
    };

    let reply_right = match arg(task, 3) {
        0 => None,
        id => Some(id),
    };

    port::send_message_port(task, arg(task, 0), payload, reply_right)?;
    Ok(Outcome::Value(0))
}

fn sys_transfer_region(task: &Arc<Task>) -> Result<Outcome, Error> {
    let destination = resolve_task(task, arg(task, 0))?;
    let source_space = space_of(task)?;
    let destination_space = space_of(&destination)?;

    let addr = VirtAddr::try_new(arg(task, 1) as usize).map_err(|_| Error::InvalidArgument)?;
    let placement = match arg(task, 2) {
        0 => None,
        hint => Some(VirtAddr::try_new(hint as usize).map_err(|_| Error::InvalidArgument)?),
    };

    let (new_start, woken) = {
        let mut frames = lock!(physmem::ALLOCATOR);
        transfer_region(
            &source_space,
            &destination_space,
            addr,
            placement,
            access_from_flags(flags(task)),
            &mut *frames,
        )?
    };

    for tid in woken {
        wake_page_waiter(tid);
    }

    Ok(Outcome::Value(new_start.as_usize() as u64))
}

fn sys_create_normal_region(task: &Arc<Task>) -> Result<Outcome, Error> {
    let target = resolve_task(task, arg(task, 0))?;
    let space = space_of(&target)?;

    let placement = match arg(task, 1) {
        0 => None,
        hint => Some(VirtAddr::try_new(hint as usize).map_err(|_| Error::InvalidArgument)?),
    };

    let (_, start) = space.create_region(
        placement,
        arg(task, 2) as usize,
        String::from("anonymous"),
        access_from_flags(flags(task)),
        RegionKind::Anonymous { pattern: 0 },
    )?;

    Ok(Outcome::Value(start.as_usize() as u64))
}

fn sys_delete_send_right(task: &Arc<Task>) -> Result<Outcome, Error> {
    port::delete_send_right(task, arg(task, 0))?;
    Ok(Outcome::Value(0))
}

fn sys_create_phys_map_region(task: &Arc<Task>) -> Result<Outcome, Error> {
    let target = resolve_task(task, arg(task, 0))?;
    let space = space_of(&target)?;

    let placement = match arg(task, 1) {
        0 => None,
        hint => Some(VirtAddr::try_new(hint as usize).map_err(|_| Error::InvalidArgument)?),
    };

    let phys =
        PhysAddr::try_new(arg(task, 3) as usize).map_err(|_| Error::InvalidArgument)?;
    let (_, start) = space.create_region(
        placement,
        arg(task, 2) as usize,
        String::from("phys-mapped"),
        access_from_flags(flags(task)),
        RegionKind::PhysMapped { phys_start: phys },
    )?;

    Ok(Outcome::Value(start.as_usize() as u64))
}

fn sys_delete_region(task: &Arc<Task>) -> Result<Outcome, Error> {
    let space = space_of(task)?;
    let addr = VirtAddr::try_new(arg(task, 0) as usize).map_err(|_| Error::InvalidArgument)?;

    let woken = {
        let mut frames = lock!(physmem::ALLOCATOR);
        space.delete_region(addr, &mut *frames)?
    };

    for tid in woken {
        wake_page_waiter(tid);
    }

    Ok(Outcome::Value(0))
}

fn sys_create_mem_object(task: &Arc<Task>) -> Result<Outcome, Error> {
    let size = arg(task, 0) as usize;
    if size == 0 {
        return Err(Error::InvalidArgument);
    }

    let object = MemoryObject::create(align::pages_for(size));
    Ok(Outcome::Value(object.id()))
}

fn sys_create_task_group(task: &Arc<Task>) -> Result<Outcome, Error> {
    let group = TaskGroup::create(task);
    Ok(Outcome::Value(group.id()))
}

fn sys_add_task_to_group(task: &Arc<Task>) -> Result<Outcome, Error> {
    let group = TaskGroup::get(arg(task, 0)).ok_or(Error::NoSuchObject)?;
    let target = resolve_task(task, arg(task, 1))?;
    group.add_task(&target)?;
    Ok(Outcome::Value(0))
}

fn sys_remove_task_from_group(task: &Arc<Task>) -> Result<Outcome, Error> {
    let group = TaskGroup::get(arg(task, 0)).ok_or(Error::NoSuchObject)?;
    group.remove_task(arg(task, 1))?;
    Ok(Outcome::Value(0))
}

fn sys_task_in_group(task: &Arc<Task>) -> Result<Outcome, Error> {
    let group = TaskGroup::get(arg(task, 0)).ok_or(Error::NoSuchObject)?;
    Ok(Outcome::Value(group.has_task(arg(task, 1)) as u64))
}

fn sys_set_notify_mask(task: &Arc<Task>) -> Result<Outcome, Error> {
    let group = TaskGroup::get(arg(task, 0)).ok_or(Error::NoSuchObject)?;
    let port = arg(task, 1);
    if Port::get(port).is_none() {
        return Err(Error::NoSuchObject);
    }

    let previous = group.set_notify_mask(port, arg(task, 2) as u32)?;
    Ok(Outcome::Value(previous as u64))
}

fn sys_load_executable(task: &Arc<Task>) -> Result<Outcome, Error> {
    let target = resolve_task(task, arg(task, 0))?;
    if target.status() != TaskStatus::Uninit {
        return Err(Error::ProcessInited);
    }

    let object = MemoryObject::get(arg(task, 1)).ok_or(Error::NoSuchObject)?;

    let space = match target.address_space() {
        Some(space) => space,
        None => {
            let space = crate::new_user_space()?;
            target.assign_address_space(space.clone())?;
            space
        }
    };

    let result = {
        let mut frames = lock!(physmem::ALLOCATOR);
        loader::load(&space, &object, &mut *frames)
    };

    let result = result.map_err(|err| match err {
        loader::Error::BadBinary(_) => Error::BadFormat,
        loader::Error::NotReady => Error::WouldBlock,
        loader::Error::Space(err) => err,
    })?;

    target.with_regs(|regs| {
        regs.program_counter = result.entry;
        regs.stack_pointer = result.stack_top;
        regs.args[0] = result.load_record as u64;
        regs.args[1] = result.load_record_size as u64;
    });

    Ok(Outcome::Value(0))
}

fn sys_request_timer(task: &Arc<Task>) -> Result<Outcome, Error> {
    let port = arg(task, 0);
    if Port::get(port).is_none() {
        return Err(Error::NoSuchObject);
    }

    Ok(Outcome::Value(timers::request_timer(port, arg(task, 1))))
}

fn sys_set_affinity(task: &Arc<Task>) -> Result<Outcome, Error> {
    let target = resolve_task(task, arg(task, 0))?;
    let affinity = arg(task, 1);
    let binding = match affinity {
        0 => None,
        cpu => Some(cpu as usize - 1),
    };

    let this_cpu = cpu::current();
    let moving_self = target.id() == task.id()
        && binding.map(|id| id != this_cpu.id()).unwrap_or(false);

    target.set_affinity(binding)?;

    if moving_self {
        // We just parked ourselves on the remote queue; give
        // this CPU to someone else.
        scheduler::find_new_process();
    }

    Ok(Outcome::Value(0))
}

fn sys_yield(_task: &Arc<Task>) -> Result<Outcome, Error> {
    scheduler::yield_current();
    Ok(Outcome::Value(0))
}

fn sys_map_mem_object(task: &Arc<Task>) -> Result<Outcome, Error> {
    let object = MemoryObject::get(arg(task, 0)).ok_or(Error::NoSuchObject)?;
    let space = space_of(task)?;

    let placement = match arg(task, 1) {
        0 => None,
        hint => Some(VirtAddr::try_new(hint as usize).map_err(|_| Error::InvalidArgument)?),
    };

    let size = arg(task, 2) as usize;
    let object_offset = arg(task, 3);
    let call_flags = flags(task);
    let cow = call_flags & 0x8 != 0;

    let window_size = if cow {
        core::cmp::min(
            size as u64,
            object.size_bytes().saturating_sub(object_offset),
        )
    } else {
        size as u64
    };

    let (_, start) = space.create_region(
        placement,
        size,
        String::from("object window"),
        access_from_flags(call_flags),
        RegionKind::ObjectBacked {
            object,
            object_offset,
            window_offset: 0,
            window_size,
            cow,
        },
    )?;

    Ok(Outcome::Value(start.as_usize() as u64))
}

fn sys_get_time(task: &Arc<Task>) -> Result<Outcome, Error> {
    match arg(task, 0) {
        0 => Ok(Outcome::Value(time::monotonic_nanos())),
        1 => Ok(Outcome::Value(time::wall_clock_nanos())),
        _ => Err(Error::InvalidArgument),
    }
}

fn sys_kill_task(task: &Arc<Task>) -> Result<Outcome, Error> {
    let target = resolve_task(task, arg(task, 0))?;
    let killing_self = target.id() == task.id();
    target.atomic_kill();

    if killing_self {
        scheduler::find_new_process();
    }

    Ok(Outcome::Value(0))
}

fn sys_pause_task(task: &Arc<Task>) -> Result<Outcome, Error> {
    let target = resolve_task(task, arg(task, 0))?;
    let pausing_self = target.id() == task.id();
    target.pause()?;

    if pausing_self {
        scheduler::find_new_process();
    }

    Ok(Outcome::Value(0))
}

fn sys_resume_task(task: &Arc<Task>) -> Result<Outcome, Error> {
    let target = resolve_task(task, arg(task, 0))?;
    target.resume()?;
    Ok(Outcome::Value(0))
}

fn sys_get_page_address(task: &Arc<Task>) -> Result<Outcome, Error> {
    let space = space_of(task)?;
    let addr = VirtAddr::try_new(arg(task, 0) as usize).map_err(|_| Error::InvalidArgument)?;
    let phys = space.phys_addr_of(addr)?;
    Ok(Outcome::Value(phys.as_u64()))
}

fn sys_release_mem_object(task: &Arc<Task>) -> Result<Outcome, Error> {
    let object = MemoryObject::get(arg(task, 0)).ok_or(Error::NoSuchObject)?;
    if !object.pinners().is_empty() {
        return Err(Error::Busy);
    }

    MemoryObject::unregister(object.id());
    let mut frames = lock!(physmem::ALLOCATOR);
    object.destroy(&mut *frames);
    Ok(Outcome::Value(0))
}

fn sys_get_page_address_from_object(task: &Arc<Task>) -> Result<Outcome, Error> {
    let object = MemoryObject::get(arg(task, 0)).ok_or(Error::NoSuchObject)?;
    let frame = object.page_address(arg(task, 1))?;
    Ok(Outcome::Value(frame.start_address().as_u64()))
}
