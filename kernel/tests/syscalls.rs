// Copyright 2026 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Drives the syscall surface end to end: real frame allocator,
//! real page tables (under the host-identity direct map), real
//! dispatch through the register file.

use std::alloc::Layout;
use std::convert::TryInto;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use abi::{Syscall, FLAG_NOBLOCK, NAMESPACE_RIGHTS};
use bootinfo::{MemoryMap, MemoryRegion, MemoryRegionKind};
use kernel::syscalls::dispatch;
use kernel::usercopy::{copy_from_user, copy_to_user, CopyOutcome};
use multitasking::{cpu, scheduler, Task, TaskStatus};

// Hands an 8 MiB arena of host memory to the physical frame
// allocator, once. The identity direct map makes the frames
// directly addressable.
fn bootstrap_memory() {
    static DONE: AtomicBool = AtomicBool::new(false);
    if DONE.swap(true, Ordering::SeqCst) {
        return;
    }

    const ARENA: usize = 8 << 20;
    let layout = Layout::from_size_align(ARENA, 4096).unwrap();
    let arena = unsafe { std::alloc::alloc_zeroed(layout) };
    assert!(!arena.is_null());

    let regions = Box::leak(Box::new([MemoryRegion {
        start: arena as u64,
        length: ARENA as u64,
        kind: MemoryRegionKind::Usable,
    }]));

    unsafe {
        let bootstrap = physmem::bootstrap(MemoryMap::new(regions));
        physmem::init(bootstrap);
    }
}

// Runs one syscall on behalf of `task` and returns the
// (value, errno) registers.
fn syscall(task: &Arc<Task>, call: Syscall, flags: u32, args: &[u64]) -> (u64, i64) {
    task.with_regs(|regs| {
        regs.syscall_number = (call as u64) | ((flags as u64) << 32);
        regs.args = [0; 6];
        regs.args[..args.len()].copy_from_slice(args);
    });

    dispatch();

    task.with_regs(|regs| (regs.ret_value, regs.ret_error))
}

fn expect_ok(task: &Arc<Task>, call: Syscall, flags: u32, args: &[u64]) -> u64 {
    let (value, errno) = syscall(task, call, flags, args);
    assert_eq!(errno, 0, "{:?} failed with errno {}", call, errno);
    value
}

fn read_user(task: &Arc<Task>, addr: u64, len: usize) -> Vec<u8> {
    match copy_from_user(task, addr, len).unwrap() {
        CopyOutcome::Done(bytes) => bytes,
        CopyOutcome::Suspended => panic!("unexpected suspension reading user memory"),
    }
}

fn write_user(task: &Arc<Task>, addr: u64, bytes: &[u8]) {
    match copy_to_user(task, addr, bytes).unwrap() {
        CopyOutcome::Done(()) => {}
        CopyOutcome::Suspended => panic!("unexpected suspension writing user memory"),
    }
}

#[test]
fn syscall_surface() {
    bootstrap_memory();
    cpu::init(1);
    cpu::set_current_cpu(0);

    // Bring up an "init" task and make it current.
    let task = Task::create("init".to_string());
    task.start(0x40_0000, 0, 0).unwrap();
    scheduler::find_new_process();
    let current = cpu::current().current_task();
    assert_eq!(current.id(), task.id());

    // Unassigned syscall numbers report NotSupported.
    let (_, errno) = syscall(&task, Syscall::Yield, 0, &[]);
    assert_eq!(errno, 0);
    task.with_regs(|regs| {
        regs.syscall_number = 7;
        regs.args = [0; 6];
    });
    dispatch();
    assert_eq!(task.with_regs(|regs| regs.ret_error), -95);

    // Identity and time.
    assert_eq!(expect_ok(&task, Syscall::GetTaskId, 0, &[]), task.id());
    let monotonic = expect_ok(&task, Syscall::GetTime, 0, &[0]);
    time::tick();
    assert!(expect_ok(&task, Syscall::GetTime, 0, &[0]) > monotonic);

    // A rights namespace for the task.
    let group = expect_ok(&task, Syscall::CreateTaskGroup, 0, &[]);
    assert_eq!(
        expect_ok(&task, Syscall::SetNamespace, 0, &[group, NAMESPACE_RIGHTS as u64]),
        0
    );
    assert_eq!(expect_ok(&task, Syscall::TaskInGroup, 0, &[group, task.id()]), 1);

    // An address space with a scratch buffer region.
    let space = kernel::new_user_space().unwrap();
    task.assign_address_space(space).unwrap();
    let buffer = expect_ok(
        &task,
        Syscall::CreateNormalRegion,
        0x3, // read + write
        &[0, 0x1000_0000, 0x4000],
    );
    assert_eq!(buffer, 0x1000_0000);

    // IPC: a port, a right, a message through it.
    let port = expect_ok(&task, Syscall::CreatePort, 0, &[0]);
    let right = expect_ok(&task, Syscall::CreateRight, 0, &[port]);
    assert!(right >= 1);

    write_user(&task, buffer, b"hello");
    expect_ok(
        &task,
        Syscall::SendMessageRight,
        0,
        &[right, 0, buffer, 5, 0],
    );

    // Peek, then pop, through user memory.
    let desc_addr = buffer + 0x1000;
    expect_ok(
        &task,
        Syscall::GetMessageInfo,
        FLAG_NOBLOCK,
        &[port, desc_addr],
    );
    let descriptor = read_user(&task, desc_addr, 24);
    let size = u64::from_le_bytes(descriptor[16..24].try_into().unwrap());
    assert_eq!(size, 5);

    let recv_addr = buffer + 0x2000;
    let adopted = expect_ok(&task, Syscall::GetFirstMessage, 0, &[port, recv_addr]);
    assert_eq!(adopted, 0); // No reply right travelled.
    assert_eq!(read_user(&task, recv_addr, 5), b"hello");

    // An empty port reports no messages rather than blocking
    // the only task.
    let (_, errno) = syscall(&task, Syscall::GetMessageInfo, FLAG_NOBLOCK, &[port, desc_addr]);
    assert_eq!(errno, abi::Error::WouldBlock.to_errno());

    // Shared memory: map an object, write through it, and the
    // object's own page backs the mapping.
    let object = expect_ok(&task, Syscall::CreateMemObject, 0, &[0x4000]);
    let window = expect_ok(
        &task,
        Syscall::MapMemObject,
        0x3,
        &[object, 0x3000_0000, 0x4000, 0],
    );
    write_user(&task, window, b"xyz");
    let mapped = expect_ok(&task, Syscall::GetPageAddress, 0, &[window]);
    let slot = expect_ok(&task, Syscall::GetPageAddressFromObject, 0, &[object, 0]);
    assert_eq!(mapped, slot);

    // Releasing a pinned object is refused.
    let (_, errno) = syscall(&task, Syscall::ReleaseMemObject, 0, &[object]);
    assert_eq!(errno, abi::Error::Busy.to_errno());

    // A timer fires on the port once its deadline passes.
    let timer = expect_ok(&task, Syscall::RequestTimer, 0, &[port, 5]);
    for _ in 0..6 {
        kernel::timer_interrupt();
    }
    let reply_addr = buffer + 0x3000;
    expect_ok(&task, Syscall::GetFirstMessage, 0, &[port, reply_addr]);
    let reply = read_user(&task, reply_addr, 16);
    assert_eq!(&reply[..4], &abi::MSG_TYPE_TIMER_REPLY.to_le_bytes());
    assert_eq!(u64::from_le_bytes(reply[8..16].try_into().unwrap()), timer);

    // The pager protocol: a fault on a pager-backed object
    // sends the request, blocks the task, and supplying the
    // page wakes it again.
    let pager_port = expect_ok(&task, Syscall::CreatePort, 0, &[0]);
    let paged = memobj::MemoryObject::create(2);
    paged.set_pager(pager_port);
    let paged_window = expect_ok(
        &task,
        Syscall::MapMemObject,
        0x3,
        &[paged.id(), 0x5000_0000, 0x2000, 0],
    );

    kernel::handle_page_fault(paged_window as usize, false, false).unwrap();
    assert_eq!(task.status(), TaskStatus::Blocked);
    assert_eq!(
        cpu::current().current_task().id(),
        cpu::current().idle_task().id()
    );

    // The kernel asked the pager for page zero.
    let request = multitasking::port::Port::get(pager_port)
        .unwrap()
        .pop_message(task.id())
        .unwrap();
    assert_eq!(&request.payload[..4], &abi::MSG_TYPE_REQUEST_PAGE.to_le_bytes());
    assert_eq!(
        u64::from_le_bytes(request.payload[8..16].try_into().unwrap()),
        paged.id()
    );

    // The pager answers; the task preempts the idle task and
    // the retried fault resolves to the supplied frame.
    let frame = physmem::allocate_frame().unwrap();
    kernel::supply_object_page(&paged, 0, frame, true).unwrap();
    assert_eq!(cpu::current().current_task().id(), task.id());
    kernel::handle_page_fault(paged_window as usize, false, false).unwrap();
    assert_eq!(
        expect_ok(&task, Syscall::GetPageAddress, 0, &[paged_window]),
        frame.start_address().as_u64()
    );

    // Exit: the task dies, is reaped, and its port goes away
    // with it.
    let port_before_exit = port;
    syscall(&task, Syscall::Exit, 0, &[42, 0]);
    assert_eq!(task.status(), TaskStatus::Dead);
    assert_eq!(task.exit_code(), (42, 0));
    assert!(Task::get(task.id()).is_none());
    assert!(multitasking::port::Port::get(port_before_exit).is_none());
    assert_eq!(
        cpu::current().current_task().id(),
        cpu::current().idle_task().id()
    );
}

#[test]
fn created_tasks_wait_uninitialised() {
    bootstrap_memory();

    // A freshly created task is registered but not runnable
    // until started; this deliberately avoids touching the
    // scheduler queues shared with the main test.
    let child = Task::create("unstarted child".to_string());
    assert_eq!(child.status(), TaskStatus::Uninit);
    assert!(Task::get(child.id()).is_some());
    assert!(child.address_space().is_none());

    // Killing an unstarted task queues it for reaping.
    child.atomic_kill();
    assert_eq!(child.status(), TaskStatus::Dying);
}
