// Copyright 2026 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! kernel ties the Kestrel subsystems together.
//!
//! This crate owns the boot order, the syscall dispatch table, the
//! page-fault and timer entry points the exception shim calls into,
//! and the reaper that runs dying tasks' destructors. The kernel
//! proper is a set of library crates:
//!
//! - [memory](::memory), [physmem](::physmem), [virtmem](::virtmem),
//!   [tempmap](::tempmap), [paging](::paging), [memobj](::memobj),
//!   [addrspace](::addrspace), [heap](::heap)
//! - [multitasking](::multitasking), [loader](::loader),
//!   [time](::time)
//! - [serial](::serial), [spin](::spin), [abi](::abi),
//!   [bootinfo](::bootinfo)
//!
//! The (external) arch entry crate declares the global allocator,
//! sets up exception vectors, and calls [`init`] with the boot
//! info; afterwards every trap funnels into
//! [`syscalls::dispatch`], [`handle_page_fault`] or
//! [`timer_interrupt`].
//!
//! ## Boot order
//!
//! Subsystems are brought up leaves first, each depending only on
//! its predecessors: the direct map offset, then the arch hooks,
//! then the physical frame allocator's bootstrap stage, the kernel
//! vmem arena, the kernel heap, the full frame allocator, the
//! per-CPU temporary mappers, the kernel address space, the CPU
//! table, and finally the scheduler.

#![no_std]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

extern crate alloc;

pub mod arch;
pub mod syscalls;
pub mod usercopy;

use abi::Error;
use addrspace::{Access, AddressSpace, FaultOutcome};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bootinfo::BootInfo;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use heap::KernelHeap;
use lazy_static::lazy_static;
use memobj::MemoryObject;
use memory::constants::temp_map_window;
use memory::{FrameAllocator, PhysFrame, VirtAddr, PAGE_SIZE};
use multitasking::port::send_kernel_message;
use multitasking::{cpu, scheduler};
use paging::ArchPageTable;
use serial::println;
use spin::{lock, Mutex};
use tempmap::WindowMapper;

// The physical root of the kernel's page table, used as the
// template for new address spaces. Zero until boot.
static KERNEL_ROOT: AtomicUsize = AtomicUsize::new(0);

// The port receiving the kernel log, or zero.
static LOG_PORT: AtomicU64 = AtomicU64::new(0);

lazy_static! {
    // The kernel's own address space, wrapping the page table
    // the bootloader handed over.
    static ref KERNEL_SPACE: Mutex<Option<Arc<AddressSpace>>> = Mutex::new(None);

    // One scratch-window mapper per CPU, for the paths that run
    // before or without the full direct map.
    static ref TEMP_MAPPERS: Mutex<Vec<WindowMapper>> = Mutex::new(Vec::new());
}

/// Initialise the kernel and its subsystems.
///
/// Called exactly once, by the boot CPU, with interrupts still
/// disabled. `heap` is the arch entry crate's global allocator.
///
/// # Safety
///
/// The boot info must accurately describe the machine, and the
/// whole of physical memory must be mapped at the handoff's
/// direct-map offset.
///
pub unsafe fn init(boot_info: &BootInfo, heap: &KernelHeap, cpus: usize) {
    // The direct map first: everything below reaches physical
    // memory through it.
    memory::set_hhdm_offset(VirtAddr::new(boot_info.hhdm_offset as usize));

    // Arch hooks next, so locks mask interrupts and page tables
    // reach the TLB.
    arch::install_hooks();

    // Adopt the bootloader's page table as the kernel's own.
    let mut kernel_table = arch::adopt_boot_page_table();
    KERNEL_ROOT.store(
        kernel_table.root_frame().start_address().as_usize(),
        Ordering::SeqCst,
    );

    // Physical memory: the bootstrap allocator carries us until
    // the heap exists.
    let mut bootstrap = physmem::bootstrap(boot_info.memory_map);

    // The kernel virtual memory arena, and the heap carved out
    // of it.
    virtmem::init();
    heap::init(heap, &mut kernel_table, heap::DEFAULT_HEAP_PAGES, &mut bootstrap)
        .expect("kernel heap initialisation failed");

    // With the heap up, switch to the bitmap frame allocator.
    physmem::init(bootstrap);

    // The per-CPU temporary mapping windows: each CPU gets a
    // level-0 table of its own installed under its window.
    {
        let mut frames = lock!(physmem::ALLOCATOR);
        let mut mappers = lock!(TEMP_MAPPERS);
        for cpu_id in 0..cpus {
            let window = temp_map_window(cpu_id);
            let table = frames
                .allocate_frame()
                .expect("temp mapper table allocation failed");
            zero_frame(table);
            kernel_table
                .install_leaf_table(window.start(), table, &mut *frames)
                .expect("temp mapper window installation failed");
            mappers.push(arch::window_mapper(window.start(), table));
        }
    }

    // The kernel address space takes ownership of the adopted
    // table.
    let space = AddressSpace::new(Box::new(kernel_table));
    space.activate();
    *lock!(KERNEL_SPACE) = Some(space);

    // CPUs and the scheduler.
    cpu::init(cpus);
    cpu::set_current_cpu(0);
    serial::init();
    scheduler::start();

    println!("kernel initialised: {} CPUs.", cpus);
}

fn zero_frame(frame: PhysFrame) {
    let virt = memory::phys_to_virt_addr(frame.start_address());
    unsafe { core::ptr::write_bytes(virt.as_mut_ptr(), 0, PAGE_SIZE) };
}

/// Runs `f` with the executing CPU's temporary mapper.
///
/// # Panics
///
/// Panics if [`init`] has not built the mappers yet.
///
pub fn with_temp_mapper<R>(f: impl FnOnce(&mut WindowMapper) -> R) -> R {
    let cpu = cpu::current().id();
    let mut mappers = lock!(TEMP_MAPPERS);
    f(&mut mappers[cpu])
}

/// Creates a fresh user address space, its page table's kernel
/// half shared with the kernel's.
///
pub fn new_user_space() -> Result<Arc<AddressSpace>, Error> {
    let template = match KERNEL_ROOT.load(Ordering::Relaxed) {
        0 => None,
        addr => Some(
            PhysFrame::from_start_address(memory::PhysAddr::new(addr))
                .expect("kernel root is frame-aligned"),
        ),
    };

    let mut frames = lock!(physmem::ALLOCATOR);
    let table =
        arch::new_page_table(template, &mut *frames).map_err(|_| Error::OutOfMemory)?;
    Ok(AddressSpace::new(table))
}

/// The page-fault entry point.
///
/// Resolves the fault through the current task's address space.
/// `Ok` means the shim returns and retries the access (the task
/// may first have been switched away from, blocked on the
/// page); an error means the access was illegal and the shim
/// should kill the task.
///
pub fn handle_page_fault(addr: usize, write: bool, execute: bool) -> Result<(), Error> {
    let task = cpu::current().current_task();
    let space = task.address_space().ok_or(Error::PageNotAllocated)?;

    let access = if write {
        Access::WRITE
    } else if execute {
        Access::EXECUTE
    } else {
        Access::READ
    };

    let va = VirtAddr::try_new(addr).map_err(|_| Error::PageNotAllocated)?;
    let outcome = {
        let mut frames = lock!(physmem::ALLOCATOR);
        space.handle_fault(va, access, task.id(), &mut *frames)?
    };

    match outcome {
        FaultOutcome::Mapped => Ok(()),
        FaultOutcome::Wait { pager } => {
            if let Some(request) = pager {
                let message = abi::KernelRequestPage {
                    mem_object_id: request.object,
                    page_offset: request.offset,
                };
                let _ = send_kernel_message(request.port, &message.encode());
            }

            scheduler::block_current_on_page(va.align_down_page().as_usize());
            Ok(())
        }
    }
}

/// The timer interrupt entry point: advances the clock, runs
/// the periodic scheduler, and reaps any tasks that died.
///
pub fn timer_interrupt() {
    time::tick();
    scheduler::sched_periodic();
    reap_dead_tasks();
}

/// Delivers a page supplied by a pager to a memory object,
/// waking every task that was blocked on it.
///
/// This is the completion half of the pager protocol; the
/// request half is sent by [`handle_page_fault`].
///
pub fn supply_object_page(
    object: &Arc<MemoryObject>,
    offset: u64,
    frame: PhysFrame,
    owned: bool,
) -> Result<(), Error> {
    let pinners = object.supply_page(offset, frame, owned)?;
    for pinner in pinners {
        if let Some(space) = AddressSpace::get(pinner) {
            for tid in space.take_waiters_for_object_page(object.id(), offset) {
                wake_page_waiter(tid);
            }
        }
    }

    Ok(())
}

// Wakes a task that was blocked waiting for a page, whatever
// page that was.
pub(crate) fn wake_page_waiter(tid: multitasking::TaskId) {
    if let Some(task) = multitasking::Task::get(tid) {
        if let multitasking::BlockedOn::Page(page) = task.blocked_on() {
            task.atomic_try_unblock_by_page(page);
        }
    }
}

/// Runs the destructors of every task the scheduler has parked
/// on the reap queue: their ports are destroyed, their group
/// memberships dropped, and their address space torn down once
/// nothing else shares it.
///
pub fn reap_dead_tasks() {
    while let Some(task) = scheduler::take_dead_task() {
        task.mark_dead();

        for port in task.take_owned_ports() {
            multitasking::port::destroy_port(port);
        }

        for group in task.group_ids() {
            if let Some(group) = multitasking::group::TaskGroup::get(group) {
                let _ = group.remove_task(task.id());
            }
        }

        if let Some(space) = task.take_address_space() {
            // Threads share the space; only the last one tears
            // it down. The index holds one reference and we hold
            // another.
            if Arc::strong_count(&space) <= 2 {
                AddressSpace::unregister(space.id());
                let woken = {
                    let mut frames = lock!(physmem::ALLOCATOR);
                    space.tear_down(&mut *frames)
                };
                for tid in woken {
                    wake_page_waiter(tid);
                }
            }
        }

        println!("task {} ({}) reaped", task.id(), task.name());
    }
}

/// Sets the port that receives the kernel log, draining the
/// early-boot buffer to it.
///
pub fn set_log_port(port: u64) {
    LOG_PORT.store(port, Ordering::SeqCst);
    serial::drain_early_log(|chunk| {
        let _ = send_kernel_message(port, chunk);
    });
}
