// Copyright 2026 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Copies between kernel and user memory.
//!
//! User pointers are never dereferenced directly: every page of a
//! user buffer is resolved through the task's address space, faulting
//! it in through the region layer if need be. When a page cannot be
//! produced immediately (a pager fetch is in flight), the copy
//! helpers mark the in-flight syscall for restart, block the task on
//! the page, and report [`Suspended`](CopyOutcome::Suspended); the
//! syscall re-runs from the top once the page arrives.

use abi::Error;
use addrspace::{Access, AddressSpace, FaultOutcome};
use alloc::sync::Arc;
use alloc::vec::Vec;
use memory::{phys_to_virt_addr, VirtAddr, PAGE_SIZE};
use multitasking::{scheduler, Task};
use spin::lock;

/// The largest single user copy a syscall accepts.
///
pub const MAX_COPY: usize = 1 << 20; // 1 MiB.

/// How a user copy ended.
///
#[derive(Debug, PartialEq, Eq)]
pub enum CopyOutcome<T> {
    /// The copy completed.
    Done(T),

    /// A page was missing; the task is blocked and the syscall
    /// marked for restart. The handler must give up without
    /// touching its result registers.
    Suspended,
}

// Makes the page at `va` present and accessible for `access`,
// blocking the task when the page is still in flight. Returns
// the page's physical mapping, or None when suspended.
fn resolve_page(
    task: &Arc<Task>,
    space: &Arc<AddressSpace>,
    va: VirtAddr,
    access: Access,
) -> Result<Option<VirtAddr>, Error> {
    let outcome = {
        let mut frames = lock!(physmem::ALLOCATOR);
        space.handle_fault(va, access, task.id(), &mut *frames)?
    };

    match outcome {
        FaultOutcome::Mapped => {
            let phys = space.phys_addr_of(va).map_err(|_| Error::PageNotAllocated)?;
            Ok(Some(phys_to_virt_addr(phys)))
        }
        FaultOutcome::Wait { pager } => {
            if let Some(request) = pager {
                let message = abi::KernelRequestPage {
                    mem_object_id: request.object,
                    page_offset: request.offset,
                };
                let _ = multitasking::port::send_kernel_message(request.port, &message.encode());
            }

            task.with_regs(|regs| regs.request_restart());
            scheduler::block_current_on_page(va.align_down_page().as_usize());
            Ok(None)
        }
    }
}

fn walk_user_range<F>(
    task: &Arc<Task>,
    addr: u64,
    len: usize,
    access: Access,
    mut visit: F,
) -> Result<CopyOutcome<()>, Error>
where
    F: FnMut(VirtAddr, usize, usize),
{
    if len == 0 {
        return Ok(CopyOutcome::Done(()));
    }

    if len > MAX_COPY {
        return Err(Error::OutOfRange);
    }

    let space = task.address_space().ok_or(Error::PageNotAllocated)?;
    let start = VirtAddr::try_new(addr as usize).map_err(|_| Error::InvalidArgument)?;
    start
        .checked_add(len - 1)
        .ok_or(Error::InvalidArgument)?;

    let mut done = 0;
    while done < len {
        let va = start + done;
        let take = core::cmp::min(PAGE_SIZE - va.page_offset(), len - done);
        match resolve_page(task, &space, va, access)? {
            Some(mapped) => visit(mapped, done, take),
            None => return Ok(CopyOutcome::Suspended),
        }

        done += take;
    }

    Ok(CopyOutcome::Done(()))
}

/// Copies `len` bytes from the task's memory at `addr`.
///
pub fn copy_from_user(
    task: &Arc<Task>,
    addr: u64,
    len: usize,
) -> Result<CopyOutcome<Vec<u8>>, Error> {
    let mut bytes = alloc::vec![0u8; len];
    let outcome = walk_user_range(task, addr, len, Access::READ, |mapped, done, take| {
        let source = unsafe { core::slice::from_raw_parts(mapped.as_ptr(), take) };
        bytes[done..done + take].copy_from_slice(source);
    })?;

    Ok(match outcome {
        CopyOutcome::Done(()) => CopyOutcome::Done(bytes),
        CopyOutcome::Suspended => CopyOutcome::Suspended,
    })
}

/// Copies `bytes` into the task's memory at `addr`.
///
pub fn copy_to_user(
    task: &Arc<Task>,
    addr: u64,
    bytes: &[u8],
) -> Result<CopyOutcome<()>, Error> {
    walk_user_range(task, addr, bytes.len(), Access::WRITE, |mapped, done, take| {
        unsafe {
            core::ptr::copy_nonoverlapping(bytes[done..].as_ptr(), mapped.as_mut_ptr(), take)
        };
    })
}
