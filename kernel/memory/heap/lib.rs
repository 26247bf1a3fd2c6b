// Copyright 2026 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The kernel heap.
//!
//! [`KernelHeap`] is a linked-list heap behind a spinlock,
//! implementing [`GlobalAlloc`]. The kernel itself is a set of
//! library crates, so the `#[global_allocator]` declaration lives in
//! the arch entry crate; it declares a static `KernelHeap` and calls
//! [`init`] during boot, which carves the heap's virtual range out of
//! the kernel vmem arena, maps it, and hands it to the allocator.

#![no_std]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;
use linked_list_allocator::Heap;
use memory::{FrameAllocator, FrameDeallocator, PageTableFlags, VirtAddr, PAGE_SIZE};
use paging::{map_anonymous_range, ArchPageTable, MapError};
use spin::{lock, Mutex};
use virtmem::AllocPolicy;

/// The default size of the kernel heap, in pages.
///
pub const DEFAULT_HEAP_PAGES: usize = 2048; // 8 MiB.

/// A first-fit heap allocator behind a spinlock.
///
pub struct KernelHeap {
    heap: Mutex<Heap>,
}

impl KernelHeap {
    /// Returns an empty heap. Allocation fails until
    /// [`init`] has provided memory.
    ///
    pub const fn empty() -> Self {
        KernelHeap {
            heap: Mutex::new(Heap::empty()),
        }
    }

    /// Hands the byte range `start..start + size` to the heap.
    ///
    /// # Safety
    ///
    /// The range must be mapped, writable, unused, and owned by
    /// the heap from now on.
    ///
    pub unsafe fn provide(&self, start: VirtAddr, size: usize) {
        lock!(self.heap).init(start.as_usize(), size);
    }

    /// Returns the number of free bytes in the heap.
    ///
    pub fn free_bytes(&self) -> usize {
        lock!(self.heap).free()
    }
}

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        lock!(self.heap)
            .allocate_first_fit(layout)
            .map_or(ptr::null_mut(), |allocation| allocation.as_ptr())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(allocation) = ptr::NonNull::new(ptr) {
            lock!(self.heap).deallocate(allocation, layout);
        }
    }
}

/// Maps a heap of `npages` pages and hands it to `heap`.
///
/// The virtual range comes from the kernel vmem arena and the
/// backing frames from `frames`; the mapping is installed in
/// `table`, which must be the kernel's page table.
///
pub unsafe fn init<M>(
    heap: &KernelHeap,
    table: &mut dyn ArchPageTable,
    npages: usize,
    frames: &mut M,
) -> Result<(), MapError>
where
    M: FrameAllocator + FrameDeallocator,
{
    let start = virtmem::allocate(npages, AllocPolicy::InstantFit).ok_or(MapError::OutOfMemory)?;

    let flags = PageTableFlags::PRESENT
        | PageTableFlags::WRITABLE
        | PageTableFlags::GLOBAL
        | PageTableFlags::NO_EXECUTE;
    if let Err(err) = map_anonymous_range(table, start, npages, flags, frames) {
        virtmem::free(start, npages);
        return Err(err);
    }

    heap.provide(start, npages * PAGE_SIZE);
    Ok(())
}
