// Copyright 2026 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The kernel virtual memory allocator.
//!
//! This crate manages the kernel's virtual address arena
//! ([`KERNEL_VMEM`](memory::constants::KERNEL_VMEM)) with boundary
//! tags, in the style of the vmem resource allocator. It feeds the
//! kernel heap, the temporary mapping windows, and every other
//! transient kernel mapping.
//!
//! Each segment of the arena is described by a [tag](allocator) that
//! sits in three structures at once:
//!
//! - the address-ordered segment list, used for coalescing on free;
//! - a per-size freelist, bucketed by the power of two of the segment
//!   size, with a bitmap of non-empty buckets for O(1) selection;
//! - while allocated, a hash table keyed by segment base, so `free`
//!   can find the tag without a search.
//!
//! Tags live in a fixed slab inside the allocator, so the allocator
//! never allocates memory itself and can run before the kernel heap
//! exists. Operations that might split segments first check that
//! enough spare tags remain and fail cleanly otherwise; callers
//! treat that as out-of-memory.

#![no_std]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

#[cfg(test)]
extern crate alloc;

mod allocator;

pub use crate::allocator::{AllocPolicy, VmemAllocator};

use lazy_static::lazy_static;
use memory::constants::KERNEL_VMEM;
use memory::{VirtAddr, PAGE_SIZE};
use spin::{lock, Mutex};

lazy_static! {
    /// The global kernel virtual memory allocator.
    ///
    /// Empty until [`init`] hands it the kernel arena.
    ///
    pub static ref ALLOCATOR: Mutex<VmemAllocator> = Mutex::new(VmemAllocator::new());
}

/// Hands the kernel virtual memory arena to the global allocator.
///
/// Called once at boot, after the physical frame allocator is up
/// and before the kernel heap is initialised.
///
pub fn init() {
    lock!(ALLOCATOR).add_arena(KERNEL_VMEM.start(), KERNEL_VMEM.size() / PAGE_SIZE);
}

/// Allocates `npages` pages of kernel virtual address space.
///
/// Returns `None` on arena exhaustion or tag shortage, which
/// callers treat as out-of-memory.
///
pub fn allocate(npages: usize, policy: AllocPolicy) -> Option<VirtAddr> {
    lock!(ALLOCATOR).allocate(npages, policy)
}

/// Allocates `npages` pages of kernel virtual address space whose
/// base is aligned to `1 << align_log2` bytes.
///
pub fn allocate_aligned(npages: usize, align_log2: u32) -> Option<VirtAddr> {
    lock!(ALLOCATOR).allocate_aligned(npages, align_log2)
}

/// Returns a previously allocated range to the arena.
///
/// # Panics
///
/// `free` panics if `addr` is not the base of a live allocation
/// of exactly `npages` pages. That is a kernel bug, not a
/// recoverable error.
///
pub fn free(addr: VirtAddr, npages: usize) {
    lock!(ALLOCATOR).free(addr, npages);
}
