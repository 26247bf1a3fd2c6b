// Copyright 2026 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Physical memory management and allocation.
//!
//! This crate consists of two physical memory allocators:
//!
//! 1. [`BootstrapFrameAllocator`], which carves frames sequentially out
//!    of the boot memory map and cannot free.
//! 2. [`BitmapFrameAllocator`], which takes over once the kernel heap
//!    exists and tracks every usable frame in per-region bitmaps.
//!
//! The bootstrap allocator (constructed with [`bootstrap`]) exists to
//! break the circularity between the heap and the frame allocator: the
//! bitmaps live on the heap, and the heap needs frames. Once the heap
//! is up, [`init`] builds the bitmap allocator from the same memory
//! map, repossesses the frames the bootstrap allocator handed out, and
//! installs the result as the global [`ALLOCATOR`](struct@ALLOCATOR).
//!
//! The [`allocate_frame`], [`allocate_n_frames`] and
//! [`deallocate_frame`] helpers wrap the global allocator's lock.

#![no_std]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

extern crate alloc;

mod bitmap;
mod boot_info;

pub use crate::bitmap::BitmapFrameAllocator;
pub use crate::boot_info::BootstrapFrameAllocator;
use bootinfo::MemoryMap;
use lazy_static::lazy_static;
use memory::{FrameAllocator, FrameDeallocator, PhysFrame, PhysFrameRange};
use spin::{lock, Mutex};

lazy_static! {
    /// The second-phase physical memory allocator.
    ///
    /// `ALLOCATOR` is empty until [`init`] installs the bitmap
    /// allocator. Allocation before that point returns `None`.
    ///
    pub static ref ALLOCATOR: Mutex<BitmapFrameAllocator> =
        Mutex::new(BitmapFrameAllocator::empty());
}

/// Returns the bootstrap frame allocator used to set up the kernel
/// heap.
///
/// # Safety
///
/// The caller must guarantee that the memory map is accurate and
/// that every frame it marks usable is unused. `bootstrap` must be
/// called at most once, and not after [`init`].
///
pub unsafe fn bootstrap(memory_map: MemoryMap) -> BootstrapFrameAllocator {
    BootstrapFrameAllocator::new(memory_map)
}

/// Sets up the second-phase physical memory manager, taking over
/// from the bootstrap allocator.
///
/// # Safety
///
/// The `bootstrap` allocator passed to `init` must have sole
/// control over all physical memory it describes.
///
pub unsafe fn init(bootstrap: BootstrapFrameAllocator) {
    let mut allocator = BitmapFrameAllocator::new(bootstrap.memory_map());
    allocator.repossess(bootstrap);

    *lock!(ALLOCATOR) = allocator;
}

/// Returns the next available physical frame, or `None`.
///
pub fn allocate_frame() -> Option<PhysFrame> {
    lock!(ALLOCATOR).allocate_frame()
}

/// Returns `n` sequential physical frames, or `None`.
///
/// The frames must come from a single contiguous run inside one
/// bitmap pool, so this can fail even when `n` frames are free.
///
pub fn allocate_n_frames(n: usize) -> Option<PhysFrameRange> {
    lock!(ALLOCATOR).allocate_n_frames(n)
}

/// Marks the given physical memory frame as unused and returns it
/// to the free pool.
///
/// # Safety
///
/// The caller must ensure that `frame` is unused.
///
pub unsafe fn deallocate_frame(frame: PhysFrame) {
    lock!(ALLOCATOR).deallocate_frame(frame);
}

/// Prints debug information about the physical memory manager.
///
pub fn debug() {
    lock!(ALLOCATOR).debug();
}
