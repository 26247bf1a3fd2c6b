// Copyright 2026 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Test support for the memory subsystems.
//!
//! [`HeapFrameAllocator`] hands out genuine 4 KiB-aligned frames
//! carved from the host heap, with the physical address equal to the
//! frame's pointer. Under the default zero direct-map offset,
//! [`phys_to_virt_addr`](crate::phys_to_virt_addr) is then the
//! identity and page-table walks dereference real memory, so the
//! paging code can be exercised unmodified by host unit tests.

use crate::{FrameAllocator, FrameDeallocator, PhysAddr, PhysFrame};
use align::PAGE_SIZE;
use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::collections::BTreeSet;

/// A frame allocator backed by the host heap.
///
pub struct HeapFrameAllocator {
    live: BTreeSet<usize>,
    total_allocated: usize,
}

impl HeapFrameAllocator {
    /// Returns an empty allocator.
    ///
    pub fn new() -> Self {
        HeapFrameAllocator {
            live: BTreeSet::new(),
            total_allocated: 0,
        }
    }

    /// Returns the number of frames currently allocated.
    ///
    pub fn live_frames(&self) -> usize {
        self.live.len()
    }

    /// Returns the number of frames handed out over the
    /// allocator's lifetime.
    ///
    pub fn total_allocated(&self) -> usize {
        self.total_allocated
    }

    fn layout() -> Layout {
        // A frame-aligned frame-sized allocation.
        Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).expect("bad frame layout")
    }
}

impl Default for HeapFrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl FrameAllocator for HeapFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        let ptr = unsafe { alloc_zeroed(Self::layout()) };
        if ptr.is_null() {
            return None;
        }

        self.live.insert(ptr as usize);
        self.total_allocated += 1;
        Some(PhysFrame::from_start_address(PhysAddr::new(ptr as usize)).expect("unaligned frame"))
    }
}

impl FrameDeallocator for HeapFrameAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame) {
        let addr = frame.start_address().as_usize();
        assert!(
            self.live.remove(&addr),
            "deallocating a frame that was not allocated: {:#x}",
            addr
        );
        dealloc(addr as *mut u8, Self::layout());
    }
}

impl Drop for HeapFrameAllocator {
    fn drop(&mut self) {
        // Return any frames the test leaked to the host heap.
        for addr in core::mem::take(&mut self.live) {
            unsafe { dealloc(addr as *mut u8, Self::layout()) };
        }
    }
}
