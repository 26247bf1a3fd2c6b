// Copyright 2026 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The bitmap frame allocator, which tracks every usable frame of
//! physical memory.

use crate::boot_info::BootstrapFrameAllocator;
use alloc::vec::Vec;
use bitmap_index::BitmapIndex;
use bootinfo::MemoryMap;
use memory::{FrameAllocator, FrameDeallocator, PhysAddr, PhysFrame, PhysFrameRange, PAGE_SIZE};
use pretty::Bytes;
use serial::println;

/// A single contiguous chunk of physical memory, tracked by a
/// bitmap. A set bit means the frame is free.
///
struct BitmapPool {
    // Address of the first frame. Frame-aligned.
    start_address: PhysAddr,

    // The number of 4 KiB frames in this pool.
    num_frames: usize,

    // The number of unallocated frames. There is no guarantee
    // that they are consecutive.
    free_frames: usize,

    // One bit per frame; set while the frame is free. The
    // bitmap's internal hint keeps allocation near the lowest
    // free frame.
    bitmap: BitmapIndex,
}

impl BitmapPool {
    fn new(start: PhysAddr, num_frames: usize) -> Self {
        BitmapPool {
            start_address: start,
            num_frames,
            free_frames: num_frames,
            bitmap: BitmapIndex::new_set(num_frames),
        }
    }

    fn frame_at(&self, index: usize) -> PhysFrame {
        PhysFrame::from_start_address(self.start_address + index * PAGE_SIZE)
            .expect("pool start is frame-aligned")
    }

    fn index_for(&self, frame: PhysFrame) -> Option<usize> {
        let addr = frame.start_address();
        if addr < self.start_address {
            return None;
        }

        let index = (addr - self.start_address) / PAGE_SIZE;
        if index < self.num_frames {
            Some(index)
        } else {
            None
        }
    }

    fn contains_frame(&self, frame: PhysFrame) -> bool {
        self.index_for(frame).is_some()
    }

    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        if self.free_frames == 0 {
            return None;
        }

        let index = self.bitmap.first_set()?;
        self.bitmap.unset(index);
        self.free_frames -= 1;
        Some(self.frame_at(index))
    }

    fn allocate_n_frames(&mut self, n: usize) -> Option<PhysFrameRange> {
        if n == 0 || self.free_frames < n {
            return None;
        }

        let index = self.bitmap.first_n_set(n)?;
        for i in 0..n {
            self.bitmap.unset(index + i);
        }

        self.free_frames -= n;
        Some(PhysFrame::range(
            self.frame_at(index),
            self.frame_at(index + n),
        ))
    }

    fn mark_frame_allocated(&mut self, frame: PhysFrame) {
        match self.index_for(frame) {
            None => panic!(
                "cannot mark frame at {:p}: frame not tracked",
                frame.start_address()
            ),
            Some(index) => {
                if !self.bitmap.get(index) {
                    panic!(
                        "cannot mark frame at {:p}: frame already marked allocated",
                        frame.start_address()
                    );
                }

                self.bitmap.unset(index);
                self.free_frames -= 1;
            }
        }
    }

    fn deallocate_frame(&mut self, frame: PhysFrame) {
        match self.index_for(frame) {
            None => panic!(
                "cannot deallocate frame at {:p}: frame not tracked",
                frame.start_address()
            ),
            Some(index) => {
                if self.bitmap.get(index) {
                    panic!(
                        "cannot deallocate frame at {:p}: frame already free",
                        frame.start_address()
                    );
                }

                self.bitmap.set(index);
                self.free_frames += 1;
            }
        }
    }
}

/// The second-phase physical memory allocator.
///
/// `BitmapFrameAllocator` takes over from the
/// [`BootstrapFrameAllocator`] once the kernel's heap has been
/// initialised.
///
pub struct BitmapFrameAllocator {
    // The number of 4 KiB frames tracked.
    num_frames: usize,

    // The number of frames not currently allocated.
    free_frames: usize,

    // The bitmap data for each run of contiguous usable frames.
    pools: Vec<BitmapPool>,
}

impl BitmapFrameAllocator {
    /// Returns an empty allocator, which can allocate no memory.
    ///
    pub fn empty() -> Self {
        BitmapFrameAllocator {
            num_frames: 0,
            free_frames: 0,
            pools: Vec::new(),
        }
    }

    /// Creates an allocator tracking every usable region of the
    /// given memory map, with all frames free.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that the memory map is accurate
    /// and that every frame it marks usable is unused.
    ///
    pub unsafe fn new(memory_map: MemoryMap) -> Self {
        let pools: Vec<BitmapPool> = memory_map
            .usable()
            .filter(|region| region.length as usize >= PAGE_SIZE)
            .map(|region| {
                BitmapPool::new(
                    PhysAddr::new(region.start as usize),
                    region.length as usize / PAGE_SIZE,
                )
            })
            .collect();

        let num_frames = pools.iter().map(|pool| pool.num_frames).sum();

        BitmapFrameAllocator {
            num_frames,
            free_frames: num_frames,
            pools,
        }
    }

    /// Returns the number of frames tracked by the allocator.
    ///
    pub fn num_frames(&self) -> usize {
        self.num_frames
    }

    /// Returns the number of frames currently free.
    ///
    pub fn free_frames(&self) -> usize {
        self.free_frames
    }

    /// Returns `n` sequential free frames, or `None`.
    ///
    pub fn allocate_n_frames(&mut self, n: usize) -> Option<PhysFrameRange> {
        for pool in self.pools.iter_mut() {
            if let Some(range) = pool.allocate_n_frames(n) {
                self.free_frames -= n;
                return Some(range);
            }
        }

        None
    }

    /// Marks the given frame as already allocated.
    ///
    fn mark_frame_allocated(&mut self, frame: PhysFrame) {
        for pool in self.pools.iter_mut() {
            if pool.contains_frame(frame) {
                pool.mark_frame_allocated(frame);
                self.free_frames -= 1;
                return;
            }
        }

        panic!(
            "cannot mark frame at {:p}: frame not tracked",
            frame.start_address()
        );
    }

    /// Takes ownership of the given [`BootstrapFrameAllocator`],
    /// marking the frames it has already handed out as allocated
    /// so they can later be freed normally.
    ///
    /// # Safety
    ///
    /// The bootstrap allocator must describe the same memory map
    /// this allocator was built from.
    ///
    pub unsafe fn repossess(&mut self, bootstrap: BootstrapFrameAllocator) {
        for frame in bootstrap.used_frames() {
            self.mark_frame_allocated(frame);
        }
    }

    /// Prints debug information about the allocator's state.
    ///
    pub fn debug(&self) {
        println!(
            "Physical memory manager: {}/{} frames available.",
            self.free_frames, self.num_frames
        );
        for pool in self.pools.iter() {
            println!(
                "{:p}: {} frames, {} free ({} of {})",
                pool.start_address,
                pool.num_frames,
                pool.free_frames,
                Bytes::from_usize(pool.free_frames * PAGE_SIZE),
                Bytes::from_usize(pool.num_frames * PAGE_SIZE),
            );
        }
    }
}

unsafe impl FrameAllocator for BitmapFrameAllocator {
    /// Returns the next available physical frame, or `None`.
    ///
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        for pool in self.pools.iter_mut() {
            if let Some(frame) = pool.allocate_frame() {
                self.free_frames -= 1;
                return Some(frame);
            }
        }

        None
    }
}

impl FrameDeallocator for BitmapFrameAllocator {
    /// Marks the given physical memory frame as unused and
    /// returns it to the free pool.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `frame` is unused.
    ///
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame) {
        for pool in self.pools.iter_mut() {
            if pool.contains_frame(frame) {
                pool.deallocate_frame(frame);
                self.free_frames += 1;
                return;
            }
        }

        panic!(
            "cannot deallocate frame at {:p}: frame not tracked",
            frame.start_address()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bootinfo::{MemoryRegion, MemoryRegionKind};

    const REGIONS: [MemoryRegion; 5] = [
        MemoryRegion {
            start: 0x0000,
            length: 0x1000,
            kind: MemoryRegionKind::Reserved,
        },
        MemoryRegion {
            start: 0x1000,
            length: 0x3000,
            kind: MemoryRegionKind::Reserved,
        },
        MemoryRegion {
            start: 0x4000,
            length: 0x4000,
            kind: MemoryRegionKind::Usable,
        },
        MemoryRegion {
            start: 0x8000,
            length: 0x4000,
            kind: MemoryRegionKind::Reserved,
        },
        MemoryRegion {
            start: 0xc000,
            length: 0x2000,
            kind: MemoryRegionKind::Usable,
        },
    ];

    fn frame_for(addr: usize) -> PhysFrame {
        PhysFrame::from_start_address(PhysAddr::new(addr)).unwrap()
    }

    #[test]
    fn bitmap_frame_allocator() {
        let mut alloc = unsafe { BitmapFrameAllocator::new(MemoryMap::new(&REGIONS)) };
        assert_eq!(alloc.num_frames(), 6);
        assert_eq!(alloc.free_frames(), 6);

        // Allocations walk the lowest pool first.
        assert_eq!(alloc.allocate_frame(), Some(frame_for(0x4000)));
        assert_eq!(alloc.allocate_frame(), Some(frame_for(0x5000)));
        assert_eq!(alloc.free_frames(), 4);

        // A freed frame is the next to be returned.
        unsafe { alloc.deallocate_frame(frame_for(0x4000)) };
        assert_eq!(alloc.free_frames(), 5);
        assert_eq!(alloc.allocate_frame(), Some(frame_for(0x4000)));

        // Drain the rest.
        assert_eq!(alloc.allocate_frame(), Some(frame_for(0x6000)));
        assert_eq!(alloc.allocate_frame(), Some(frame_for(0x7000)));
        assert_eq!(alloc.allocate_frame(), Some(frame_for(0xc000)));
        assert_eq!(alloc.allocate_frame(), Some(frame_for(0xd000)));
        assert_eq!(alloc.allocate_frame(), None);
        assert_eq!(alloc.free_frames(), 0);
    }

    #[test]
    fn contiguous_allocation() {
        let mut alloc = unsafe { BitmapFrameAllocator::new(MemoryMap::new(&REGIONS)) };

        // Allocate everything, then free two non-adjacent frames.
        while alloc.allocate_frame().is_some() {}
        unsafe { alloc.deallocate_frame(frame_for(0x5000)) };
        unsafe { alloc.deallocate_frame(frame_for(0x7000)) };
        assert_eq!(alloc.allocate_n_frames(2), None);

        // Free the frame between them and try again.
        unsafe { alloc.deallocate_frame(frame_for(0x6000)) };
        let range = alloc.allocate_n_frames(2).unwrap();
        assert_eq!(range.start, frame_for(0x5000));
        assert_eq!(range.end, frame_for(0x7000));
        assert_eq!(range.num_frames(), 2);

        // Runs never span pools.
        unsafe { alloc.deallocate_frame(frame_for(0x7000)) };
        unsafe { alloc.deallocate_frame(frame_for(0xc000)) };
        assert_eq!(alloc.allocate_n_frames(2), None);
    }

    #[test]
    fn repossession() {
        let map = MemoryMap::new(&REGIONS);
        let mut bootstrap = unsafe { BootstrapFrameAllocator::new(map) };
        assert_eq!(bootstrap.allocate_frame(), Some(frame_for(0x4000)));
        assert_eq!(bootstrap.allocate_frame(), Some(frame_for(0x5000)));

        let mut alloc = unsafe { BitmapFrameAllocator::new(map) };
        unsafe { alloc.repossess(bootstrap) };
        assert_eq!(alloc.free_frames(), 4);

        // The repossessed frames can be freed normally.
        unsafe { alloc.deallocate_frame(frame_for(0x4000)) };
        assert_eq!(alloc.free_frames(), 5);
        assert_eq!(alloc.allocate_frame(), Some(frame_for(0x4000)));
    }
}
