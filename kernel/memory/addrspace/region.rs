// Copyright 2026 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Regions: typed virtual address ranges with a fault-resolution
//! policy.

use crate::RegionId;
use abi::Error;
use alloc::string::String;
use alloc::sync::Arc;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU64, Ordering};
use memobj::{MemoryObject, PageRequest};
use memory::{
    phys_to_virt_addr, FrameAllocator, PageTableFlags, PhysAddr, PhysFrame, VirtAddr, PAGE_SIZE,
};
use paging::{ArchPageTable, MapError, PageSource};

bitflags! {
    /// The access rights of a region.
    ///
    pub struct Access: u8 {
        const READ = 0x01;
        const WRITE = 0x02;
        const EXECUTE = 0x04;
    }
}

impl Access {
    /// Returns an access mask from the conventional RWX bits.
    ///
    pub fn from_bits_masked(bits: u8) -> Access {
        Access::from_bits_truncate(bits)
    }
}

fn next_region_id() -> RegionId {
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// How a region resolves a page fault.
///
#[derive(Clone)]
pub enum RegionKind {
    /// Private memory: a fresh frame filled with `pattern` on
    /// first touch.
    Anonymous {
        /// The byte the page is filled with. Zero for ordinary
        /// memory.
        pattern: u8,
    },

    /// A window onto physical memory: address arithmetic, no
    /// allocation, the frames are never owned.
    PhysMapped {
        /// The physical address the region's start maps to.
        phys_start: PhysAddr,
    },

    /// A window onto a memory object.
    ObjectBacked {
        /// The referenced object.
        object: Arc<MemoryObject>,

        /// Offset into the object where the window starts.
        /// Page-aligned.
        object_offset: u64,

        /// Offset into the region where the window starts.
        /// Page-aligned.
        window_offset: usize,

        /// Length of the window in bytes.
        window_size: u64,

        /// Copy-on-touch: pages are copied out of the object
        /// on first access (and the edges beyond the window
        /// zero-filled) rather than shared.
        cow: bool,
    },
}

/// What a region's fault resolution concluded.
///
pub(crate) enum FaultResult {
    /// The page is mapped now.
    Mapped,

    /// The page must come from the object's pager first; the
    /// request is already marked in the object.
    AskPager {
        port: u64,
        object: u64,
        offset: u64,
    },

    /// A pager request for this page is already in flight.
    WaitForPager,
}

/// A virtual address range with a fault-resolution policy.
///
pub struct Region {
    id: RegionId,
    start: VirtAddr,
    size: usize,
    name: String,
    access: Access,
    kind: RegionKind,
}

impl Region {
    pub(crate) fn new(
        start: VirtAddr,
        size: usize,
        name: String,
        access: Access,
        kind: RegionKind,
    ) -> Region {
        Region {
            id: next_region_id(),
            start,
            size,
            name,
            access,
            kind,
        }
    }

    /// Returns the region's unique id.
    ///
    pub fn id(&self) -> RegionId {
        self.id
    }

    /// Returns the region's first address.
    ///
    pub fn start(&self) -> VirtAddr {
        self.start
    }

    /// Returns the region's size in bytes.
    ///
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the address one past the region's end.
    ///
    pub fn end(&self) -> usize {
        self.start.as_usize() + self.size
    }

    /// Returns the region's name.
    ///
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the region's access rights.
    ///
    pub fn access(&self) -> Access {
        self.access
    }

    /// Returns the region's kind.
    ///
    pub fn kind(&self) -> &RegionKind {
        &self.kind
    }

    /// Returns whether the region contains the given address.
    ///
    pub fn contains(&self, addr: VirtAddr) -> bool {
        self.start <= addr && addr.as_usize() < self.end()
    }

    /// Returns whether the region allows the given access.
    ///
    pub fn allows(&self, access: Access) -> bool {
        self.access.contains(access)
    }

    // Derives the leaf flag bits from the access mask.
    pub(crate) fn page_flags(&self) -> PageTableFlags {
        let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
        if self.access.contains(Access::WRITE) {
            flags |= PageTableFlags::WRITABLE;
        }
        if !self.access.contains(Access::EXECUTE) {
            flags |= PageTableFlags::NO_EXECUTE;
        }

        flags
    }

    pub(crate) fn set_size(&mut self, size: usize) {
        self.size = size;
    }

    pub(crate) fn relocate(&mut self, start: VirtAddr, access: Access) {
        self.start = start;
        self.access = access;
    }

    /// Resolves a fault at the page containing `va_page`,
    /// installing a mapping in `table` when the page is
    /// available.
    ///
    pub(crate) fn fault_in<M>(
        &self,
        table: &mut dyn ArchPageTable,
        va_page: VirtAddr,
        frames: &mut M,
    ) -> Result<FaultResult, Error>
    where
        M: FrameAllocator + memory::FrameDeallocator,
    {
        debug_assert!(va_page.page_offset() == 0);
        debug_assert!(self.contains(va_page));

        match &self.kind {
            RegionKind::Anonymous { pattern } => {
                let frame = frames.allocate_frame().ok_or(Error::OutOfMemory)?;
                fill_frame(frame, *pattern);
                self.install(table, va_page, PageSource::Owned(frame), frames)
                    .map_err(|err| {
                        unsafe { frames.deallocate_frame(frame) };
                        err
                    })?;
                Ok(FaultResult::Mapped)
            }
            RegionKind::PhysMapped { phys_start } => {
                let frame = PhysFrame::containing_address(
                    *phys_start + (va_page - self.start),
                );
                self.install(table, va_page, PageSource::Shared(frame), frames)?;
                Ok(FaultResult::Mapped)
            }
            RegionKind::ObjectBacked {
                object,
                object_offset,
                window_offset,
                window_size,
                cow,
            } => {
                let page_offset = va_page - self.start;

                if *cow {
                    // Pages wholly outside the window are plain
                    // zero pages.
                    if page_offset + PAGE_SIZE <= *window_offset
                        || page_offset as u64 >= *window_offset as u64 + *window_size
                    {
                        let frame = frames.allocate_frame().ok_or(Error::OutOfMemory)?;
                        fill_frame(frame, 0);
                        self.install(table, va_page, PageSource::Owned(frame), frames)
                            .map_err(|err| {
                                unsafe { frames.deallocate_frame(frame) };
                                err
                            })?;
                        return Ok(FaultResult::Mapped);
                    }
                }

                // The window alignment invariant makes each
                // region page correspond to one object page.
                let source_offset = *object_offset + (page_offset - *window_offset) as u64;
                match object.request_page(source_offset, frames)? {
                    PageRequest::Pending => Ok(FaultResult::WaitForPager),
                    PageRequest::NeedsPager { port, offset } => Ok(FaultResult::AskPager {
                        port,
                        object: object.id(),
                        offset,
                    }),
                    PageRequest::Mapped(source) => {
                        if *cow {
                            // Copy out of the object, zeroing
                            // whatever lies beyond the window.
                            let frame =
                                frames.allocate_frame().ok_or(Error::OutOfMemory)?;
                            let copied = copy_window_page(
                                frame,
                                source,
                                (page_offset - *window_offset) as u64,
                                *window_size,
                            );
                            debug_assert!(copied > 0);
                            self.install(table, va_page, PageSource::Owned(frame), frames)
                                .map_err(|err| {
                                    unsafe { frames.deallocate_frame(frame) };
                                    err
                                })?;
                        } else {
                            self.install(
                                table,
                                va_page,
                                PageSource::Shared(source),
                                frames,
                            )?;
                        }

                        Ok(FaultResult::Mapped)
                    }
                }
            }
        }
    }

    fn install<M>(
        &self,
        table: &mut dyn ArchPageTable,
        va_page: VirtAddr,
        source: PageSource,
        frames: &mut M,
    ) -> Result<(), Error>
    where
        M: FrameAllocator,
    {
        match table.map(source, va_page, self.page_flags(), frames) {
            Ok(()) => Ok(()),
            // A racing fault mapped the page first; fine.
            Err(MapError::AlreadyMapped) => Ok(()),
            Err(MapError::HugePage) => Err(Error::HugePage),
            Err(MapError::OutOfMemory) => Err(Error::OutOfMemory),
        }
    }
}

pub(crate) fn fill_frame(frame: PhysFrame, pattern: u8) {
    let virt = phys_to_virt_addr(frame.start_address());
    unsafe { core::ptr::write_bytes(virt.as_mut_ptr(), pattern, PAGE_SIZE) };
}

pub(crate) fn copy_frame(dst: PhysFrame, src: PhysFrame) {
    let dst_virt = phys_to_virt_addr(dst.start_address());
    let src_virt = phys_to_virt_addr(src.start_address());
    unsafe {
        core::ptr::copy_nonoverlapping(src_virt.as_ptr(), dst_virt.as_mut_ptr(), PAGE_SIZE)
    };
}

// Copies one page out of an object window into `dst`, zeroing
// the part of the page past the window's end. `window_pos` is
// the page's byte position within the window. Returns the
// number of bytes copied.
fn copy_window_page(dst: PhysFrame, src: PhysFrame, window_pos: u64, window_size: u64) -> usize {
    let valid = core::cmp::min((window_size - window_pos) as usize, PAGE_SIZE);
    let dst_virt = phys_to_virt_addr(dst.start_address());
    let src_virt = phys_to_virt_addr(src.start_address());
    unsafe {
        core::ptr::copy_nonoverlapping(src_virt.as_ptr(), dst_virt.as_mut_ptr(), valid);
        core::ptr::write_bytes(dst_virt.as_mut_ptr().add(valid), 0, PAGE_SIZE - valid);
    }

    valid
}
