// Copyright 2026 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Physical addresses, frames, and frame ranges.

use align::{align_down, is_aligned, PAGE_SIZE};
use core::fmt;
use core::iter::Iterator;
use core::ops::{Add, Sub};

// Physical addresses are at most 52 bits wide.
const PHYS_ADDR_MASK: usize = 0x000f_ffff_ffff_ffff;

/// An invalid physical address.
///
/// The contained value is the address that was rejected.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InvalidPhysAddr(pub usize);

/// An address in the 52-bit physical address space.
///
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl PhysAddr {
    /// Returns the given physical address.
    ///
    /// # Panics
    ///
    /// `new` panics if `addr` exceeds the 52-bit physical
    /// address space.
    ///
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            addr & !PHYS_ADDR_MASK == 0,
            "physical address exceeds 52 bits"
        );
        PhysAddr(addr)
    }

    /// Returns the given physical address, or an error if it
    /// exceeds the 52-bit physical address space.
    ///
    #[inline]
    pub const fn try_new(addr: usize) -> Result<Self, InvalidPhysAddr> {
        if addr & !PHYS_ADDR_MASK == 0 {
            Ok(PhysAddr(addr))
        } else {
            Err(InvalidPhysAddr(addr))
        }
    }

    /// Returns the zero physical address.
    ///
    #[inline]
    pub const fn zero() -> Self {
        PhysAddr(0)
    }

    /// Returns the address as an unsigned integer.
    ///
    #[inline]
    pub const fn as_usize(&self) -> usize {
        self.0
    }

    /// Returns the address as a `u64`.
    ///
    #[inline]
    pub const fn as_u64(&self) -> u64 {
        self.0 as u64
    }

    /// Returns the physical page number of the frame holding
    /// this address.
    ///
    #[inline]
    pub const fn page_number(&self) -> usize {
        self.0 / PAGE_SIZE
    }

    /// Returns the offset of this address within its frame.
    ///
    #[inline]
    pub const fn frame_offset(&self) -> usize {
        self.0 % PAGE_SIZE
    }

    /// Returns the sum of the address and `offset`, or `None`
    /// if the result is not a valid physical address.
    ///
    #[inline]
    pub fn checked_add(&self, offset: usize) -> Option<Self> {
        let addr = self.0.checked_add(offset)?;
        PhysAddr::try_new(addr).ok()
    }
}

impl Add<usize> for PhysAddr {
    type Output = PhysAddr;

    fn add(self, offset: usize) -> PhysAddr {
        PhysAddr::new(self.0 + offset)
    }
}

impl Sub<PhysAddr> for PhysAddr {
    type Output = usize;

    fn sub(self, other: PhysAddr) -> usize {
        self.0 - other.0
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

impl fmt::Pointer for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A 4 KiB frame of physical memory.
///
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysFrame(PhysAddr);

impl PhysFrame {
    /// Returns the frame starting at the given address.
    ///
    /// Returns the address as an error if it is not
    /// frame-aligned.
    ///
    #[inline]
    pub fn from_start_address(addr: PhysAddr) -> Result<Self, InvalidPhysAddr> {
        if is_aligned(addr.as_usize(), PAGE_SIZE) {
            Ok(PhysFrame(addr))
        } else {
            Err(InvalidPhysAddr(addr.as_usize()))
        }
    }

    /// Returns the frame containing the given address.
    ///
    #[inline]
    pub fn containing_address(addr: PhysAddr) -> Self {
        PhysFrame(PhysAddr::new(align_down(addr.as_usize(), PAGE_SIZE)))
    }

    /// Returns the frame with the given physical page number.
    ///
    #[inline]
    pub const fn from_page_number(ppn: usize) -> Self {
        PhysFrame(PhysAddr::new(ppn * PAGE_SIZE))
    }

    /// Returns the address of the frame's first byte.
    ///
    #[inline]
    pub const fn start_address(&self) -> PhysAddr {
        self.0
    }

    /// Returns the frame's physical page number.
    ///
    #[inline]
    pub const fn page_number(&self) -> usize {
        self.0.as_usize() / PAGE_SIZE
    }

    /// Returns the frame's size in bytes.
    ///
    #[inline]
    pub const fn size(&self) -> usize {
        PAGE_SIZE
    }

    /// Returns the sequence of frames from `start` up to,
    /// but not including, `end`.
    ///
    pub fn range(start: PhysFrame, end: PhysFrame) -> PhysFrameRange {
        PhysFrameRange { start, end }
    }
}

impl fmt::Debug for PhysFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PhysFrame({:#x})", self.0.as_usize())
    }
}

/// A contiguous sequence of physical memory frames.
///
/// The range is exclusive: it covers `start` and every frame up
/// to, but not including, `end`.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhysFrameRange {
    /// The first frame in the range.
    pub start: PhysFrame,

    /// The frame one past the last frame in the range.
    pub end: PhysFrame,
}

impl PhysFrameRange {
    /// Returns the number of frames in the range.
    ///
    pub fn num_frames(&self) -> usize {
        self.end.page_number() - self.start.page_number()
    }
}

impl Iterator for PhysFrameRange {
    type Item = PhysFrame;

    fn next(&mut self) -> Option<PhysFrame> {
        if self.start < self.end {
            let frame = self.start;
            self.start = PhysFrame::from_page_number(frame.page_number() + 1);
            Some(frame)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses() {
        let addr = PhysAddr::new(0x5042);
        assert_eq!(addr.as_usize(), 0x5042);
        assert_eq!(addr.page_number(), 5);
        assert_eq!(addr.frame_offset(), 0x42);
        assert_eq!(addr + 0x10, PhysAddr::new(0x5052));
        assert_eq!(addr - PhysAddr::new(0x5000), 0x42);

        assert!(PhysAddr::try_new(0x000f_ffff_ffff_ffff).is_ok());
        assert_eq!(
            PhysAddr::try_new(0x0010_0000_0000_0000),
            Err(InvalidPhysAddr(0x0010_0000_0000_0000))
        );
    }

    #[test]
    fn frames() {
        assert!(PhysFrame::from_start_address(PhysAddr::new(0x1001)).is_err());
        let frame = PhysFrame::from_start_address(PhysAddr::new(0x3000)).unwrap();
        assert_eq!(frame.page_number(), 3);
        assert_eq!(
            PhysFrame::containing_address(PhysAddr::new(0x3fff)),
            frame
        );
        assert_eq!(PhysFrame::from_page_number(3), frame);
    }

    #[test]
    fn frame_ranges() {
        let start = PhysFrame::from_page_number(2);
        let end = PhysFrame::from_page_number(5);
        let range = PhysFrame::range(start, end);
        assert_eq!(range.num_frames(), 3);

        let pages: alloc::vec::Vec<usize> = range.map(|frame| frame.page_number()).collect();
        assert_eq!(pages, [2, 3, 4]);
    }
}
