// Copyright 2026 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Virtual addresses, pages, and ranges.

use align::{align_down, align_up, is_aligned, PAGE_SIZE};
use core::fmt;
use core::iter::Iterator;
use core::ops::{Add, Sub};

/// An invalid virtual address.
///
/// The contained value is the address that was rejected.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InvalidVirtAddr(pub usize);

/// A canonical address in the 48-bit virtual address space.
///
/// Canonical addresses have bits 47 through 63 all equal: the
/// lower half runs up to `0x7fff_ffff_ffff` and the higher half
/// starts at `0xffff_8000_0000_0000`.
///
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    /// Returns the given virtual address.
    ///
    /// # Panics
    ///
    /// `new` panics if `addr` is not canonical.
    ///
    #[inline]
    pub const fn new(addr: usize) -> Self {
        match VirtAddr::try_new(addr) {
            Ok(virt) => virt,
            Err(_) => panic!("virtual address is not canonical"),
        }
    }

    /// Returns the given virtual address, or an error if it
    /// is not canonical.
    ///
    #[inline]
    pub const fn try_new(addr: usize) -> Result<Self, InvalidVirtAddr> {
        let top = addr >> 47;
        if top == 0 || top == 0x1ffff {
            Ok(VirtAddr(addr))
        } else {
            Err(InvalidVirtAddr(addr))
        }
    }

    /// Returns the zero virtual address.
    ///
    #[inline]
    pub const fn zero() -> Self {
        VirtAddr(0)
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

    /// Returns the address as a raw constant pointer.
    ///
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.0 as *const u8
    }

    /// Returns the address as a raw mutable pointer.
    ///
    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.0 as *mut u8
    }

    /// Returns the offset of this address within its page.
    ///
    #[inline]
    pub const fn page_offset(&self) -> usize {
        self.0 % PAGE_SIZE
    }

    /// Returns whether this address is in the kernel's half
    /// of the address space.
    ///
    #[inline]
    pub const fn is_kernel_half(&self) -> bool {
        self.0 >> 47 == 0x1ffff
    }

    /// Returns the sum of the address and `offset`, or `None`
    /// if the result is not canonical.
    ///
    #[inline]
    pub fn checked_add(&self, offset: usize) -> Option<Self> {
        let addr = self.0.checked_add(offset)?;
        VirtAddr::try_new(addr).ok()
    }

    /// Aligns the address downwards to a page boundary.
    ///
    #[inline]
    pub const fn align_down_page(&self) -> Self {
        VirtAddr(align_down(self.0, PAGE_SIZE))
    }

    /// Aligns the address upwards to a page boundary.
    ///
    /// # Panics
    ///
    /// `align_up_page` panics if the aligned address would
    /// not be canonical.
    ///
    #[inline]
    pub fn align_up_page(&self) -> Self {
        VirtAddr::new(align_up(self.0, PAGE_SIZE))
    }
}

impl Add<usize> for VirtAddr {
    type Output = VirtAddr;

    fn add(self, offset: usize) -> VirtAddr {
        VirtAddr::new(self.0 + offset)
    }
}

impl Sub<VirtAddr> for VirtAddr {
    type Output = usize;

    fn sub(self, other: VirtAddr) -> usize {
        self.0 - other.0
    }
}

impl Sub<usize> for VirtAddr {
    type Output = VirtAddr;

    fn sub(self, offset: usize) -> VirtAddr {
        VirtAddr::new(self.0 - offset)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl fmt::Pointer for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A 4 KiB page of virtual memory.
///
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtPage(VirtAddr);

impl VirtPage {
    /// Returns the page starting at the given address.
    ///
    /// Returns the address as an error if it is not
    /// page-aligned.
    ///
    #[inline]
    pub fn from_start_address(addr: VirtAddr) -> Result<Self, InvalidVirtAddr> {
        if is_aligned(addr.as_usize(), PAGE_SIZE) {
            Ok(VirtPage(addr))
        } else {
            Err(InvalidVirtAddr(addr.as_usize()))
        }
    }

    /// Returns the page containing the given address.
    ///
    #[inline]
    pub fn containing_address(addr: VirtAddr) -> Self {
        VirtPage(addr.align_down_page())
    }

    /// Returns the address of the page's first byte.
    ///
    #[inline]
    pub const fn start_address(&self) -> VirtAddr {
        self.0
    }

    /// Returns the page's size in bytes.
    ///
    #[inline]
    pub const fn size(&self) -> usize {
        PAGE_SIZE
    }

    /// Returns whether the page contains the given address.
    ///
    #[inline]
    pub fn contains(&self, addr: VirtAddr) -> bool {
        self.0 <= addr && addr.as_usize() < self.0.as_usize() + PAGE_SIZE
    }

    /// Returns the sequence of pages from `start` up to, but
    /// not including, `end`.
    ///
    pub fn range(start: VirtPage, end: VirtPage) -> VirtPageRange {
        VirtPageRange { start, end }
    }

    /// Returns the sequence of pages covering `addr..addr + size`.
    ///
    /// # Panics
    ///
    /// `range_of` panics if the end of the range is not a valid
    /// virtual address.
    ///
    pub fn range_of(addr: VirtAddr, size: usize) -> VirtPageRange {
        let start = VirtPage::containing_address(addr);
        let end = VirtPage::containing_address(VirtAddr::new(align_up(
            addr.as_usize() + size,
            PAGE_SIZE,
        )));
        VirtPageRange { start, end }
    }
}

impl fmt::Debug for VirtPage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "VirtPage({:#x})", self.0.as_usize())
    }
}

/// A contiguous sequence of virtual memory pages.
///
/// The range is exclusive: it covers `start` and every page up
/// to, but not including, `end`.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VirtPageRange {
    /// The first page in the range.
    pub start: VirtPage,

    /// The page one past the last page in the range.
    pub end: VirtPage,
}

impl VirtPageRange {
    /// Returns the number of pages in the range.
    ///
    pub fn num_pages(&self) -> usize {
        (self.end.start_address().as_usize() - self.start.start_address().as_usize()) / PAGE_SIZE
    }
}

impl Iterator for VirtPageRange {
    type Item = VirtPage;

    fn next(&mut self) -> Option<VirtPage> {
        if self.start < self.end {
            let page = self.start;
            self.start = VirtPage(VirtAddr::new(page.start_address().as_usize() + PAGE_SIZE));
            Some(page)
        } else {
            None
        }
    }
}

/// An arbitrary sequence of contiguous virtual addresses.
///
/// Unlike the page ranges, an address range is inclusive of
/// both its endpoints.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VirtAddrRange {
    start: VirtAddr,
    end: VirtAddr,
}

impl VirtAddrRange {
    /// Returns the range covering `start` through `end`,
    /// inclusive.
    ///
    pub const fn new(start: VirtAddr, end: VirtAddr) -> Self {
        assert!(start.as_usize() <= end.as_usize());
        VirtAddrRange { start, end }
    }

    /// Returns the first address in the range.
    ///
    pub const fn start(&self) -> VirtAddr {
        self.start
    }

    /// Returns the last address in the range.
    ///
    pub const fn end(&self) -> VirtAddr {
        self.end
    }

    /// Returns the range's size in bytes.
    ///
    pub const fn size(&self) -> usize {
        self.end.as_usize() - self.start.as_usize() + 1
    }

    /// Returns whether the range contains the given address.
    ///
    pub fn contains_addr(&self, addr: VirtAddr) -> bool {
        self.start <= addr && addr <= self.end
    }

    /// Returns whether the range wholly contains `start`
    /// through `end`, inclusive.
    ///
    pub fn contains_range(&self, start: VirtAddr, end: VirtAddr) -> bool {
        self.contains_addr(start) && self.contains_addr(end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_addresses() {
        assert!(VirtAddr::try_new(0x7fff_ffff_ffff).is_ok());
        assert!(VirtAddr::try_new(0x8000_0000_0000).is_err());
        assert!(VirtAddr::try_new(0xffff_7fff_ffff_ffff).is_err());
        assert!(VirtAddr::try_new(0xffff_8000_0000_0000).is_ok());
        assert!(VirtAddr::new(0xffff_8000_0000_0000).is_kernel_half());
        assert!(!VirtAddr::new(0x1000).is_kernel_half());
    }

    #[test]
    fn alignment() {
        let addr = VirtAddr::new(0x1f42);
        assert_eq!(addr.align_down_page(), VirtAddr::new(0x1000));
        assert_eq!(addr.align_up_page(), VirtAddr::new(0x2000));
        assert_eq!(addr.page_offset(), 0xf42);
    }

    #[test]
    fn page_ranges() {
        let range = VirtPage::range_of(VirtAddr::new(0x1800), 0x1000);
        assert_eq!(range.start.start_address(), VirtAddr::new(0x1000));
        assert_eq!(range.end.start_address(), VirtAddr::new(0x3000));
        assert_eq!(range.num_pages(), 2);

        let pages: alloc::vec::Vec<VirtPage> = range.collect();
        assert_eq!(pages.len(), 2);
        assert!(pages[0].contains(VirtAddr::new(0x1fff)));
        assert!(!pages[0].contains(VirtAddr::new(0x2000)));
    }

    #[test]
    fn addr_ranges() {
        let range = VirtAddrRange::new(VirtAddr::new(0x1000), VirtAddr::new(0x1fff));
        assert_eq!(range.size(), 0x1000);
        assert!(range.contains_addr(VirtAddr::new(0x1000)));
        assert!(range.contains_addr(VirtAddr::new(0x1fff)));
        assert!(!range.contains_addr(VirtAddr::new(0x2000)));
        assert!(range.contains_range(VirtAddr::new(0x1200), VirtAddr::new(0x1300)));
    }
}
