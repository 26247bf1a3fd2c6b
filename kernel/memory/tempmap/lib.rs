// Copyright 2026 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Temporary mappings of physical frames into kernel virtual
//! memory.
//!
//! Kernel code regularly needs a short-lived view of an arbitrary
//! physical frame: to zero a freshly allocated page, to copy between
//! frames, to read a page table it does not have mapped. A
//! [`TempMapper`] provides that view:
//!
//! - [`DirectMapper`] serves it from the higher-half direct map and
//!   is free; it is the mapper in use from the moment the bootloader
//!   hands over (and in hosted tests, where the direct map is the
//!   identity).
//! - [`WindowMapper`] owns a small per-CPU window of virtual
//!   addresses and the last-level page table that backs them,
//!   installing and clearing entries itself. It serves kernels
//!   running without a full direct map.
//!
//! [`TempMapping`] is the scoped form: it unmaps on drop, on every
//! exit path.

#![no_std]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

use memory::constants::TEMP_MAP_SLOTS;
use memory::{phys_to_virt_addr, PhysFrame, VirtAddr, PAGE_SIZE};

/// Maps single physical frames into kernel virtual memory for
/// transient access.
///
pub trait TempMapper {
    /// Maps the frame, returning the virtual address it can be
    /// accessed through, or `None` if the mapper is full.
    ///
    fn map(&mut self, frame: PhysFrame) -> Option<VirtAddr>;

    /// Releases a mapping previously returned by
    /// [`map`](Self::map).
    ///
    fn unmap(&mut self, addr: VirtAddr);
}

/// A temp mapper backed by the higher-half direct map.
///
/// Mapping is address arithmetic and unmapping is a no-op.
///
pub struct DirectMapper;

impl TempMapper for DirectMapper {
    fn map(&mut self, frame: PhysFrame) -> Option<VirtAddr> {
        Some(phys_to_virt_addr(frame.start_address()))
    }

    fn unmap(&mut self, _addr: VirtAddr) {}
}

/// Writes the page-table entry mapping `frame` into a window
/// slot, in the arch's entry layout.
///
pub type EntryEncoder = fn(PhysFrame) -> u64;

/// Flushes the TLB entry for one page on the executing CPU.
///
pub type FlushFn = fn(VirtAddr);

/// Encodes a window entry in the x86_64 layout: present,
/// writable, global.
///
pub fn x86_window_entry(frame: PhysFrame) -> u64 {
    frame.start_address().as_u64() | (1 << 8) | (1 << 1) | (1 << 0)
}

/// Encodes a window entry in the RISC-V layout: valid, readable,
/// writable, global, with A and D pre-set.
///
pub fn riscv_window_entry(frame: PhysFrame) -> u64 {
    ((frame.page_number() as u64) << 10) | (1 << 7) | (1 << 6) | (1 << 5) | (1 << 2) | (1 << 1) | 1
}

/// A temp mapper owning a fixed window of
/// [`TEMP_MAP_SLOTS`] pages and the last-level page table
/// backing them.
///
/// A free slot is found by scanning upwards from a floor index;
/// all slots below the floor are occupied, so repeated
/// map/unmap pairs reuse the same slot without a scan.
///
pub struct WindowMapper {
    // First address of the window. Page-aligned; the window
    // must not cross a level-0 table boundary.
    window: VirtAddr,

    // The level-0 table holding the window's entries.
    table: PhysFrame,

    // Index of the window's first entry within the table.
    first_entry: usize,

    occupied: [bool; TEMP_MAP_SLOTS],

    // No slot below this index is free.
    floor: usize,

    encode: EntryEncoder,
    flush: FlushFn,
}

impl WindowMapper {
    /// Creates a window mapper over `window`, backed by the
    /// given level-0 `table`, which the mapper takes sole
    /// ownership of.
    ///
    /// # Panics
    ///
    /// `new` panics if `window` is not page-aligned or the
    /// window would cross its table's boundary.
    ///
    pub fn new(window: VirtAddr, table: PhysFrame, encode: EntryEncoder, flush: FlushFn) -> Self {
        assert!(window.page_offset() == 0, "window must be page-aligned");
        let first_entry = (window.as_usize() >> 12) & 0x1ff;
        assert!(
            first_entry + TEMP_MAP_SLOTS <= 512,
            "window crosses a page-table boundary"
        );

        WindowMapper {
            window,
            table,
            first_entry,
            occupied: [false; TEMP_MAP_SLOTS],
            floor: 0,
            encode,
            flush,
        }
    }

    /// Returns the number of occupied slots.
    ///
    pub fn in_use(&self) -> usize {
        self.occupied.iter().filter(|&&used| used).count()
    }

    fn entries(&self) -> &'static mut [u64; 512] {
        let virt = phys_to_virt_addr(self.table.start_address());
        unsafe { &mut *(virt.as_mut_ptr() as *mut [u64; 512]) }
    }

    fn slot_of(&self, addr: VirtAddr) -> usize {
        assert!(
            addr >= self.window && addr.as_usize() < self.window.as_usize() + TEMP_MAP_SLOTS * PAGE_SIZE,
            "address {:p} is outside the window",
            addr
        );
        (addr - self.window) / PAGE_SIZE
    }
}

impl TempMapper for WindowMapper {
    fn map(&mut self, frame: PhysFrame) -> Option<VirtAddr> {
        let slot = (self.floor..TEMP_MAP_SLOTS).find(|&slot| !self.occupied[slot])?;
        self.occupied[slot] = true;
        self.floor = slot + 1;
        self.entries()[self.first_entry + slot] = (self.encode)(frame);
        Some(self.window + slot * PAGE_SIZE)
    }

    fn unmap(&mut self, addr: VirtAddr) {
        let slot = self.slot_of(addr);
        assert!(self.occupied[slot], "unmapping a free window slot");
        self.occupied[slot] = false;
        self.entries()[self.first_entry + slot] = 0;
        (self.flush)(addr);
        if slot < self.floor {
            self.floor = slot;
        }
    }
}

/// A scoped temporary mapping, released on drop.
///
pub struct TempMapping<'mapper> {
    mapper: &'mapper mut dyn TempMapper,
    addr: VirtAddr,
}

impl<'mapper> TempMapping<'mapper> {
    /// Maps `frame` through `mapper` for the mapping's
    /// lifetime.
    ///
    pub fn new(mapper: &'mapper mut dyn TempMapper, frame: PhysFrame) -> Option<Self> {
        let addr = mapper.map(frame)?;
        Some(TempMapping { mapper, addr })
    }

    /// Returns the address the frame is mapped at.
    ///
    pub fn addr(&self) -> VirtAddr {
        self.addr
    }

    /// Returns the mapped frame's bytes.
    ///
    pub fn bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.addr.as_ptr(), PAGE_SIZE) }
    }

    /// Returns the mapped frame's bytes, mutably.
    ///
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.addr.as_mut_ptr(), PAGE_SIZE) }
    }
}

impl Drop for TempMapping<'_> {
    fn drop(&mut self) {
        self.mapper.unmap(self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::{
        x86_window_entry, DirectMapper, TempMapper, TempMapping, WindowMapper,
    };
    use memory::constants::TEMP_MAP_SLOTS;
    use memory::testing::HeapFrameAllocator;
    use memory::{FrameAllocator, PhysFrame, VirtAddr, PAGE_SIZE};

    fn no_flush(_addr: VirtAddr) {}

    // The tests run under the identity direct map, so the
    // window address itself is not dereferenced; slot and entry
    // bookkeeping is what is checked.
    const WINDOW: usize = 0x7000_0000;

    fn mapper(frames: &mut HeapFrameAllocator) -> (WindowMapper, PhysFrame) {
        let table = frames.allocate_frame().unwrap();
        (
            WindowMapper::new(VirtAddr::new(WINDOW), table, x86_window_entry, no_flush),
            table,
        )
    }

    fn table_entry(table: PhysFrame, index: usize) -> u64 {
        let entries =
            unsafe { &*(table.start_address().as_usize() as *const [u64; 512]) };
        entries[((WINDOW >> 12) & 0x1ff) + index]
    }

    #[test]
    fn direct_mapper_is_arithmetic() {
        let mut frames = HeapFrameAllocator::new();
        let frame = frames.allocate_frame().unwrap();

        let mut direct = DirectMapper;
        let addr = direct.map(frame).unwrap();
        assert_eq!(addr.as_usize(), frame.start_address().as_usize());
        direct.unmap(addr);
    }

    #[test]
    fn slots_and_floor() {
        let mut frames = HeapFrameAllocator::new();
        let (mut mapper, table) = mapper(&mut frames);

        let frame_a = frames.allocate_frame().unwrap();
        let frame_b = frames.allocate_frame().unwrap();

        let a = mapper.map(frame_a).unwrap();
        let b = mapper.map(frame_b).unwrap();
        assert_eq!(a, VirtAddr::new(WINDOW));
        assert_eq!(b, VirtAddr::new(WINDOW + PAGE_SIZE));
        assert_eq!(mapper.in_use(), 2);

        // The entries carry the frames' addresses.
        assert_eq!(
            table_entry(table, 0) & 0x000f_ffff_ffff_f000,
            frame_a.start_address().as_u64()
        );
        assert_eq!(table_entry(table, 0) & 1, 1);

        // Unmapping the first slot lowers the floor, so it is
        // reused next.
        mapper.unmap(a);
        assert_eq!(table_entry(table, 0), 0);
        let again = mapper.map(frame_a).unwrap();
        assert_eq!(again, a);

        mapper.unmap(again);
        mapper.unmap(b);
        assert_eq!(mapper.in_use(), 0);
    }

    #[test]
    fn window_fills_up() {
        let mut frames = HeapFrameAllocator::new();
        let (mut mapper, _table) = mapper(&mut frames);

        let frame = frames.allocate_frame().unwrap();
        let mut held = [None; TEMP_MAP_SLOTS];
        for slot in held.iter_mut() {
            *slot = Some(mapper.map(frame).unwrap());
        }

        assert_eq!(mapper.in_use(), TEMP_MAP_SLOTS);
        assert!(mapper.map(frame).is_none());

        for slot in held.iter().flatten() {
            mapper.unmap(*slot);
        }

        assert_eq!(mapper.in_use(), 0);
    }

    #[test]
    fn scoped_mapping_releases_on_drop() {
        let mut frames = HeapFrameAllocator::new();
        let frame = frames.allocate_frame().unwrap();

        let mut direct = DirectMapper;
        {
            let mut mapping = TempMapping::new(&mut direct, frame).unwrap();
            mapping.bytes_mut()[0] = 0xaa;
            assert_eq!(mapping.bytes()[0], 0xaa);
        }

        // With the window mapper, the drop visibly frees the
        // slot.
        let (mut window, _table) = mapper(&mut frames);
        {
            let mapping = TempMapping::new(&mut window, frame).unwrap();
            assert_eq!(mapping.addr(), VirtAddr::new(WINDOW));
        }

        assert_eq!(window.in_use(), 0);
    }
}
