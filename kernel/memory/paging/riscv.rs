// Copyright 2026 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! RISC-V sv39, sv48 and sv57 page tables.
//!
//! The three translation modes share one entry layout and differ
//! only in the number of levels walked, so a single implementation
//! parameterised over the mode covers all of them.

use crate::{
    table_entries, zero_frame, ActiveTracker, ArchPageTable, MapError, PageInfo, PageSource,
    UnmapError, WalkError,
};
use memory::{
    FrameAllocator, FrameDeallocator, PageTableFlags, PhysAddr, PhysFrame, VirtAddr,
};

// The RISC-V page table entry bits.
const PTE_VALID: u64 = 1 << 0;
const PTE_READ: u64 = 1 << 1;
const PTE_WRITE: u64 = 1 << 2;
const PTE_EXECUTE: u64 = 1 << 3;
const PTE_USER: u64 = 1 << 4;
const PTE_GLOBAL: u64 = 1 << 5;
const PTE_ACCESSED: u64 = 1 << 6;
const PTE_DIRTY: u64 = 1 << 7;

// The two software bits carry the same bookkeeping as the AVL
// bits on x86_64.
const PTE_NO_FREE: u64 = 1 << 8;
const PTE_COPY_ON_WRITE: u64 = 1 << 9;

// Entries 256..512 of the root table cover the kernel half in
// every mode.
const KERNEL_HALF_START: usize = 256;

/// The RISC-V address translation mode, which fixes the number
/// of page table levels.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RiscvMode {
    /// 39-bit virtual addresses, 3 levels.
    Sv39,

    /// 48-bit virtual addresses, 4 levels.
    Sv48,

    /// 57-bit virtual addresses, 5 levels.
    Sv57,
}

impl RiscvMode {
    /// Returns the number of page table levels the mode walks.
    ///
    pub const fn levels(&self) -> usize {
        match self {
            RiscvMode::Sv39 => 3,
            RiscvMode::Sv48 => 4,
            RiscvMode::Sv57 => 5,
        }
    }
}

fn entry_index(va: VirtAddr, level: usize) -> usize {
    (va.as_usize() >> (12 + 9 * level)) & 0x1ff
}

fn entry_frame(entry: u64) -> PhysFrame {
    PhysFrame::from_page_number(((entry >> 10) & 0xfff_ffff_ffff) as usize)
}

fn is_valid(entry: u64) -> bool {
    entry & PTE_VALID != 0
}

// A valid entry with any permission bit set maps memory rather
// than pointing at the next table.
fn is_leaf(entry: u64) -> bool {
    is_valid(entry) && entry & (PTE_READ | PTE_WRITE | PTE_EXECUTE) != 0
}

fn make_intermediate(frame: PhysFrame) -> u64 {
    ((frame.page_number() as u64) << 10) | PTE_VALID
}

fn make_leaf(frame: PhysFrame, flags: PageTableFlags) -> u64 {
    // Pages are always readable. A and D are pre-set so
    // implementations that trap to maintain them do not fault.
    let mut entry =
        ((frame.page_number() as u64) << 10) | PTE_VALID | PTE_READ | PTE_ACCESSED | PTE_DIRTY;
    if flags.contains(PageTableFlags::WRITABLE) {
        entry |= PTE_WRITE;
    }
    if !flags.contains(PageTableFlags::NO_EXECUTE) {
        entry |= PTE_EXECUTE;
    }
    if flags.contains(PageTableFlags::USER_ACCESSIBLE) {
        entry |= PTE_USER;
    }
    if flags.contains(PageTableFlags::GLOBAL) {
        entry |= PTE_GLOBAL;
    }
    if flags.contains(PageTableFlags::NO_FREE) {
        entry |= PTE_NO_FREE;
    }
    if flags.contains(PageTableFlags::COPY_ON_WRITE) {
        entry |= PTE_COPY_ON_WRITE;
    }

    entry
}

/// A RISC-V page table in one of the sv39, sv48 or sv57 modes.
///
pub struct RiscvPageTable {
    root: PhysFrame,
    mode: RiscvMode,
    active: ActiveTracker,
}

impl RiscvPageTable {
    /// Creates an empty page table for the given mode.
    ///
    /// The new root's kernel half is copied from `template`
    /// (normally the kernel's own root table), if given.
    ///
    pub fn create_empty(
        allocator: &mut dyn FrameAllocator,
        template: Option<PhysFrame>,
        mode: RiscvMode,
    ) -> Result<Self, MapError> {
        let root = allocator.allocate_frame().ok_or(MapError::OutOfMemory)?;
        zero_frame(root);

        if let Some(template) = template {
            let new = unsafe { table_entries(root) };
            let old = unsafe { table_entries(template) };
            new[KERNEL_HALF_START..].copy_from_slice(&old[KERNEL_HALF_START..]);
        }

        Ok(RiscvPageTable {
            root,
            mode,
            active: ActiveTracker::new(),
        })
    }

    /// Adopts the page table the bootloader left in `satp`.
    ///
    /// # Safety
    ///
    /// `root` must be the physical frame of a valid root table
    /// for `mode` that this table takes sole ownership of.
    ///
    pub unsafe fn adopt(root: PhysFrame, mode: RiscvMode) -> Self {
        RiscvPageTable {
            root,
            mode,
            active: ActiveTracker::new(),
        }
    }

    /// Returns the table's translation mode.
    ///
    pub fn mode(&self) -> RiscvMode {
        self.mode
    }

    // Walks to the level-0 table for `va`, optionally creating
    // absent intermediate tables.
    fn walk(
        &self,
        va: VirtAddr,
        create: Option<&mut dyn FrameAllocator>,
    ) -> Result<PhysFrame, RiscvWalkError> {
        let mut create = create;
        let mut table = self.root;
        for level in (1..self.mode.levels()).rev() {
            let entries = unsafe { table_entries(table) };
            let index = entry_index(va, level);
            let entry = entries[index];

            if is_leaf(entry) {
                // A superpage mapping.
                return Err(RiscvWalkError::HugePage);
            }

            if !is_valid(entry) {
                match create.as_mut() {
                    None => return Err(RiscvWalkError::NotMapped),
                    Some(allocator) => {
                        let child = allocator
                            .allocate_frame()
                            .ok_or(RiscvWalkError::OutOfMemory)?;
                        zero_frame(child);
                        entries[index] = make_intermediate(child);
                        table = child;
                        continue;
                    }
                }
            }

            table = entry_frame(entry);
        }

        Ok(table)
    }

    /// Walks to the slot for the level-0 table covering `va`,
    /// creating absent intermediate levels, and installs
    /// `table` there. The caller owns `table` (zeroed or
    /// pre-filled) from then on; this is how a temporary-mapper
    /// window gets a page table it controls directly.
    ///
    pub fn install_leaf_table(
        &mut self,
        va: VirtAddr,
        table: PhysFrame,
        allocator: &mut dyn FrameAllocator,
    ) -> Result<(), MapError> {
        let mut current = self.root;
        for level in (2..self.mode.levels()).rev() {
            let entries = unsafe { table_entries(current) };
            let index = entry_index(va, level);
            let entry = entries[index];

            if is_leaf(entry) {
                return Err(MapError::HugePage);
            }

            if !is_valid(entry) {
                let child = allocator.allocate_frame().ok_or(MapError::OutOfMemory)?;
                zero_frame(child);
                entries[index] = make_intermediate(child);
                current = child;
            } else {
                current = entry_frame(entry);
            }
        }

        let entries = unsafe { table_entries(current) };
        let index = entry_index(va, 1);
        if is_valid(entries[index]) {
            return Err(MapError::AlreadyMapped);
        }

        entries[index] = make_intermediate(table);
        Ok(())
    }

    fn free_subtree(frame: PhysFrame, level: usize, deallocator: &mut dyn FrameDeallocator) {
        let entries = unsafe { table_entries(frame) };
        for entry in entries.iter_mut() {
            if !is_valid(*entry) {
                continue;
            }

            if level == 0 || is_leaf(*entry) {
                if level == 0 && *entry & PTE_NO_FREE == 0 {
                    unsafe { deallocator.deallocate_frame(entry_frame(*entry)) };
                }
            } else {
                let child = entry_frame(*entry);
                Self::free_subtree(child, level - 1, deallocator);
                unsafe { deallocator.deallocate_frame(child) };
            }

            *entry = 0;
        }
    }
}

enum RiscvWalkError {
    NotMapped,
    HugePage,
    OutOfMemory,
}

impl ArchPageTable for RiscvPageTable {
    fn root_frame(&self) -> PhysFrame {
        self.root
    }

    fn map(
        &mut self,
        source: PageSource,
        va: VirtAddr,
        flags: PageTableFlags,
        allocator: &mut dyn FrameAllocator,
    ) -> Result<(), MapError> {
        let table = self.walk(va, Some(allocator)).map_err(|err| match err {
            RiscvWalkError::HugePage => MapError::HugePage,
            RiscvWalkError::OutOfMemory => MapError::OutOfMemory,
            RiscvWalkError::NotMapped => unreachable!("creating walk cannot report NotMapped"),
        })?;

        let entries = unsafe { table_entries(table) };
        let index = entry_index(va, 0);
        if is_valid(entries[index]) {
            return Err(MapError::AlreadyMapped);
        }

        let mut flags = flags;
        if let PageSource::Shared(_) = source {
            flags |= PageTableFlags::NO_FREE;
        }

        entries[index] = make_leaf(source.frame(), flags);
        Ok(())
    }

    fn unmap(
        &mut self,
        va: VirtAddr,
        free_page: bool,
        deallocator: &mut dyn FrameDeallocator,
    ) -> Result<(), UnmapError> {
        let table = self.walk(va, None).map_err(|err| match err {
            RiscvWalkError::HugePage => UnmapError::HugePage,
            _ => UnmapError::NotMapped,
        })?;

        let entries = unsafe { table_entries(table) };
        let index = entry_index(va, 0);
        let entry = entries[index];
        if !is_valid(entry) {
            return Err(UnmapError::NotMapped);
        }

        entries[index] = 0;
        if free_page && entry & PTE_NO_FREE == 0 {
            unsafe { deallocator.deallocate_frame(entry_frame(entry)) };
        }

        self.invalidate_tlb(va, 1);
        Ok(())
    }

    fn phys_addr_of(&self, va: VirtAddr) -> Result<PhysAddr, WalkError> {
        let table = self.walk(va, None).map_err(|err| match err {
            RiscvWalkError::HugePage => WalkError::HugePage,
            _ => WalkError::NotMapped,
        })?;

        let entries = unsafe { table_entries(table) };
        let entry = entries[entry_index(va, 0)];
        if !is_valid(entry) {
            return Err(WalkError::NotMapped);
        }

        Ok(entry_frame(entry).start_address() + va.page_offset())
    }

    fn page_info(&self, va: VirtAddr) -> PageInfo {
        let table = match self.walk(va, None) {
            Ok(table) => table,
            Err(_) => return PageInfo::default(),
        };

        let entries = unsafe { table_entries(table) };
        let entry = entries[entry_index(va, 0)];
        if !is_valid(entry) {
            return PageInfo::default();
        }

        PageInfo {
            present: true,
            user: entry & PTE_USER != 0,
            writable: entry & PTE_WRITE != 0,
            dirty: entry & PTE_DIRTY != 0,
            no_free: entry & PTE_NO_FREE != 0,
            copy_on_write: entry & PTE_COPY_ON_WRITE != 0,
            frame: Some(entry_frame(entry)),
        }
    }

    fn destroy(&mut self, deallocator: &mut dyn FrameDeallocator) {
        assert!(self.active_count() == 0, "destroying an active page table");

        let top = self.mode.levels() - 1;
        let entries = unsafe { table_entries(self.root) };
        for entry in entries[..KERNEL_HALF_START].iter_mut() {
            if is_valid(*entry) && !is_leaf(*entry) {
                let child = entry_frame(*entry);
                Self::free_subtree(child, top - 1, deallocator);
                unsafe { deallocator.deallocate_frame(child) };
            }

            *entry = 0;
        }

        unsafe { deallocator.deallocate_frame(self.root) };
    }

    fn active_count(&self) -> usize {
        self.active.count()
    }

    fn activate(&self) {
        self.active.activate(self.root);
    }

    fn deactivate(&self) {
        self.active.deactivate(self.root);
    }

    fn invalidate_tlb(&self, va: VirtAddr, npages: usize) {
        self.active.invalidate(self.root, va, npages);
    }
}
