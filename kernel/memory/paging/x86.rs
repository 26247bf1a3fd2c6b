// Copyright 2026 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! 4-level x86_64 page tables.

use crate::{
    table_entries, zero_frame, ActiveTracker, ArchPageTable, MapError, PageInfo, PageSource,
    UnmapError, WalkError,
};
use memory::{
    FrameAllocator, FrameDeallocator, PageTableFlags, PhysAddr, PhysFrame, VirtAddr,
};

// Bits 12..52 of an entry hold the frame's physical address.
const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

// The top level of the walk (PML4).
const TOP_LEVEL: usize = 3;

// Entries 256..512 of the PML4 cover the kernel half of the
// address space.
const KERNEL_HALF_START: usize = 256;

// Child tables are mapped writable and user-accessible; access
// control happens at the leaves.
const INTERMEDIATE: u64 = (PageTableFlags::PRESENT.bits()
    | PageTableFlags::WRITABLE.bits()
    | PageTableFlags::USER_ACCESSIBLE.bits()) as u64;

fn entry_index(va: VirtAddr, level: usize) -> usize {
    (va.as_usize() >> (12 + 9 * level)) & 0x1ff
}

fn entry_frame(entry: u64) -> PhysFrame {
    PhysFrame::from_start_address(PhysAddr::new((entry & ADDR_MASK) as usize))
        .expect("masked entry address is frame-aligned")
}

fn entry_flags(entry: u64) -> PageTableFlags {
    PageTableFlags::from_bits_truncate(entry)
}

fn make_entry(frame: PhysFrame, flags: PageTableFlags) -> u64 {
    (flags.bits() & !ADDR_MASK) | frame.start_address().as_u64()
}

/// An x86_64 4-level page table.
///
/// The PML4's kernel half is copied from a template table at
/// creation, so every address space shares the kernel's
/// mappings; [`destroy`](ArchPageTable::destroy) walks only the
/// user half.
///
pub struct X86PageTable {
    root: PhysFrame,
    active: ActiveTracker,
}

impl X86PageTable {
    /// Creates an empty page table.
    ///
    /// The new PML4's kernel half is copied from `template`
    /// (normally the kernel's own root table), if given.
    ///
    pub fn create_empty(
        allocator: &mut dyn FrameAllocator,
        template: Option<PhysFrame>,
    ) -> Result<Self, MapError> {
        let root = allocator.allocate_frame().ok_or(MapError::OutOfMemory)?;
        zero_frame(root);

        if let Some(template) = template {
            let new = unsafe { table_entries(root) };
            let old = unsafe { table_entries(template) };
            new[KERNEL_HALF_START..].copy_from_slice(&old[KERNEL_HALF_START..]);
        }

        Ok(X86PageTable {
            root,
            active: ActiveTracker::new(),
        })
    }

    /// Adopts the page table the bootloader left in CR3.
    ///
    /// # Safety
    ///
    /// `root` must be the physical frame of a valid PML4 that
    /// this table takes sole ownership of.
    ///
    pub unsafe fn adopt(root: PhysFrame) -> Self {
        X86PageTable {
            root,
            active: ActiveTracker::new(),
        }
    }

    // Walks to the leaf entry for `va`, optionally creating
    // absent intermediate tables. Returns the level-0 table
    // frame holding the leaf.
    fn walk(
        &self,
        va: VirtAddr,
        create: Option<&mut dyn FrameAllocator>,
    ) -> Result<PhysFrame, X86WalkError> {
        let mut create = create;
        let mut table = self.root;
        for level in (1..=TOP_LEVEL).rev() {
            let entries = unsafe { table_entries(table) };
            let index = entry_index(va, level);
            let entry = entries[index];

            if entry_flags(entry).contains(PageTableFlags::HUGE_PAGE) {
                return Err(X86WalkError::HugePage);
            }

            if !entry_flags(entry).present() {
                match create.as_mut() {
                    None => return Err(X86WalkError::NotMapped),
                    Some(allocator) => {
                        let child = allocator
                            .allocate_frame()
                            .ok_or(X86WalkError::OutOfMemory)?;
                        zero_frame(child);
                        entries[index] = make_entry(
                            child,
                            PageTableFlags::from_bits_truncate(INTERMEDIATE),
                        );
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
        for level in (2..=TOP_LEVEL).rev() {
            let entries = unsafe { table_entries(current) };
            let index = entry_index(va, level);
            let entry = entries[index];

            if entry_flags(entry).contains(PageTableFlags::HUGE_PAGE) {
                return Err(MapError::HugePage);
            }

            if !entry_flags(entry).present() {
                let child = allocator.allocate_frame().ok_or(MapError::OutOfMemory)?;
                zero_frame(child);
                entries[index] =
                    make_entry(child, PageTableFlags::from_bits_truncate(INTERMEDIATE));
                current = child;
            } else {
                current = entry_frame(entry);
            }
        }

        let entries = unsafe { table_entries(current) };
        let index = entry_index(va, 1);
        if entry_flags(entries[index]).present() {
            return Err(MapError::AlreadyMapped);
        }

        entries[index] = make_entry(table, PageTableFlags::from_bits_truncate(INTERMEDIATE));
        Ok(())
    }

    // Frees a table at `level` and everything beneath it in the
    // walk.
    fn free_subtree(frame: PhysFrame, level: usize, deallocator: &mut dyn FrameDeallocator) {
        let entries = unsafe { table_entries(frame) };
        for entry in entries.iter_mut() {
            let flags = entry_flags(*entry);
            if !flags.present() {
                continue;
            }

            if level == 0 {
                // Auto-clear: the frame goes back to the
                // allocator unless the mapping only borrowed it.
                if !flags.contains(PageTableFlags::NO_FREE) {
                    unsafe { deallocator.deallocate_frame(entry_frame(*entry)) };
                }
            } else if !flags.contains(PageTableFlags::HUGE_PAGE) {
                let child = entry_frame(*entry);
                Self::free_subtree(child, level - 1, deallocator);
                unsafe { deallocator.deallocate_frame(child) };
            }

            *entry = 0;
        }
    }
}

enum X86WalkError {
    NotMapped,
    HugePage,
    OutOfMemory,
}

impl ArchPageTable for X86PageTable {
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
            X86WalkError::HugePage => MapError::HugePage,
            X86WalkError::OutOfMemory => MapError::OutOfMemory,
            X86WalkError::NotMapped => unreachable!("creating walk cannot report NotMapped"),
        })?;

        let entries = unsafe { table_entries(table) };
        let index = entry_index(va, 0);
        if entry_flags(entries[index]).present() {
            return Err(MapError::AlreadyMapped);
        }

        let mut flags = flags | PageTableFlags::PRESENT;
        if let PageSource::Shared(_) = source {
            flags |= PageTableFlags::NO_FREE;
        }

        entries[index] = make_entry(source.frame(), flags);
        Ok(())
    }

    fn unmap(
        &mut self,
        va: VirtAddr,
        free_page: bool,
        deallocator: &mut dyn FrameDeallocator,
    ) -> Result<(), UnmapError> {
        let table = self.walk(va, None).map_err(|err| match err {
            X86WalkError::HugePage => UnmapError::HugePage,
            _ => UnmapError::NotMapped,
        })?;

        let entries = unsafe { table_entries(table) };
        let index = entry_index(va, 0);
        let flags = entry_flags(entries[index]);
        if !flags.present() {
            return Err(UnmapError::NotMapped);
        }

        let frame = entry_frame(entries[index]);
        entries[index] = 0;
        if free_page && !flags.contains(PageTableFlags::NO_FREE) {
            unsafe { deallocator.deallocate_frame(frame) };
        }

        self.invalidate_tlb(va, 1);
        Ok(())
    }

    fn phys_addr_of(&self, va: VirtAddr) -> Result<PhysAddr, WalkError> {
        let table = self.walk(va, None).map_err(|err| match err {
            X86WalkError::HugePage => WalkError::HugePage,
            _ => WalkError::NotMapped,
        })?;

        let entries = unsafe { table_entries(table) };
        let entry = entries[entry_index(va, 0)];
        if !entry_flags(entry).present() {
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
        let flags = entry_flags(entry);
        if !flags.present() {
            return PageInfo::default();
        }

        PageInfo {
            present: true,
            user: flags.contains(PageTableFlags::USER_ACCESSIBLE),
            writable: flags.contains(PageTableFlags::WRITABLE),
            dirty: flags.contains(PageTableFlags::DIRTY),
            no_free: flags.contains(PageTableFlags::NO_FREE),
            copy_on_write: flags.contains(PageTableFlags::COPY_ON_WRITE),
            frame: Some(entry_frame(entry)),
        }
    }

    fn destroy(&mut self, deallocator: &mut dyn FrameDeallocator) {
        assert!(self.active_count() == 0, "destroying an active page table");

        let entries = unsafe { table_entries(self.root) };
        for entry in entries[..KERNEL_HALF_START].iter_mut() {
            let flags = entry_flags(*entry);
            if flags.present() && !flags.contains(PageTableFlags::HUGE_PAGE) {
                let child = entry_frame(*entry);
                Self::free_subtree(child, TOP_LEVEL - 1, deallocator);
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
