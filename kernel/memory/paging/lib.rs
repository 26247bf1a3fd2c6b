// Copyright 2026 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Arch page tables: the structures the hardware walks to translate
//! virtual addresses.
//!
//! The [`ArchPageTable`] trait is the interface the rest of the kernel
//! sees: map a frame at an address, unmap it, translate, inspect, and
//! keep the TLBs coherent. [`X86PageTable`] implements it with x86_64
//! 4-level tables; [`RiscvPageTable`] with RISC-V sv39, sv48 or sv57
//! tables. How a mapping is installed (and whether a recursive
//! mapping, a scratch window or the direct map is used to reach table
//! frames) is an implementation detail hidden behind the trait; both
//! implementations here reach table frames through the higher-half
//! direct map.
//!
//! The actual privileged operations (loading a root table, flushing
//! TLB entries, sending shootdown IPIs) are installed once at boot as
//! an [`ArchHooks`] table and are no-ops until then, which is what
//! lets the walk logic run unmodified in hosted tests.
//!
//! TLB coherence is explicit. Every page table counts the CPUs it is
//! active on; [`ArchPageTable::invalidate_tlb`] flushes locally when
//! the table is active on the calling CPU and signals a shootdown to
//! every other CPU the table is active on. The other CPUs service the
//! signal on their next interrupt.

#![no_std]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

mod riscv;
mod x86;

pub use crate::riscv::{RiscvMode, RiscvPageTable};
pub use crate::x86::X86PageTable;

use core::sync::atomic::{AtomicUsize, Ordering};
use memory::constants::MAX_CPUS;
use memory::{
    FrameAllocator, FrameDeallocator, PageTableFlags, PhysAddr, PhysFrame, VirtAddr,
};

/// The privileged operations the page tables need from the
/// architecture layer.
///
#[derive(Clone, Copy)]
pub struct ArchHooks {
    /// Returns the id of the executing CPU.
    pub current_cpu: fn() -> usize,

    /// Loads the given root table on the executing CPU
    /// (`mov cr3` on x86_64, `csrw satp` on RISC-V).
    pub load_root: fn(PhysFrame),

    /// Flushes the TLB entry for one page on the executing CPU.
    pub flush_page: fn(VirtAddr),

    /// Flushes the whole TLB on the executing CPU.
    pub flush_all: fn(),

    /// Signals a TLB shootdown to the given CPU. The target
    /// services the signal on its next interrupt.
    pub signal_shootdown: fn(usize),
}

fn nop_current_cpu() -> usize {
    0
}
fn nop_load_root(_frame: PhysFrame) {}
fn nop_flush_page(_addr: VirtAddr) {}
fn nop_flush_all() {}
fn nop_signal_shootdown(_cpu: usize) {}

const NOP_HOOKS: ArchHooks = ArchHooks {
    current_cpu: nop_current_cpu,
    load_root: nop_load_root,
    flush_page: nop_flush_page,
    flush_all: nop_flush_all,
    signal_shootdown: nop_signal_shootdown,
};

static HOOKS: spin_free::HookCell = spin_free::HookCell::new();

// A tiny lock-free cell for the hook table, so this crate does
// not need a spinlock dependency. The hooks are written once at
// boot, before any concurrent use.
mod spin_free {
    use super::{ArchHooks, NOP_HOOKS};
    use core::cell::UnsafeCell;
    use core::sync::atomic::{AtomicBool, Ordering};

    pub struct HookCell {
        set: AtomicBool,
        hooks: UnsafeCell<ArchHooks>,
    }

    unsafe impl Sync for HookCell {}

    impl HookCell {
        pub const fn new() -> Self {
            HookCell {
                set: AtomicBool::new(false),
                hooks: UnsafeCell::new(NOP_HOOKS),
            }
        }

        pub fn install(&self, hooks: ArchHooks) {
            unsafe { *self.hooks.get() = hooks };
            self.set.store(true, Ordering::SeqCst);
        }

        pub fn get(&self) -> ArchHooks {
            if self.set.load(Ordering::Acquire) {
                unsafe { *self.hooks.get() }
            } else {
                NOP_HOOKS
            }
        }
    }
}

/// Installs the architecture hook table.
///
/// Called once by the arch entry code, before the first page
/// table is activated.
///
pub fn set_arch_hooks(hooks: ArchHooks) {
    HOOKS.install(hooks);
}

pub(crate) fn hooks() -> ArchHooks {
    HOOKS.get()
}

// The root table each CPU currently has loaded, by physical
// address. Zero means none.
static CURRENT_ROOT: [AtomicUsize; MAX_CPUS] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const ZERO: AtomicUsize = AtomicUsize::new(0);
    [ZERO; MAX_CPUS]
};

/// An error encountered while installing a mapping.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// The leaf entry is already present.
    AlreadyMapped,

    /// The walk ran into a huge-page entry.
    HugePage,

    /// Allocating a page-table frame failed.
    OutOfMemory,
}

/// An error encountered while removing a mapping.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnmapError {
    /// No mapping exists at the address.
    NotMapped,

    /// The walk ran into a huge-page entry.
    HugePage,
}

/// An error encountered while translating an address.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalkError {
    /// Some level of the walk is absent.
    NotMapped,

    /// The walk ran into a huge-page entry.
    HugePage,
}

/// A frame to install in a leaf entry, carrying its ownership.
///
#[derive(Clone, Copy, Debug)]
pub enum PageSource {
    /// The mapping owns the frame: clearing the mapping frees
    /// the frame.
    Owned(PhysFrame),

    /// The mapping borrows the frame, which is owned elsewhere
    /// (a memory object slot, device memory). The leaf is
    /// marked `NO_FREE` and clearing it leaves the frame alone.
    Shared(PhysFrame),
}

impl PageSource {
    /// Returns the frame to be mapped.
    ///
    pub fn frame(&self) -> PhysFrame {
        match *self {
            PageSource::Owned(frame) => frame,
            PageSource::Shared(frame) => frame,
        }
    }
}

/// Everything a leaf entry records about a mapping, for
/// inspection.
///
#[derive(Clone, Copy, Debug, Default)]
pub struct PageInfo {
    /// Whether a mapping is installed.
    pub present: bool,

    /// Whether user mode may access the page.
    pub user: bool,

    /// Whether the page is writable.
    pub writable: bool,

    /// Whether the page has been written to.
    pub dirty: bool,

    /// Whether the frame is merely borrowed by the mapping.
    pub no_free: bool,

    /// Whether the page is marked copy-on-write.
    pub copy_on_write: bool,

    /// The mapped frame, if present.
    pub frame: Option<PhysFrame>,
}

/// The interface of an architecture's page table.
///
/// All methods leave TLB maintenance to the caller except
/// [`unmap`](Self::unmap), which invalidates the page it
/// removes.
///
pub trait ArchPageTable: Send {
    /// Returns the physical frame of the top-level table.
    ///
    fn root_frame(&self) -> PhysFrame;

    /// Installs a mapping of `source` at `va`.
    ///
    /// Absent intermediate tables are allocated from
    /// `allocator`. Fails with [`MapError::AlreadyMapped`] if a
    /// leaf is already present and [`MapError::HugePage`] if
    /// the walk hits a huge-page entry.
    ///
    fn map(
        &mut self,
        source: PageSource,
        va: VirtAddr,
        flags: PageTableFlags,
        allocator: &mut dyn FrameAllocator,
    ) -> Result<(), MapError>;

    /// Removes the mapping at `va` and invalidates it.
    ///
    /// The mapped frame is released to `deallocator` if
    /// `free_page` is set and the mapping owns it.
    ///
    fn unmap(
        &mut self,
        va: VirtAddr,
        free_page: bool,
        deallocator: &mut dyn FrameDeallocator,
    ) -> Result<(), UnmapError>;

    /// Translates `va` to the physical address it maps to.
    ///
    fn phys_addr_of(&self, va: VirtAddr) -> Result<PhysAddr, WalkError>;

    /// Returns what the leaf entry at `va` records.
    ///
    fn page_info(&self, va: VirtAddr) -> PageInfo;

    /// Releases every frame owned by user-half mappings, every
    /// user-half intermediate table, and finally the top-level
    /// table itself. The table must not be active on any CPU.
    ///
    fn destroy(&mut self, deallocator: &mut dyn FrameDeallocator);

    /// Returns the number of CPUs the table is active on.
    ///
    fn active_count(&self) -> usize;

    /// Loads the table on the executing CPU.
    ///
    fn activate(&self);

    /// Notes that the executing CPU stopped using the table.
    ///
    fn deactivate(&self);

    /// Invalidates the TLB entries for `npages` pages starting
    /// at `va`, on every CPU the table is active on.
    ///
    fn invalidate_tlb(&self, va: VirtAddr, npages: usize);
}

// Shared activity tracking and TLB coherence for the per-arch
// implementations.
pub(crate) struct ActiveTracker {
    count: AtomicUsize,
}

impl ActiveTracker {
    pub(crate) const fn new() -> Self {
        ActiveTracker {
            count: AtomicUsize::new(0),
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub(crate) fn activate(&self, root: PhysFrame) {
        let hooks = hooks();
        let cpu = (hooks.current_cpu)();
        let previous = CURRENT_ROOT[cpu].swap(root.start_address().as_usize(), Ordering::SeqCst);
        if previous != root.start_address().as_usize() {
            self.count.fetch_add(1, Ordering::SeqCst);
        }

        (hooks.load_root)(root);
    }

    pub(crate) fn deactivate(&self, root: PhysFrame) {
        let hooks = hooks();
        let cpu = (hooks.current_cpu)();
        let previous = CURRENT_ROOT[cpu].swap(0, Ordering::SeqCst);
        if previous == root.start_address().as_usize() {
            self.count.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn invalidate(&self, root: PhysFrame, va: VirtAddr, npages: usize) {
        let hooks = hooks();
        let cpu = (hooks.current_cpu)();
        let root_addr = root.start_address().as_usize();
        let locally_active = CURRENT_ROOT[cpu].load(Ordering::Relaxed) == root_addr;

        if locally_active {
            for i in 0..npages {
                (hooks.flush_page)(va + i * memory::PAGE_SIZE);
            }
        }

        // Other CPUs running this table service the shootdown
        // on their next interrupt.
        if self.count() > locally_active as usize {
            for (other, current) in CURRENT_ROOT.iter().enumerate() {
                if other != cpu && current.load(Ordering::Relaxed) == root_addr {
                    (hooks.signal_shootdown)(other);
                }
            }
        }
    }
}

// Reads and writes of table frames go through the direct map.
pub(crate) unsafe fn table_entries(frame: PhysFrame) -> &'static mut [u64; 512] {
    let virt = memory::phys_to_virt_addr(frame.start_address());
    &mut *(virt.as_mut_ptr() as *mut [u64; 512])
}

pub(crate) fn zero_frame(frame: PhysFrame) {
    let entries = unsafe { table_entries(frame) };
    for entry in entries.iter_mut() {
        *entry = 0;
    }
}

/// Maps `npages` pages starting at `va`, taking the frame for
/// page `i` from `source(i)`.
///
/// The operation is transactional: if any page fails to map (or
/// `source` runs dry, reported as out-of-memory), every page
/// already mapped by this call is unmapped again, with owned
/// frames released back to `frames`, before the error is
/// returned.
///
pub fn map_range<M>(
    table: &mut dyn ArchPageTable,
    va: VirtAddr,
    npages: usize,
    flags: PageTableFlags,
    mut source: impl FnMut(usize) -> Option<PageSource>,
    frames: &mut M,
) -> Result<(), MapError>
where
    M: FrameAllocator + FrameDeallocator,
{
    for i in 0..npages {
        let page_va = va + i * memory::PAGE_SIZE;
        let result = match source(i) {
            Some(page) => table.map(page, page_va, flags, frames),
            None => Err(MapError::OutOfMemory),
        };

        if let Err(err) = result {
            for done in 0..i {
                let _ = table.unmap(va + done * memory::PAGE_SIZE, true, frames);
            }

            return Err(err);
        }
    }

    Ok(())
}

/// Maps `npages` fresh zeroed frames starting at `va`, allocating
/// both the frames and any intermediate tables from `frames`.
///
/// Transactional in the same way as [`map_range`].
///
pub fn map_anonymous_range<M>(
    table: &mut dyn ArchPageTable,
    va: VirtAddr,
    npages: usize,
    flags: PageTableFlags,
    frames: &mut M,
) -> Result<(), MapError>
where
    M: FrameAllocator + FrameDeallocator,
{
    for i in 0..npages {
        let page_va = va + i * memory::PAGE_SIZE;
        let result = match frames.allocate_frame() {
            Some(frame) => {
                zero_frame(frame);
                let mapped = table.map(PageSource::Owned(frame), page_va, flags, frames);
                if mapped.is_err() {
                    unsafe { frames.deallocate_frame(frame) };
                }
                mapped
            }
            None => Err(MapError::OutOfMemory),
        };

        if let Err(err) = result {
            for done in 0..i {
                let _ = table.unmap(va + done * memory::PAGE_SIZE, true, frames);
            }

            return Err(err);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use super::{
        map_range, set_arch_hooks, ArchHooks, ArchPageTable, MapError, PageSource, RiscvMode,
        RiscvPageTable, UnmapError, WalkError, X86PageTable,
    };
    use core::sync::atomic::{AtomicUsize, Ordering};
    use memory::testing::HeapFrameAllocator;
    use memory::{
        FrameAllocator, FrameDeallocator, PageTableFlags, PhysFrame, VirtAddr, PAGE_SIZE,
    };

    fn user_flags() -> PageTableFlags {
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE
    }

    #[test]
    fn x86_map_translate_unmap() {
        let mut frames = HeapFrameAllocator::new();
        let mut table = X86PageTable::create_empty(&mut frames, None).unwrap();

        let frame = frames.allocate_frame().unwrap();
        let va = VirtAddr::new(0x40_0000);
        table
            .map(PageSource::Owned(frame), va, user_flags(), &mut frames)
            .unwrap();

        // Mapping again must be refused.
        let dup = frames.allocate_frame().unwrap();
        assert_eq!(
            table.map(PageSource::Owned(dup), va, user_flags(), &mut frames),
            Err(MapError::AlreadyMapped)
        );

        assert_eq!(
            table.phys_addr_of(va + 0x123),
            Ok(frame.start_address() + 0x123)
        );
        assert_eq!(
            table.phys_addr_of(VirtAddr::new(0x50_0000)),
            Err(WalkError::NotMapped)
        );

        let info = table.page_info(va);
        assert!(info.present && info.user && info.writable);
        assert!(!info.no_free);
        assert_eq!(info.frame, Some(frame));

        // Unmapping releases the owned frame.
        let live = frames.live_frames();
        table.unmap(va, true, &mut frames).unwrap();
        assert_eq!(frames.live_frames(), live - 1);
        assert_eq!(
            table.unmap(va, true, &mut frames),
            Err(UnmapError::NotMapped)
        );
        assert!(!table.page_info(va).present);

        unsafe { frames.deallocate_frame(dup) };
        table.destroy(&mut frames);
        assert_eq!(frames.live_frames(), 0);
    }

    #[test]
    fn x86_shared_mappings_keep_their_frame() {
        let mut frames = HeapFrameAllocator::new();
        let mut table = X86PageTable::create_empty(&mut frames, None).unwrap();

        let frame = frames.allocate_frame().unwrap();
        let va = VirtAddr::new(0x40_0000);
        table
            .map(PageSource::Shared(frame), va, user_flags(), &mut frames)
            .unwrap();
        assert!(table.page_info(va).no_free);

        // Unmap with freeing requested: the borrowed frame must
        // survive.
        let live = frames.live_frames();
        table.unmap(va, true, &mut frames).unwrap();
        assert_eq!(frames.live_frames(), live);

        unsafe { frames.deallocate_frame(frame) };
        table.destroy(&mut frames);
        assert_eq!(frames.live_frames(), 0);
    }

    #[test]
    fn x86_kernel_half_is_shared_with_clones() {
        let mut frames = HeapFrameAllocator::new();
        let mut kernel = X86PageTable::create_empty(&mut frames, None).unwrap();

        // A well-known kernel-half mapping in the template.
        let kva = VirtAddr::new(0xffff_8000_0000_0000);
        let kframe = frames.allocate_frame().unwrap();
        kernel
            .map(
                PageSource::Owned(kframe),
                kva,
                PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
                &mut frames,
            )
            .unwrap();

        // The clone resolves the kernel-half address through the
        // shared tables.
        let mut clone =
            X86PageTable::create_empty(&mut frames, Some(kernel.root_frame())).unwrap();
        assert_eq!(clone.phys_addr_of(kva), Ok(kframe.start_address()));

        // A user mapping in the clone is invisible to the
        // template.
        let uva = VirtAddr::new(0x40_0000);
        let uframe = frames.allocate_frame().unwrap();
        clone
            .map(PageSource::Owned(uframe), uva, user_flags(), &mut frames)
            .unwrap();
        assert_eq!(kernel.phys_addr_of(uva), Err(WalkError::NotMapped));

        // Destroying the clone only touches its user half: the
        // template's kernel mapping survives.
        clone.destroy(&mut frames);
        assert_eq!(kernel.phys_addr_of(kva), Ok(kframe.start_address()));
        kernel.destroy(&mut frames);
    }

    #[test]
    fn riscv_modes() {
        assert_eq!(RiscvMode::Sv39.levels(), 3);
        assert_eq!(RiscvMode::Sv48.levels(), 4);
        assert_eq!(RiscvMode::Sv57.levels(), 5);

        for mode in [RiscvMode::Sv39, RiscvMode::Sv48, RiscvMode::Sv57] {
            let mut frames = HeapFrameAllocator::new();
            let mut table = RiscvPageTable::create_empty(&mut frames, None, mode).unwrap();

            let frame = frames.allocate_frame().unwrap();
            let va = VirtAddr::new(0x40_0000);
            table
                .map(PageSource::Owned(frame), va, user_flags(), &mut frames)
                .unwrap();

            assert_eq!(
                table.phys_addr_of(va + 0x42),
                Ok(frame.start_address() + 0x42)
            );
            let info = table.page_info(va);
            assert!(info.present && info.user && info.writable);
            assert_eq!(info.frame, Some(frame));

            table.unmap(va, true, &mut frames).unwrap();
            assert_eq!(table.phys_addr_of(va), Err(WalkError::NotMapped));

            table.destroy(&mut frames);
            assert_eq!(frames.live_frames(), 0);
        }
    }

    // A frame allocator that fails after a fixed number of
    // allocations, to exercise error paths.
    struct FailAfter<'alloc> {
        inner: &'alloc mut HeapFrameAllocator,
        remaining: usize,
    }

    unsafe impl FrameAllocator for FailAfter<'_> {
        fn allocate_frame(&mut self) -> Option<PhysFrame> {
            if self.remaining == 0 {
                return None;
            }

            self.remaining -= 1;
            self.inner.allocate_frame()
        }
    }

    impl FrameDeallocator for FailAfter<'_> {
        unsafe fn deallocate_frame(&mut self, frame: PhysFrame) {
            self.inner.deallocate_frame(frame);
        }
    }

    #[test]
    fn map_range_is_transactional() {
        let mut frames = HeapFrameAllocator::new();
        let mut table = X86PageTable::create_empty(&mut frames, None).unwrap();

        // Pre-allocate the frames to be mapped.
        let pages: alloc::vec::Vec<PhysFrame> =
            (0..8).map(|_| frames.allocate_frame().unwrap()).collect();
        let baseline = frames.live_frames();

        // Let the walk allocate its intermediate tables for the
        // first pages, then fail. Three tables get the walk to
        // the first leaf; the pages all share one level-0 table,
        // so later maps need no further allocation. Force a
        // failure midway with a source that runs dry instead.
        let source_pages = pages.clone();
        let result = {
            let mut limited = FailAfter {
                inner: &mut frames,
                remaining: 3,
            };
            map_range(
                &mut table,
                VirtAddr::new(0x40_0000),
                8,
                user_flags(),
                |i| {
                    if i < 5 {
                        Some(PageSource::Owned(source_pages[i]))
                    } else {
                        None
                    }
                },
                &mut limited,
            )
        };

        assert_eq!(result, Err(MapError::OutOfMemory));

        // Nothing is left mapped.
        for i in 0..8 {
            assert!(!table
                .page_info(VirtAddr::new(0x40_0000) + i * PAGE_SIZE)
                .present);
        }

        // The five mapped-then-rolled-back frames were released,
        // and three intermediate tables were allocated.
        assert_eq!(frames.live_frames(), baseline + 3 - 5);

        for frame in pages[5..].iter() {
            unsafe { frames.deallocate_frame(*frame) };
        }

        table.destroy(&mut frames);
        assert_eq!(frames.live_frames(), 0);
    }

    #[test]
    fn shootdown_signalling() {
        static TEST_CPU: AtomicUsize = AtomicUsize::new(0);
        static FLUSHES: AtomicUsize = AtomicUsize::new(0);
        static SHOOTDOWNS: AtomicUsize = AtomicUsize::new(0);

        fn current_cpu() -> usize {
            TEST_CPU.load(Ordering::Relaxed)
        }
        fn load_root(_frame: PhysFrame) {}
        fn flush_page(_addr: VirtAddr) {
            FLUSHES.fetch_add(1, Ordering::Relaxed);
        }
        fn flush_all() {}
        fn signal_shootdown(_cpu: usize) {
            SHOOTDOWNS.fetch_add(1, Ordering::Relaxed);
        }

        set_arch_hooks(ArchHooks {
            current_cpu,
            load_root,
            flush_page,
            flush_all,
            signal_shootdown,
        });

        let mut frames = HeapFrameAllocator::new();
        let table = X86PageTable::create_empty(&mut frames, None).unwrap();

        // Active on CPUs 0 and 1.
        TEST_CPU.store(0, Ordering::Relaxed);
        table.activate();
        TEST_CPU.store(1, Ordering::Relaxed);
        table.activate();
        assert_eq!(table.active_count(), 2);

        // Invalidating from CPU 0 flushes locally and signals
        // CPU 1.
        TEST_CPU.store(0, Ordering::Relaxed);
        let flushes = FLUSHES.load(Ordering::Relaxed);
        let shootdowns = SHOOTDOWNS.load(Ordering::Relaxed);
        table.invalidate_tlb(VirtAddr::new(0x40_0000), 2);
        assert_eq!(FLUSHES.load(Ordering::Relaxed), flushes + 2);
        assert_eq!(SHOOTDOWNS.load(Ordering::Relaxed), shootdowns + 1);

        TEST_CPU.store(1, Ordering::Relaxed);
        table.deactivate();
        TEST_CPU.store(0, Ordering::Relaxed);
        table.deactivate();
        assert_eq!(table.active_count(), 0);
    }
}
