// Copyright 2026 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The architecture-neutral description of a page mapping.

use bitflags::bitflags;

bitflags! {
    /// The flags in a page mapping.
    ///
    /// Each arch page table translates these into its own entry
    /// layout. The three AVL bits are ignored by the hardware on
    /// every supported architecture and carry kernel bookkeeping;
    /// two of them have assigned meanings here.
    ///
    pub struct PageTableFlags: u64 {
        /// Indicates that the referenced page table or
        /// physical frame is mapped and usable.
        const PRESENT = 1 << 0;

        /// Indicates that the referenced page table or
        /// physical frame is writable.
        const WRITABLE = 1 << 1;

        /// Indicates that accesses from user mode are
        /// allowed.
        const USER_ACCESSIBLE = 1 << 2;

        /// Indicates that the caching behaviour for this
        /// memory is write-through. Otherwise, it is
        /// write-back.
        const WRITE_THROUGH = 1 << 3;

        /// Indicates that the memory should not be cached.
        const NO_CACHE = 1 << 4;

        /// Indicates that the referenced page table or
        /// physical frame has been read since this bit was
        /// last unset.
        const ACCESSED = 1 << 5;

        /// Indicates that the referenced page table or
        /// physical frame has been written since this bit
        /// was last unset.
        const DIRTY = 1 << 6;

        /// Indicates that this references a huge physical
        /// frame, rather than a page table.
        const HUGE_PAGE = 1 << 7;

        /// Indicates that this mapping is not flushed from
        /// the TLB when an address space change takes place.
        const GLOBAL = 1 << 8;

        /// Kernel bookkeeping: the mapped frame is not owned
        /// by this mapping and must not be freed when the
        /// mapping is cleared.
        const NO_FREE = 1 << 9;

        /// Kernel bookkeeping: the mapped frame is shared
        /// copy-on-write and must be copied before the first
        /// write.
        const COPY_ON_WRITE = 1 << 10;

        /// The third kernel bookkeeping bit, unassigned.
        const AVL2 = 1 << 11;

        /// Indicates that the referenced memory cannot be
        /// used for instruction fetches.
        const NO_EXECUTE = 1 << 63;
    }
}

impl PageTableFlags {
    /// Returns whether the `PRESENT` bit is set.
    ///
    #[inline]
    pub const fn present(&self) -> bool {
        self.bits() & Self::PRESENT.bits() != 0
    }
}

#[cfg(test)]
mod tests {
    use super::PageTableFlags;

    #[test]
    fn avl_bits_do_not_collide() {
        let hardware = PageTableFlags::PRESENT
            | PageTableFlags::WRITABLE
            | PageTableFlags::USER_ACCESSIBLE
            | PageTableFlags::WRITE_THROUGH
            | PageTableFlags::NO_CACHE
            | PageTableFlags::ACCESSED
            | PageTableFlags::DIRTY
            | PageTableFlags::HUGE_PAGE
            | PageTableFlags::GLOBAL
            | PageTableFlags::NO_EXECUTE;
        let bookkeeping =
            PageTableFlags::NO_FREE | PageTableFlags::COPY_ON_WRITE | PageTableFlags::AVL2;

        assert!((hardware & bookkeeping).is_empty());
        assert!(PageTableFlags::PRESENT.present());
        assert!(!PageTableFlags::WRITABLE.present());
    }
}
