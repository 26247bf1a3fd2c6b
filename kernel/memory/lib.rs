// Copyright 2026 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Contains types and functionality to represent physical and virtual memory.
//!
//! This crate provides the core types shared by every memory subsystem.
//! From most basic to most sophisticated, the physical memory types are:
//!
//! - [`PhysAddr`]: An address in the 52-bit physical address space.
//! - [`PhysFrame`]: A 4 KiB frame of physical memory.
//! - [`PhysFrameRange`]: A sequence of contiguous physical memory frames.
//!
//! The corresponding virtual memory types are:
//!
//! - [`VirtAddr`]: A canonical address in the 48-bit virtual address space.
//! - [`VirtPage`]: A 4 KiB page of virtual memory.
//! - [`VirtPageRange`]: A sequence of contiguous virtual memory pages.
//! - [`VirtAddrRange`]: An arbitrary sequence of contiguous virtual addresses.
//!
//! [`PageTableFlags`] is the architecture-neutral description of a page
//! mapping, which each arch page table translates into its own entry
//! layout. The [`FrameAllocator`] and [`FrameDeallocator`] traits
//! abstract the management of physical memory.
//!
//! All physical memory is reachable through the higher-half direct map
//! once the bootloader's offset has been installed with
//! [`set_hhdm_offset`]; [`phys_to_virt_addr`] performs the translation.
//! Before installation the offset is zero, which is also the identity
//! mapping the unit tests rely on: the [`testing`] allocator hands out
//! heap-backed frames whose physical address equals their pointer.
//!
//! The [`constants`] module describes the fixed virtual memory layout.

#![no_std]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

extern crate alloc;

pub mod constants;
mod flags;
mod phys;
pub mod testing;
mod virt;

pub use crate::flags::PageTableFlags;
pub use crate::phys::{InvalidPhysAddr, PhysAddr, PhysFrame, PhysFrameRange};
pub use crate::virt::{InvalidVirtAddr, VirtAddr, VirtAddrRange, VirtPage, VirtPageRange};

use core::sync::atomic::{AtomicUsize, Ordering};

pub use align::PAGE_SIZE;

static HHDM_OFFSET: AtomicUsize = AtomicUsize::new(0);

/// Installs the higher-half direct map offset provided by the
/// bootloader.
///
/// Called once, before the first frame of physical memory is
/// accessed through [`phys_to_virt_addr`].
///
pub fn set_hhdm_offset(offset: VirtAddr) {
    HHDM_OFFSET.store(offset.as_usize(), Ordering::SeqCst);
}

/// Returns the installed higher-half direct map offset.
///
pub fn hhdm_offset() -> usize {
    HHDM_OFFSET.load(Ordering::Relaxed)
}

/// Returns a virtual address through which the given physical
/// address can be accessed.
///
/// This uses the mapping of all physical memory at the offset
/// installed with [`set_hhdm_offset`].
///
/// # Panics
///
/// `phys_to_virt_addr` panics if the sum does not form a valid
/// virtual address.
///
pub fn phys_to_virt_addr(phys: PhysAddr) -> VirtAddr {
    match VirtAddr::try_new(hhdm_offset() + phys.as_usize()) {
        Ok(addr) => addr,
        Err(_) => panic!("physical address {:p} is outside the direct map", phys),
    }
}

/// A trait for types that can allocate a frame of physical
/// memory.
///
/// # Safety
///
/// Each implementation must only return frames that are unused
/// and exclusively owned by the caller.
///
pub unsafe trait FrameAllocator {
    /// Allocate a 4 KiB physical frame and return it, if
    /// possible.
    ///
    fn allocate_frame(&mut self) -> Option<PhysFrame>;
}

/// A trait for types that can deallocate a frame of physical
/// memory.
///
pub trait FrameDeallocator {
    /// Deallocate the given physical frame of memory.
    ///
    /// # Safety
    ///
    /// The caller must ensure that the given frame is unused.
    ///
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame);
}
