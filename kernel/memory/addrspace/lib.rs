// Copyright 2026 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Address spaces: arch page tables plus the regions that give
//! their addresses meaning.
//!
//! An [`AddressSpace`] owns an arch page table, an ordered map of
//! non-overlapping [`Region`]s, the set of memory objects those
//! regions pin, and the wait set of tasks blocked on pages that are
//! still being fetched. All mutation happens under the space's one
//! spinlock, and every compound operation (create, delete, transfer,
//! clone, truncate) is atomic with respect to it.
//!
//! Nothing here blocks or wakes a task directly: operations that make
//! tasks runnable again *return* the ids of the tasks to wake, and
//! [`AddressSpace::handle_fault`] *returns* whether the caller must
//! block the faulting task (and which pager to ask). Task ids are
//! plain numbers at this layer.
//!
//! Address spaces are registered in the global [`ADDRESS_SPACES`]
//! index and referenced by id.

#![no_std]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

extern crate alloc;

mod region;
mod space;

pub use crate::region::{Access, Region, RegionKind};
pub use crate::space::{
    transfer_region, AddressSpace, FaultOutcome, PagerRequest, ADDRESS_SPACES,
};

/// Uniquely identifies an address space throughout the kernel.
///
pub type AddressSpaceId = u64;

/// Uniquely identifies a region within the kernel.
///
pub type RegionId = u64;

/// Identifies a task in a wait set. Tasks are opaque ids at
/// this layer.
///
pub type TaskId = u64;
