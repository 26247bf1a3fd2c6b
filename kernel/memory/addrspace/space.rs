// Copyright 2026 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The address space aggregate and its atomic operations.

use crate::region::{copy_frame, FaultResult};
use crate::{Access, AddressSpaceId, Region, RegionId, RegionKind, TaskId};
use abi::Error;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use lazy_static::lazy_static;
use memobj::{MemObjectId, MemoryObject};
use memory::constants::USERSPACE;
use memory::{FrameAllocator, FrameDeallocator, PhysAddr, PhysFrame, VirtAddr, PAGE_SIZE};
use paging::{ArchPageTable, PageInfo, PageSource};
use spin::{lock, Mutex};

lazy_static! {
    /// The global address space index.
    ///
    pub static ref ADDRESS_SPACES: Mutex<BTreeMap<AddressSpaceId, Arc<AddressSpace>>> =
        Mutex::new(BTreeMap::new());
}

fn next_space_id() -> AddressSpaceId {
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

// A memory object pinned by this space, with the strongest
// access any referencing region has and the number of regions
// referencing it.
struct PinnedObject {
    object: Arc<MemoryObject>,
    max_access: Access,
    regions: usize,
}

struct SpaceState {
    table: Box<dyn ArchPageTable>,

    // Regions keyed by start address. Never overlapping.
    regions: BTreeMap<usize, Region>,

    // The objects the regions reference, pinned for as long as
    // a reference remains.
    pinned: BTreeMap<MemObjectId, PinnedObject>,

    // Tasks blocked waiting for a page at an address.
    blocked: Vec<(usize, TaskId)>,
}

/// A request the caller must forward to a memory object's
/// pager before blocking the faulting task.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PagerRequest {
    /// The pager's port.
    pub port: u64,

    /// The faulting object.
    pub object: MemObjectId,

    /// The page-aligned object offset to request.
    pub offset: u64,
}

/// What [`AddressSpace::handle_fault`] concluded.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The page is mapped; resume the task.
    Mapped,

    /// The page is on its way. The task has been recorded in
    /// the space's wait set; the caller must block it on the
    /// faulting address, first forwarding `pager` if present.
    Wait {
        /// The pager request to send, if this fault is the
        /// first for the page.
        pager: Option<PagerRequest>,
    },
}

/// An arch page table plus the regions, object pins and page
/// wait set that give it meaning.
///
pub struct AddressSpace {
    id: AddressSpaceId,
    state: Mutex<SpaceState>,
}

impl core::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpace").field("id", &self.id).finish()
    }
}

impl AddressSpace {
    /// Wraps the given arch table in a new address space and
    /// registers it in the global index.
    ///
    pub fn new(table: Box<dyn ArchPageTable>) -> Arc<AddressSpace> {
        let space = Arc::new(AddressSpace {
            id: next_space_id(),
            state: Mutex::new(SpaceState {
                table,
                regions: BTreeMap::new(),
                pinned: BTreeMap::new(),
                blocked: Vec::new(),
            }),
        });

        lock!(ADDRESS_SPACES).insert(space.id, space.clone());
        space
    }

    /// Returns the address space with the given id, or `None`.
    ///
    pub fn get(id: AddressSpaceId) -> Option<Arc<AddressSpace>> {
        lock!(ADDRESS_SPACES).get(&id).cloned()
    }

    /// Removes the space from the global index.
    ///
    pub fn unregister(id: AddressSpaceId) -> Option<Arc<AddressSpace>> {
        lock!(ADDRESS_SPACES).remove(&id)
    }

    /// Returns the space's unique id.
    ///
    pub fn id(&self) -> AddressSpaceId {
        self.id
    }

    /// Returns the physical frame of the space's root table.
    ///
    pub fn root_frame(&self) -> PhysFrame {
        lock!(self.state).table.root_frame()
    }

    /// Loads the space's table on the executing CPU.
    ///
    pub fn activate(&self) {
        lock!(self.state).table.activate();
    }

    /// Notes that the executing CPU stopped using the space.
    ///
    pub fn deactivate(&self) {
        lock!(self.state).table.deactivate();
    }

    /// Creates a region of `size` bytes.
    ///
    /// With `placement`, the region sits exactly there, failing
    /// with [`Error::RegionOccupied`] on overlap; otherwise the
    /// lowest free userspace range is used, failing with
    /// [`Error::NoFreeRegion`] when none fits. Returns the
    /// region's id and start address.
    ///
    pub fn create_region(
        &self,
        placement: Option<VirtAddr>,
        size: usize,
        name: String,
        access: Access,
        kind: RegionKind,
    ) -> Result<(RegionId, VirtAddr), Error> {
        if size == 0 || size % PAGE_SIZE != 0 {
            return Err(Error::InvalidArgument);
        }

        match &kind {
            RegionKind::Anonymous { .. } => {}
            RegionKind::PhysMapped { phys_start } => {
                if phys_start.frame_offset() != 0 {
                    return Err(Error::InvalidArgument);
                }
            }
            RegionKind::ObjectBacked {
                object,
                object_offset,
                window_offset,
                window_size,
                cow,
            } => {
                // The window alignment invariant: both offsets
                // page-aligned, so a region page maps exactly
                // one object page.
                if object_offset % PAGE_SIZE as u64 != 0 || window_offset % PAGE_SIZE != 0 {
                    return Err(Error::InvalidArgument);
                }

                if object_offset + window_size > object.size_bytes() {
                    return Err(Error::OutOfRange);
                }

                if !*cow && (*window_offset != 0 || *window_size != size as u64) {
                    // A shared window must cover the region
                    // exactly.
                    return Err(Error::InvalidArgument);
                }
            }
        }

        let mut state = lock!(self.state);

        let start = match placement {
            Some(start) => {
                if start.page_offset() != 0 {
                    return Err(Error::InvalidArgument);
                }

                let last = start.checked_add(size - 1).ok_or(Error::OutOfRange)?;
                if !USERSPACE.contains_range(start, last) {
                    return Err(Error::OutOfRange);
                }

                if !range_is_free(&state, start.as_usize(), size) {
                    return Err(Error::RegionOccupied);
                }

                start
            }
            None => find_free_range(&state, size).ok_or(Error::NoFreeRegion)?,
        };

        if let RegionKind::ObjectBacked { object, .. } = &kind {
            pin_object(&mut state, self.id, object, access);
        }

        let region = Region::new(start, size, name, access, kind);
        let id = region.id();
        state.regions.insert(start.as_usize(), region);
        Ok((id, start))
    }

    /// Resolves a page fault at `va` for an access of kind
    /// `access` by task `tid`.
    ///
    /// On [`FaultOutcome::Wait`] the task has been recorded in
    /// the wait set and the caller must block it.
    ///
    pub fn handle_fault<M>(
        &self,
        va: VirtAddr,
        access: Access,
        tid: TaskId,
        frames: &mut M,
    ) -> Result<FaultOutcome, Error>
    where
        M: FrameAllocator + FrameDeallocator,
    {
        let va_page = va.align_down_page();
        let mut guard = lock!(self.state);
        let state = &mut *guard;

        let region = match state.regions.range(..=va.as_usize()).next_back() {
            Some((_, region)) if region.contains(va) => region,
            _ => return Err(Error::PageNotAllocated),
        };

        if !region.allows(access) {
            return Err(Error::ProtectionViolation);
        }

        // A racing fault may have resolved the page already.
        if state.table.page_info(va_page).present {
            return Ok(FaultOutcome::Mapped);
        }

        let result = region.fault_in(&mut *state.table, va_page, frames)?;
        match result {
            FaultResult::Mapped => Ok(FaultOutcome::Mapped),
            FaultResult::WaitForPager => {
                state.blocked.push((va_page.as_usize(), tid));
                Ok(FaultOutcome::Wait { pager: None })
            }
            FaultResult::AskPager {
                port,
                object,
                offset,
            } => {
                state.blocked.push((va_page.as_usize(), tid));
                Ok(FaultOutcome::Wait {
                    pager: Some(PagerRequest {
                        port,
                        object,
                        offset,
                    }),
                })
            }
        }
    }

    /// Translates `va` through the space's table.
    ///
    pub fn phys_addr_of(&self, va: VirtAddr) -> Result<PhysAddr, Error> {
        lock!(self.state)
            .table
            .phys_addr_of(va)
            .map_err(|_| Error::PageNotPresent)
    }

    /// Returns what the leaf entry at `va` records.
    ///
    pub fn page_info(&self, va: VirtAddr) -> PageInfo {
        lock!(self.state).table.page_info(va)
    }

    /// Returns the number of regions in the space.
    ///
    pub fn region_count(&self) -> usize {
        lock!(self.state).regions.len()
    }

    /// Deletes the region containing `addr`, invalidating its
    /// range.
    ///
    /// Returns the tasks that were blocked on pages of the
    /// region; the caller must wake them, and their faults
    /// resolve to errors on restart.
    ///
    pub fn delete_region<M>(&self, addr: VirtAddr, frames: &mut M) -> Result<Vec<TaskId>, Error>
    where
        M: FrameAllocator + FrameDeallocator,
    {
        let mut guard = lock!(self.state);
        let state = &mut *guard;

        let start = match state.regions.range(..=addr.as_usize()).next_back() {
            Some((&start, region)) if region.contains(addr) => start,
            _ => return Err(Error::NoSuchObject),
        };

        let region = state.regions.remove(&start).expect("region key just found");
        let woken = remove_region_state(state, self.id, &region, frames);
        Ok(woken)
    }

    /// Clones the space: a fork of every region into a fresh
    /// arch table.
    ///
    /// Private and copy-on-touch pages are deep-copied, so
    /// writes after the clone are invisible across it; physical
    /// windows alias the same physical range. Spaces holding a
    /// shared (non-copy) object window cannot be cloned and
    /// fail with [`Error::NotSupported`], leaving everything
    /// untouched.
    ///
    pub fn clone_space<M>(
        &self,
        new_table: Box<dyn ArchPageTable>,
        frames: &mut M,
    ) -> Result<Arc<AddressSpace>, Error>
    where
        M: FrameAllocator + FrameDeallocator,
    {
        let guard = lock!(self.state);
        let new_id = next_space_id();
        let mut new_state = SpaceState {
            table: new_table,
            regions: BTreeMap::new(),
            pinned: BTreeMap::new(),
            blocked: Vec::new(),
        };

        let mut failure = None;
        'regions: for region in guard.regions.values() {
            if let RegionKind::ObjectBacked { cow: false, .. } = region.kind() {
                failure = Some(Error::NotSupported);
                break;
            }

            let copy = Region::new(
                region.start(),
                region.size(),
                String::from(region.name()),
                region.access(),
                region.kind().clone(),
            );

            if let RegionKind::ObjectBacked { object, .. } = copy.kind() {
                pin_object(&mut new_state, new_id, object, copy.access());
            }

            // Insert before copying pages, so a failure midway
            // is rolled back along with the finished regions.
            let flags = copy.page_flags();
            let start = copy.start();
            let pages = copy.size() / PAGE_SIZE;
            new_state.regions.insert(start.as_usize(), copy);

            // Replicate the materialised pages.
            for i in 0..pages {
                let va = start + i * PAGE_SIZE;
                let info = guard.table.page_info(va);
                if !info.present {
                    continue;
                }

                let frame = info.frame.expect("present mappings carry a frame");
                let source = if info.no_free {
                    // Aliased physical memory: share it.
                    PageSource::Shared(frame)
                } else {
                    // Private content: deep-copy it.
                    match frames.allocate_frame() {
                        Some(new_frame) => {
                            copy_frame(new_frame, frame);
                            PageSource::Owned(new_frame)
                        }
                        None => {
                            failure = Some(Error::OutOfMemory);
                            break 'regions;
                        }
                    }
                };

                if new_state.table.map(source, va, flags, frames).is_err() {
                    if let PageSource::Owned(new_frame) = source {
                        unsafe { frames.deallocate_frame(new_frame) };
                    }

                    failure = Some(Error::OutOfMemory);
                    break 'regions;
                }
            }
        }

        if let Some(err) = failure {
            // Roll back: unpin and free everything the partial
            // clone accumulated.
            let regions: Vec<Region> = {
                let mut taken = BTreeMap::new();
                core::mem::swap(&mut taken, &mut new_state.regions);
                taken.into_iter().map(|(_, region)| region).collect()
            };
            for region in regions.iter() {
                remove_region_state(&mut new_state, new_id, region, frames);
            }

            new_state.table.destroy(frames);
            return Err(err);
        }

        let space = Arc::new(AddressSpace {
            id: new_id,
            state: Mutex::new(new_state),
        });
        lock!(ADDRESS_SPACES).insert(new_id, space.clone());
        Ok(space)
    }

    /// Truncates every region referencing `object_id` so that no
    /// page past `new_size_bytes` of the object stays mapped or
    /// reachable.
    ///
    /// Returns the tasks that were blocked on removed pages; the
    /// caller must wake them into their error paths.
    ///
    pub fn truncate_for_object<M>(
        &self,
        object_id: MemObjectId,
        new_size_bytes: u64,
        frames: &mut M,
    ) -> Vec<TaskId>
    where
        M: FrameAllocator + FrameDeallocator,
    {
        let mut guard = lock!(self.state);
        let state = &mut *guard;

        let mut woken = Vec::new();
        let mut emptied = Vec::new();
        let mut truncated: Vec<(usize, usize)> = Vec::new();

        for (&start, region) in state.regions.iter() {
            let (object_offset, window_offset, window_size) = match region.kind() {
                RegionKind::ObjectBacked {
                    object,
                    object_offset,
                    window_offset,
                    window_size,
                    ..
                } if object.id() == object_id => (*object_offset, *window_offset, *window_size),
                _ => continue,
            };

            if new_size_bytes >= object_offset + window_size {
                // The whole window survives.
                continue;
            }

            // The first region offset whose object page is gone.
            let keep = if new_size_bytes <= object_offset {
                window_offset
            } else {
                window_offset + (new_size_bytes - object_offset) as usize
            };

            if keep < region.size() {
                truncated.push((start, keep));
            }
        }

        for (start, keep) in truncated {
            let region = state.regions.get(&start).expect("key collected above");
            let unmap_from = region.start() + keep;
            let pages = (region.size() - keep) / PAGE_SIZE;
            for i in 0..pages {
                let _ = state
                    .table
                    .unmap(unmap_from + i * PAGE_SIZE, true, frames);
            }

            state.table.invalidate_tlb(unmap_from, pages);
            woken.extend(take_waiters(state, unmap_from.as_usize(), pages * PAGE_SIZE));

            if keep == 0 {
                emptied.push(start);
            } else {
                state
                    .regions
                    .get_mut(&start)
                    .expect("key collected above")
                    .set_size(keep);
            }
        }

        for start in emptied {
            let region = state.regions.remove(&start).expect("key collected above");
            unpin_object_of(state, self.id, &region);
        }

        woken
    }

    /// Removes and returns the tasks waiting for the given page
    /// of `object_id` to arrive, resolving the page to virtual
    /// addresses through every referencing region.
    ///
    pub fn take_waiters_for_object_page(
        &self,
        object_id: MemObjectId,
        offset: u64,
    ) -> Vec<TaskId> {
        let mut guard = lock!(self.state);
        let state = &mut *guard;

        let mut addresses = Vec::new();
        for region in state.regions.values() {
            if let RegionKind::ObjectBacked {
                object,
                object_offset,
                window_offset,
                window_size,
                ..
            } = region.kind()
            {
                if object.id() != object_id
                    || offset < *object_offset
                    || offset >= *object_offset + *window_size
                {
                    continue;
                }

                let delta = (offset - *object_offset) as usize + *window_offset;
                addresses.push(region.start().as_usize() + delta);
            }
        }

        let mut woken = Vec::new();
        state.blocked.retain(|&(va, tid)| {
            if addresses.contains(&va) {
                woken.push(tid);
                false
            } else {
                true
            }
        });

        woken
    }

    /// Tears the space down: every region is removed, every
    /// waiter woken, and the arch table destroyed. The space
    /// must already be unregistered and inactive.
    ///
    pub fn tear_down<M>(&self, frames: &mut M) -> Vec<TaskId>
    where
        M: FrameAllocator + FrameDeallocator,
    {
        let mut guard = lock!(self.state);
        let state = &mut *guard;

        let regions: Vec<Region> = {
            let mut taken = BTreeMap::new();
            core::mem::swap(&mut taken, &mut state.regions);
            taken.into_iter().map(|(_, region)| region).collect()
        };

        let mut woken = Vec::new();
        for region in regions.iter() {
            woken.extend(remove_region_state(state, self.id, region, frames));
        }

        state.table.destroy(frames);
        woken
    }
}

/// Atomically moves the region containing `addr` from `src` to
/// `dst`, rebasing it at `placement` (or the first free range)
/// with access `new_access`.
///
/// The mappings move with the region: page contents are neither
/// copied nor refetched. Returns the region's new start address
/// and the tasks that were blocked on its pages in `src`.
///
pub fn transfer_region<M>(
    src: &Arc<AddressSpace>,
    dst: &Arc<AddressSpace>,
    addr: VirtAddr,
    placement: Option<VirtAddr>,
    new_access: Access,
    frames: &mut M,
) -> Result<(VirtAddr, Vec<TaskId>), Error>
where
    M: FrameAllocator + FrameDeallocator,
{
    if src.id == dst.id {
        return Err(Error::InvalidArgument);
    }

    // Two-space operations take both locks in id order.
    let (mut src_guard, mut dst_guard) = if src.id < dst.id {
        let first = lock!(src.state);
        let second = lock!(dst.state);
        (first, second)
    } else {
        let second = lock!(dst.state);
        let first = lock!(src.state);
        (first, second)
    };

    let src_state = &mut *src_guard;
    let dst_state = &mut *dst_guard;

    let start = match src_state.regions.range(..=addr.as_usize()).next_back() {
        Some((&start, region)) if region.contains(addr) => start,
        _ => return Err(Error::NoSuchObject),
    };

    let size = src_state.regions[&start].size();
    let new_start = match placement {
        Some(new_start) => {
            if new_start.page_offset() != 0 {
                return Err(Error::InvalidArgument);
            }

            let last = new_start.checked_add(size - 1).ok_or(Error::OutOfRange)?;
            if !USERSPACE.contains_range(new_start, last) {
                return Err(Error::OutOfRange);
            }

            if !range_is_free(dst_state, new_start.as_usize(), size) {
                return Err(Error::RegionOccupied);
            }

            new_start
        }
        None => find_free_range(dst_state, size).ok_or(Error::NoFreeRegion)?,
    };

    let mut region = src_state.regions.remove(&start).expect("key just found");

    // Move the live mappings across.
    let pages = size / PAGE_SIZE;
    let old_start = region.start();
    region.relocate(new_start, new_access);
    for i in 0..pages {
        let old_va = old_start + i * PAGE_SIZE;
        let info = src_state.table.page_info(old_va);
        if !info.present {
            continue;
        }

        let frame = info.frame.expect("present mappings carry a frame");
        let source = if info.no_free {
            PageSource::Shared(frame)
        } else {
            PageSource::Owned(frame)
        };

        let _ = src_state.table.unmap(old_va, false, frames);
        let _ = dst_state
            .table
            .map(source, new_start + i * PAGE_SIZE, region.page_flags(), frames);
    }

    src_state.table.invalidate_tlb(old_start, pages);

    // Re-home the object pin and wake the waiters left behind.
    if let RegionKind::ObjectBacked { object, .. } = region.kind() {
        let object = object.clone();
        pin_object(dst_state, dst.id, &object, region.access());
        unpin_object_by_id(src_state, src.id, object.id());
    }

    let woken = take_waiters(src_state, old_start.as_usize(), size);
    dst_state.regions.insert(new_start.as_usize(), region);
    Ok((new_start, woken))
}

// Returns whether `[start, start + size)` overlaps no region.
fn range_is_free(state: &SpaceState, start: usize, size: usize) -> bool {
    match state.regions.range(..start + size).next_back() {
        Some((_, region)) => region.end() <= start,
        None => true,
    }
}

// Finds the lowest free userspace range of `size` bytes.
fn find_free_range(state: &SpaceState, size: usize) -> Option<VirtAddr> {
    let mut cursor = USERSPACE.start().as_usize();
    for region in state.regions.values() {
        if region.start().as_usize() >= cursor && region.start().as_usize() - cursor >= size {
            break;
        }

        if region.end() > cursor {
            cursor = region.end();
        }
    }

    if cursor + size - 1 <= USERSPACE.end().as_usize() {
        Some(VirtAddr::new(cursor))
    } else {
        None
    }
}

fn pin_object(state: &mut SpaceState, space: AddressSpaceId, object: &Arc<MemoryObject>, access: Access) {
    let entry = state.pinned.entry(object.id()).or_insert_with(|| {
        object.pin(space);
        PinnedObject {
            object: object.clone(),
            max_access: Access::empty(),
            regions: 0,
        }
    });
    entry.max_access |= access;
    entry.regions += 1;
}

fn unpin_object_by_id(state: &mut SpaceState, space: AddressSpaceId, object_id: MemObjectId) {
    if let Some(entry) = state.pinned.get_mut(&object_id) {
        entry.regions -= 1;
        if entry.regions == 0 {
            entry.object.unpin(space);
            state.pinned.remove(&object_id);
        }
    }
}

fn unpin_object_of(state: &mut SpaceState, space: AddressSpaceId, region: &Region) {
    if let RegionKind::ObjectBacked { object, .. } = region.kind() {
        let id = object.id();
        unpin_object_by_id(state, space, id);
    }
}

// Removes a region's mappings, pins and waiters from `state`.
// The region must already be out of the regions map.
fn remove_region_state<M>(
    state: &mut SpaceState,
    space: AddressSpaceId,
    region: &Region,
    frames: &mut M,
) -> Vec<TaskId>
where
    M: FrameAllocator + FrameDeallocator,
{
    let pages = region.size() / PAGE_SIZE;
    for i in 0..pages {
        let _ = state
            .table
            .unmap(region.start() + i * PAGE_SIZE, true, frames);
    }

    state.table.invalidate_tlb(region.start(), pages);
    unpin_object_of(state, space, region);
    take_waiters(state, region.start().as_usize(), region.size())
}

// Removes and returns the waiters for pages in
// `[start, start + size)`.
fn take_waiters(state: &mut SpaceState, start: usize, size: usize) -> Vec<TaskId> {
    let mut woken = Vec::new();
    state.blocked.retain(|&(va, tid)| {
        if va >= start && va < start + size {
            woken.push(tid);
            false
        } else {
            true
        }
    });

    woken
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::fill_frame;
    use alloc::string::ToString;
    use memobj::MemoryObject;
    use memory::testing::HeapFrameAllocator;
    use paging::X86PageTable;

    fn new_space(frames: &mut HeapFrameAllocator) -> Arc<AddressSpace> {
        let table = X86PageTable::create_empty(frames, None).expect("table allocation");
        AddressSpace::new(Box::new(table))
    }

    fn read_byte(space: &AddressSpace, va: usize) -> u8 {
        let phys = space.phys_addr_of(VirtAddr::new(va)).expect("page is mapped");
        unsafe { *(phys.as_usize() as *const u8) }
    }

    fn write_byte(space: &AddressSpace, va: usize, value: u8) {
        let phys = space.phys_addr_of(VirtAddr::new(va)).expect("page is mapped");
        unsafe { *(phys.as_usize() as *mut u8) = value };
    }

    fn drop_space(space: Arc<AddressSpace>, frames: &mut HeapFrameAllocator) {
        AddressSpace::unregister(space.id());
        space.tear_down(frames);
    }

    #[test]
    fn anonymous_regions_fault_in_pattern() {
        let mut frames = HeapFrameAllocator::new();
        let space = new_space(&mut frames);

        let (_, start) = space
            .create_region(
                Some(VirtAddr::new(0x1000_0000)),
                4 * PAGE_SIZE,
                "bss".to_string(),
                Access::READ | Access::WRITE,
                RegionKind::Anonymous { pattern: 0xfe },
            )
            .unwrap();
        assert_eq!(start, VirtAddr::new(0x1000_0000));

        // Nothing is mapped before the first touch.
        assert_eq!(
            space.phys_addr_of(start).unwrap_err(),
            Error::PageNotPresent
        );

        let outcome = space
            .handle_fault(start + 0x123, Access::READ, 1, &mut frames)
            .unwrap();
        assert_eq!(outcome, FaultOutcome::Mapped);
        assert_eq!(read_byte(&space, 0x1000_0000 + 0x123), 0xfe);

        // A second fault on the same page is spurious.
        assert_eq!(
            space
                .handle_fault(start, Access::WRITE, 1, &mut frames)
                .unwrap(),
            FaultOutcome::Mapped
        );

        // Access outside any region, and violating accesses,
        // are rejected.
        assert_eq!(
            space
                .handle_fault(VirtAddr::new(0x2000_0000), Access::READ, 1, &mut frames)
                .unwrap_err(),
            Error::PageNotAllocated
        );
        assert_eq!(
            space
                .handle_fault(start, Access::EXECUTE, 1, &mut frames)
                .unwrap_err(),
            Error::ProtectionViolation
        );

        drop_space(space, &mut frames);
        assert_eq!(frames.live_frames(), 0);
    }

    #[test]
    fn region_placement_and_overlap() {
        let mut frames = HeapFrameAllocator::new();
        let space = new_space(&mut frames);

        let (_, first) = space
            .create_region(
                None,
                2 * PAGE_SIZE,
                "a".to_string(),
                Access::READ,
                RegionKind::Anonymous { pattern: 0 },
            )
            .unwrap();
        assert_eq!(first, USERSPACE.start());

        // Automatic placement skips the first region.
        let (_, second) = space
            .create_region(
                None,
                PAGE_SIZE,
                "b".to_string(),
                Access::READ,
                RegionKind::Anonymous { pattern: 0 },
            )
            .unwrap();
        assert_eq!(second.as_usize(), first.as_usize() + 2 * PAGE_SIZE);

        // Fixed placement refuses overlap.
        assert_eq!(
            space
                .create_region(
                    Some(VirtAddr::new(first.as_usize() + PAGE_SIZE)),
                    PAGE_SIZE,
                    "c".to_string(),
                    Access::READ,
                    RegionKind::Anonymous { pattern: 0 },
                )
                .unwrap_err(),
            Error::RegionOccupied
        );

        assert_eq!(space.region_count(), 2);
        drop_space(space, &mut frames);
    }

    #[test]
    fn phys_mapped_regions_never_own_frames() {
        let mut frames = HeapFrameAllocator::new();
        let space = new_space(&mut frames);

        // Use a heap frame to stand in for device memory.
        let device = frames.allocate_frame().unwrap();
        fill_frame(device, 0x5a);

        let (_, start) = space
            .create_region(
                Some(VirtAddr::new(0x3000_0000)),
                PAGE_SIZE,
                "mmio".to_string(),
                Access::READ | Access::WRITE,
                RegionKind::PhysMapped {
                    phys_start: device.start_address(),
                },
            )
            .unwrap();

        space
            .handle_fault(start, Access::READ, 1, &mut frames)
            .unwrap();
        assert_eq!(
            space.phys_addr_of(start).unwrap(),
            device.start_address()
        );
        assert!(space.page_info(start).no_free);
        assert_eq!(read_byte(&space, 0x3000_0000), 0x5a);

        // Deleting the region leaves the device frame alone.
        let live = frames.live_frames();
        space.delete_region(start, &mut frames).unwrap();
        assert_eq!(frames.live_frames(), live);

        unsafe { frames.deallocate_frame(device) };
        drop_space(space, &mut frames);
        assert_eq!(frames.live_frames(), 0);
    }

    #[test]
    fn object_window_shares_frames() {
        let mut frames = HeapFrameAllocator::new();
        let space = new_space(&mut frames);
        let object = MemoryObject::create(4);

        let (_, start) = space
            .create_region(
                Some(VirtAddr::new(0x2000_0000)),
                4 * PAGE_SIZE,
                "shm".to_string(),
                Access::READ | Access::WRITE,
                RegionKind::ObjectBacked {
                    object: object.clone(),
                    object_offset: 0,
                    window_offset: 0,
                    window_size: 4 * PAGE_SIZE as u64,
                    cow: false,
                },
            )
            .unwrap();

        space
            .handle_fault(start + PAGE_SIZE, Access::WRITE, 1, &mut frames)
            .unwrap();

        // The mapped frame is the object's own page.
        let mapped = space.phys_addr_of(start + PAGE_SIZE).unwrap();
        let slot = object.page_address(PAGE_SIZE as u64).unwrap();
        assert_eq!(mapped, slot.start_address());
        assert!(space.page_info(start + PAGE_SIZE).no_free);

        // The object is pinned by the space.
        assert_eq!(object.pinners(), [space.id()]);

        // Deleting the region unpins and leaves the object's
        // frame intact.
        space.delete_region(start, &mut frames).unwrap();
        assert!(object.pinners().is_empty());
        assert!(object.page_address(PAGE_SIZE as u64).is_ok());

        object.destroy(&mut frames);
        MemoryObject::unregister(object.id());
        drop_space(space, &mut frames);
        assert_eq!(frames.live_frames(), 0);
    }

    #[test]
    fn cow_window_copies_and_zeroes_edges() {
        let mut frames = HeapFrameAllocator::new();
        let space = new_space(&mut frames);
        let object = MemoryObject::create(2);

        // Give the object recognisable content.
        object.request_page(0, &mut frames).unwrap();
        let source = object.page_address(0).unwrap();
        fill_frame(source, 0xab);

        // A 3-page region: one page of window, half-used, then
        // pure zero pages.
        let (_, start) = space
            .create_region(
                Some(VirtAddr::new(0x2400_0000)),
                3 * PAGE_SIZE,
                "data".to_string(),
                Access::READ | Access::WRITE,
                RegionKind::ObjectBacked {
                    object: object.clone(),
                    object_offset: 0,
                    window_offset: 0,
                    window_size: PAGE_SIZE as u64 / 2,
                    cow: true,
                },
            )
            .unwrap();

        space
            .handle_fault(start, Access::WRITE, 1, &mut frames)
            .unwrap();
        space
            .handle_fault(start + PAGE_SIZE, Access::WRITE, 1, &mut frames)
            .unwrap();

        // The window page holds the object's bytes up to the
        // window's end and zeroes beyond; the page past the
        // window is all zero.
        assert_eq!(read_byte(&space, 0x2400_0000), 0xab);
        assert_eq!(read_byte(&space, 0x2400_0000 + PAGE_SIZE / 2 - 1), 0xab);
        assert_eq!(read_byte(&space, 0x2400_0000 + PAGE_SIZE / 2), 0x00);
        assert_eq!(read_byte(&space, 0x2400_0000 + PAGE_SIZE), 0x00);

        // The copies are private: writing through the region
        // leaves the object untouched.
        write_byte(&space, 0x2400_0000, 0xcd);
        let object_byte = unsafe { *(source.start_address().as_usize() as *const u8) };
        assert_eq!(object_byte, 0xab);

        drop_space(space, &mut frames);
        object.destroy(&mut frames);
        MemoryObject::unregister(object.id());
        assert_eq!(frames.live_frames(), 0);
    }

    #[test]
    fn clone_is_independent() {
        let mut frames = HeapFrameAllocator::new();
        let space = new_space(&mut frames);

        let (_, start) = space
            .create_region(
                Some(VirtAddr::new(0x1000_0000)),
                PAGE_SIZE,
                "data".to_string(),
                Access::READ | Access::WRITE,
                RegionKind::Anonymous { pattern: 0 },
            )
            .unwrap();
        space
            .handle_fault(start, Access::WRITE, 1, &mut frames)
            .unwrap();
        write_byte(&space, 0x1000_0000, 0xab);

        let clone_table = X86PageTable::create_empty(&mut frames, None).unwrap();
        let clone = space
            .clone_space(Box::new(clone_table), &mut frames)
            .unwrap();

        // The clone sees the parent's value through its own
        // frame.
        assert_eq!(read_byte(&clone, 0x1000_0000), 0xab);
        assert_ne!(
            space.phys_addr_of(start).unwrap(),
            clone.phys_addr_of(start).unwrap()
        );

        // Writes on either side stay invisible to the other.
        write_byte(&clone, 0x1000_0000, 0xcd);
        assert_eq!(read_byte(&space, 0x1000_0000), 0xab);
        write_byte(&space, 0x1000_0000, 0x11);
        assert_eq!(read_byte(&clone, 0x1000_0000), 0xcd);

        drop_space(clone, &mut frames);
        drop_space(space, &mut frames);
        assert_eq!(frames.live_frames(), 0);
    }

    #[test]
    fn clone_refuses_shared_windows() {
        let mut frames = HeapFrameAllocator::new();
        let space = new_space(&mut frames);
        let object = MemoryObject::create(1);

        space
            .create_region(
                Some(VirtAddr::new(0x2000_0000)),
                PAGE_SIZE,
                "shm".to_string(),
                Access::READ,
                RegionKind::ObjectBacked {
                    object: object.clone(),
                    object_offset: 0,
                    window_offset: 0,
                    window_size: PAGE_SIZE as u64,
                    cow: false,
                },
            )
            .unwrap();

        let clone_table = X86PageTable::create_empty(&mut frames, None).unwrap();
        assert_eq!(
            space
                .clone_space(Box::new(clone_table), &mut frames)
                .unwrap_err(),
            Error::NotSupported
        );

        drop_space(space, &mut frames);
        object.destroy(&mut frames);
        MemoryObject::unregister(object.id());
    }

    #[test]
    fn pager_faults_wait_and_wake() {
        let mut frames = HeapFrameAllocator::new();
        let space = new_space(&mut frames);
        let object = MemoryObject::create(4);
        object.set_pager(77);

        let (_, start) = space
            .create_region(
                Some(VirtAddr::new(0x2000_0000)),
                4 * PAGE_SIZE,
                "paged".to_string(),
                Access::READ,
                RegionKind::ObjectBacked {
                    object: object.clone(),
                    object_offset: 0,
                    window_offset: 0,
                    window_size: 4 * PAGE_SIZE as u64,
                    cow: false,
                },
            )
            .unwrap();

        // The first fault asks the pager; a second faulting task
        // just waits.
        let outcome = space
            .handle_fault(start + 0x2000, Access::READ, 5, &mut frames)
            .unwrap();
        assert_eq!(
            outcome,
            FaultOutcome::Wait {
                pager: Some(PagerRequest {
                    port: 77,
                    object: object.id(),
                    offset: 0x2000,
                })
            }
        );
        assert_eq!(
            space
                .handle_fault(start + 0x2000, Access::READ, 6, &mut frames)
                .unwrap(),
            FaultOutcome::Wait { pager: None }
        );

        // The page arrives: both waiters are reported exactly
        // once.
        let frame = frames.allocate_frame().unwrap();
        let pinners = object.supply_page(0x2000, frame, true).unwrap();
        assert_eq!(pinners, [space.id()]);
        let mut woken = space.take_waiters_for_object_page(object.id(), 0x2000);
        woken.sort_unstable();
        assert_eq!(woken, [5, 6]);
        assert!(space
            .take_waiters_for_object_page(object.id(), 0x2000)
            .is_empty());

        // The retried fault now maps the supplied frame.
        assert_eq!(
            space
                .handle_fault(start + 0x2000, Access::READ, 5, &mut frames)
                .unwrap(),
            FaultOutcome::Mapped
        );
        assert_eq!(
            space.phys_addr_of(start + 0x2000).unwrap(),
            frame.start_address()
        );

        drop_space(space, &mut frames);
        object.destroy(&mut frames);
        MemoryObject::unregister(object.id());
        assert_eq!(frames.live_frames(), 0);
    }

    #[test]
    fn delete_region_unmaps_and_wakes() {
        let mut frames = HeapFrameAllocator::new();
        let space = new_space(&mut frames);
        let object = MemoryObject::create(2);
        object.set_pager(9);

        let (_, start) = space
            .create_region(
                Some(VirtAddr::new(0x2000_0000)),
                2 * PAGE_SIZE,
                "paged".to_string(),
                Access::READ,
                RegionKind::ObjectBacked {
                    object: object.clone(),
                    object_offset: 0,
                    window_offset: 0,
                    window_size: 2 * PAGE_SIZE as u64,
                    cow: false,
                },
            )
            .unwrap();

        space
            .handle_fault(start, Access::READ, 8, &mut frames)
            .unwrap();

        let woken = space.delete_region(start, &mut frames).unwrap();
        assert_eq!(woken, [8]);
        assert_eq!(space.region_count(), 0);
        assert_eq!(
            space
                .handle_fault(start, Access::READ, 8, &mut frames)
                .unwrap_err(),
            Error::PageNotAllocated
        );

        drop_space(space, &mut frames);
        object.destroy(&mut frames);
        MemoryObject::unregister(object.id());
    }

    #[test]
    fn object_shrink_truncates_regions() {
        let mut frames = HeapFrameAllocator::new();
        let space = new_space(&mut frames);
        let object = MemoryObject::create(16);

        let (_, start) = space
            .create_region(
                Some(VirtAddr::new(0x2000_0000)),
                8 * PAGE_SIZE,
                "shm".to_string(),
                Access::READ | Access::WRITE,
                RegionKind::ObjectBacked {
                    object: object.clone(),
                    object_offset: 0,
                    window_offset: 0,
                    window_size: 8 * PAGE_SIZE as u64,
                    cow: false,
                },
            )
            .unwrap();

        // Touch a page that survives and one that will not.
        space
            .handle_fault(start, Access::READ, 1, &mut frames)
            .unwrap();
        space
            .handle_fault(start + 5 * PAGE_SIZE, Access::READ, 1, &mut frames)
            .unwrap();

        // A task is waiting on a doomed page (simulate a pager
        // fetch in flight).
        object.set_pager(3);
        space
            .handle_fault(start + 6 * PAGE_SIZE, Access::READ, 30, &mut frames)
            .unwrap();

        // Shrink to 4 pages and apply the report.
        let report = object.resize(4, &mut frames).expect("shrink must report");
        let woken = space.truncate_for_object(
            object.id(),
            report.new_size_bytes,
            &mut frames,
        );
        assert_eq!(woken, [30]);

        // Accesses past the new end are not backed any more.
        assert_eq!(
            space
                .handle_fault(start + 4 * PAGE_SIZE, Access::READ, 1, &mut frames)
                .unwrap_err(),
            Error::PageNotAllocated
        );
        assert_eq!(
            space.phys_addr_of(start + 5 * PAGE_SIZE).unwrap_err(),
            Error::PageNotPresent
        );

        // The surviving page is still there.
        assert!(space.phys_addr_of(start).is_ok());

        drop_space(space, &mut frames);
        object.destroy(&mut frames);
        MemoryObject::unregister(object.id());
        assert_eq!(frames.live_frames(), 0);
    }

    #[test]
    fn transfer_moves_mappings() {
        let mut frames = HeapFrameAllocator::new();
        let src = new_space(&mut frames);
        let dst = new_space(&mut frames);

        let (_, start) = src
            .create_region(
                Some(VirtAddr::new(0x1000_0000)),
                2 * PAGE_SIZE,
                "buf".to_string(),
                Access::READ | Access::WRITE,
                RegionKind::Anonymous { pattern: 0 },
            )
            .unwrap();
        src.handle_fault(start, Access::WRITE, 1, &mut frames)
            .unwrap();
        write_byte(&src, 0x1000_0000, 0x77);
        let frame = src.phys_addr_of(start).unwrap();

        let (new_start, _) = transfer_region(
            &src,
            &dst,
            start,
            Some(VirtAddr::new(0x5000_0000)),
            Access::READ,
            &mut frames,
        )
        .unwrap();
        assert_eq!(new_start, VirtAddr::new(0x5000_0000));

        // The very same frame now backs the destination, and
        // the source has nothing left.
        assert_eq!(dst.phys_addr_of(new_start).unwrap(), frame);
        assert_eq!(read_byte(&dst, 0x5000_0000), 0x77);
        assert_eq!(src.phys_addr_of(start).unwrap_err(), Error::PageNotPresent);
        assert_eq!(src.region_count(), 0);
        assert_eq!(dst.region_count(), 1);

        drop_space(dst, &mut frames);
        drop_space(src, &mut frames);
        assert_eq!(frames.live_frames(), 0);
    }
}
