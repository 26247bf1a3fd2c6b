// Copyright 2026 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Memory objects: shared, pageable arrays of physical frames.
//!
//! A [`MemoryObject`] is the unit of shared and pager-backed memory.
//! Regions reference a window of an object; address spaces pin the
//! objects their regions reference; a page fault inside such a region
//! asks the object for the page with [`request_page`].
//!
//! An object without a pager satisfies page requests by allocating
//! zeroed frames on first touch. An object with a pager answers
//! [`PageRequest::NeedsPager`] instead; the caller sends the pager a
//! page-request message, blocks the faulting task on the address, and
//! the pager later completes the slot with [`supply_page`], which
//! reports the address spaces whose blocked tasks must be woken. This
//! crate never calls upward into IPC or scheduling; it only reports
//! what the caller must do.
//!
//! Objects live in the global [`OBJECTS`] index and are looked up by
//! id, as every other kernel object is.

#![no_std]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

extern crate alloc;

use abi::Error;
use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use lazy_static::lazy_static;
use memory::{FrameAllocator, FrameDeallocator, PhysFrame, PAGE_SIZE};
use spin::{lock, Mutex};

/// Uniquely identifies a memory object throughout the kernel.
///
pub type MemObjectId = u64;

/// Identifies an address space pinning an object. Defined here
/// as a bare id to keep this crate below the region layer.
///
pub type PinnerId = u64;

/// Identifies the port of an object's pager.
///
pub type PagerPortId = u64;

lazy_static! {
    /// The global memory object index.
    ///
    pub static ref OBJECTS: Mutex<BTreeMap<MemObjectId, Arc<MemoryObject>>> =
        Mutex::new(BTreeMap::new());
}

fn next_id() -> MemObjectId {
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// The outcome of a page request.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageRequest {
    /// The page is resident; map this frame (shared, the object
    /// keeps ownership).
    Mapped(PhysFrame),

    /// The pager has already been asked for this page; block
    /// until it arrives.
    Pending,

    /// Ask the pager for the page, then block. The caller sends
    /// the request message; the object has marked the slot as
    /// requested.
    NeedsPager {
        /// The pager's port.
        port: PagerPortId,

        /// The page-aligned offset to request.
        offset: u64,
    },
}

// One page of the object.
#[derive(Clone, Copy, Default)]
struct PageSlot {
    // The resident frame, if any.
    frame: Option<PhysFrame>,

    // The frame is owned elsewhere and must survive the slot.
    dont_delete: bool,

    // A pager request for this slot is in flight.
    requested: bool,
}

struct ObjectState {
    slots: Vec<PageSlot>,
    pinners: BTreeSet<PinnerId>,
    pager: Option<PagerPortId>,
}

/// What a shrinking resize left behind: the pinners that must
/// truncate their regions and wake tasks blocked past the new
/// end.
///
pub struct ShrinkReport {
    /// The object's new size, in bytes.
    pub new_size_bytes: u64,

    /// Every address space pinning the object.
    pub pinners: Vec<PinnerId>,
}

/// A shared, pageable array of physical frames.
///
pub struct MemoryObject {
    id: MemObjectId,

    // log2 of the page size. Only 4 KiB pages are produced
    // today, but offsets are always translated through this.
    page_size_log: u32,

    state: Mutex<ObjectState>,
}

impl MemoryObject {
    /// Creates an anonymous object of `size_pages` pages and
    /// registers it in the global index.
    ///
    pub fn create(size_pages: usize) -> Arc<MemoryObject> {
        let object = Arc::new(MemoryObject {
            id: next_id(),
            page_size_log: 12,
            state: Mutex::new(ObjectState {
                slots: alloc::vec![PageSlot::default(); size_pages],
                pinners: BTreeSet::new(),
                pager: None,
            }),
        });

        lock!(OBJECTS).insert(object.id, object.clone());
        object
    }

    /// Returns the object with the given id, or `None`.
    ///
    pub fn get(id: MemObjectId) -> Option<Arc<MemoryObject>> {
        lock!(OBJECTS).get(&id).cloned()
    }

    /// Removes the object from the global index, returning it so
    /// the caller can destroy it once the last reference drops.
    ///
    pub fn unregister(id: MemObjectId) -> Option<Arc<MemoryObject>> {
        lock!(OBJECTS).remove(&id)
    }

    /// Returns the object's id.
    ///
    pub fn id(&self) -> MemObjectId {
        self.id
    }

    /// Returns the object's size in pages.
    ///
    pub fn size_pages(&self) -> usize {
        lock!(self.state).slots.len()
    }

    /// Returns the object's size in bytes.
    ///
    pub fn size_bytes(&self) -> u64 {
        (self.size_pages() as u64) << self.page_size_log
    }

    /// Returns log2 of the object's page size.
    ///
    pub fn page_size_log(&self) -> u32 {
        self.page_size_log
    }

    /// Binds the object's pager port. Faults on non-resident
    /// pages are forwarded there from now on.
    ///
    pub fn set_pager(&self, port: PagerPortId) {
        lock!(self.state).pager = Some(port);
    }

    /// Requests the page at the given byte offset.
    ///
    /// Fails with [`Error::OutOfRange`] if the offset lies past
    /// the object's end.
    ///
    pub fn request_page(
        &self,
        offset: u64,
        frames: &mut dyn FrameAllocator,
    ) -> Result<PageRequest, Error> {
        let index = (offset >> self.page_size_log) as usize;
        let mut state = lock!(self.state);
        let slot = state.slots.get(index).ok_or(Error::OutOfRange)?;

        if let Some(frame) = slot.frame {
            return Ok(PageRequest::Mapped(frame));
        }

        let pager = state.pager;
        match pager {
            None => {
                // Anonymous: a zeroed frame on first touch.
                let frame = frames.allocate_frame().ok_or(Error::OutOfMemory)?;
                zero(frame);
                state.slots[index].frame = Some(frame);
                Ok(PageRequest::Mapped(frame))
            }
            Some(port) => {
                if state.slots[index].requested {
                    Ok(PageRequest::Pending)
                } else {
                    state.slots[index].requested = true;
                    Ok(PageRequest::NeedsPager {
                        port,
                        offset: (index as u64) << self.page_size_log,
                    })
                }
            }
        }
    }

    /// Completes the slot at the given byte offset with a frame
    /// provided by the pager.
    ///
    /// If `owned`, the object takes ownership of the frame and
    /// frees it with the slot. Returns the pinning address
    /// spaces, whose tasks blocked on this page must be woken.
    ///
    pub fn supply_page(
        &self,
        offset: u64,
        frame: PhysFrame,
        owned: bool,
    ) -> Result<Vec<PinnerId>, Error> {
        let index = (offset >> self.page_size_log) as usize;
        let mut state = lock!(self.state);
        let slot = state.slots.get_mut(index).ok_or(Error::OutOfRange)?;

        if slot.frame.is_some() {
            return Err(Error::PagePresent);
        }

        slot.frame = Some(frame);
        slot.dont_delete = !owned;
        slot.requested = false;
        Ok(state.pinners.iter().copied().collect())
    }

    /// Returns the frame resident at the given byte offset.
    ///
    pub fn page_address(&self, offset: u64) -> Result<PhysFrame, Error> {
        let index = (offset >> self.page_size_log) as usize;
        let state = lock!(self.state);
        let slot = state.slots.get(index).ok_or(Error::OutOfRange)?;
        slot.frame.ok_or(Error::PageNotPresent)
    }

    /// Registers an address space as pinning this object.
    ///
    pub fn pin(&self, pinner: PinnerId) {
        lock!(self.state).pinners.insert(pinner);
    }

    /// Removes an address space from the object's pinners.
    ///
    pub fn unpin(&self, pinner: PinnerId) {
        lock!(self.state).pinners.remove(&pinner);
    }

    /// Returns the pinning address spaces.
    ///
    pub fn pinners(&self) -> Vec<PinnerId> {
        lock!(self.state).pinners.iter().copied().collect()
    }

    /// Atomically resizes the object to `new_size_pages`.
    ///
    /// Growing adds empty slots. Shrinking frees the frames of
    /// the removed slots (unless borrowed) and returns a
    /// [`ShrinkReport`]; the caller must truncate every pinner's
    /// regions past the new end and wake their blocked tasks.
    ///
    pub fn resize(
        &self,
        new_size_pages: usize,
        frames: &mut dyn FrameDeallocator,
    ) -> Option<ShrinkReport> {
        let mut state = lock!(self.state);
        let old = state.slots.len();

        if new_size_pages >= old {
            state.slots.resize(new_size_pages, PageSlot::default());
            return None;
        }

        for slot in state.slots.drain(new_size_pages..) {
            if let Some(frame) = slot.frame {
                if !slot.dont_delete {
                    unsafe { frames.deallocate_frame(frame) };
                }
            }
        }

        Some(ShrinkReport {
            new_size_bytes: (new_size_pages as u64) << self.page_size_log,
            pinners: state.pinners.iter().copied().collect(),
        })
    }

    /// Frees every frame the object owns. Called when the object
    /// is dropped from the index and its last reference is gone.
    ///
    pub fn destroy(&self, frames: &mut dyn FrameDeallocator) {
        let mut state = lock!(self.state);
        for slot in state.slots.drain(..) {
            if let Some(frame) = slot.frame {
                if !slot.dont_delete {
                    unsafe { frames.deallocate_frame(frame) };
                }
            }
        }
    }
}

fn zero(frame: PhysFrame) {
    let virt = memory::phys_to_virt_addr(frame.start_address());
    unsafe { core::ptr::write_bytes(virt.as_mut_ptr(), 0, PAGE_SIZE) };
}

#[cfg(test)]
mod tests {
    use super::{MemoryObject, PageRequest};
    use abi::Error;
    use memory::testing::HeapFrameAllocator;
    use memory::FrameAllocator;

    #[test]
    fn anonymous_pages_are_zeroed_and_stable() {
        let mut frames = HeapFrameAllocator::new();
        let object = MemoryObject::create(4);

        let first = match object.request_page(0x1000, &mut frames).unwrap() {
            PageRequest::Mapped(frame) => frame,
            other => panic!("expected a mapped page, got {:?}", other),
        };

        // The frame is zeroed and repeated requests return the
        // same frame.
        let bytes =
            unsafe { core::slice::from_raw_parts(first.start_address().as_usize() as *const u8, 4096) };
        assert!(bytes.iter().all(|&b| b == 0));
        assert_eq!(
            object.request_page(0x1fff, &mut frames).unwrap(),
            PageRequest::Mapped(first)
        );
        assert_eq!(object.page_address(0x1000).unwrap(), first);

        // Out-of-range offsets are rejected.
        assert_eq!(
            object.request_page(0x4000, &mut frames).unwrap_err(),
            Error::OutOfRange
        );

        object.destroy(&mut frames);
        MemoryObject::unregister(object.id());
    }

    #[test]
    fn pager_requests_are_sent_once() {
        let mut frames = HeapFrameAllocator::new();
        let object = MemoryObject::create(2);
        object.set_pager(7);
        object.pin(42);

        // The first fault asks the pager; the second waits.
        assert_eq!(
            object.request_page(0x1234, &mut frames).unwrap(),
            PageRequest::NeedsPager {
                port: 7,
                offset: 0x1000
            }
        );
        assert_eq!(
            object.request_page(0x1000, &mut frames).unwrap(),
            PageRequest::Pending
        );

        // Supplying the page reports the pinners to wake, and
        // later faults see the frame.
        let frame = frames.allocate_frame().unwrap();
        let woken = object.supply_page(0x1000, frame, true).unwrap();
        assert_eq!(woken, [42]);
        assert_eq!(
            object.request_page(0x1000, &mut frames).unwrap(),
            PageRequest::Mapped(frame)
        );

        // Supplying a resident page is refused.
        let dup = frames.allocate_frame().unwrap();
        assert_eq!(
            object.supply_page(0x1000, dup, true).unwrap_err(),
            Error::PagePresent
        );

        unsafe {
            use memory::FrameDeallocator;
            frames.deallocate_frame(dup);
        }

        object.destroy(&mut frames);
        MemoryObject::unregister(object.id());
        assert_eq!(frames.live_frames(), 0);
    }

    #[test]
    fn shrink_frees_and_reports() {
        let mut frames = HeapFrameAllocator::new();
        let object = MemoryObject::create(16);
        object.pin(3);
        object.pin(9);

        // Fault in a page that will survive and one that will
        // not.
        object.request_page(0x0000, &mut frames).unwrap();
        object.request_page(0x5000, &mut frames).unwrap();
        assert_eq!(frames.live_frames(), 2);

        let report = object.resize(4, &mut frames).expect("shrink must report");
        assert_eq!(report.new_size_bytes, 4 * 4096);
        assert_eq!(report.pinners, [3, 9]);

        // The page past the new end is gone, its frame freed.
        assert_eq!(frames.live_frames(), 1);
        assert_eq!(object.size_pages(), 4);
        assert_eq!(object.page_address(0x5000).unwrap_err(), Error::OutOfRange);

        // Growing back adds empty slots.
        assert!(object.resize(8, &mut frames).is_none());
        assert_eq!(object.size_pages(), 8);
        assert_eq!(object.page_address(0x5000).unwrap_err(), Error::PageNotPresent);

        object.unpin(3);
        assert_eq!(object.pinners(), [9]);

        object.destroy(&mut frames);
        MemoryObject::unregister(object.id());
        assert_eq!(frames.live_frames(), 0);
    }
}
