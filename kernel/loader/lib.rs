// Copyright 2026 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Loads ELF-64 executables out of memory objects into address
//! spaces.
//!
//! The executable's bytes live in a [`MemoryObject`] (typically
//! filled by the VFS daemon, or by the bootloader for the first
//! task). Loading installs each `PT_LOAD` segment as an
//! object-backed region of the target address space: writable
//! segments copy-on-touch, read-only segments share the object's
//! frames directly. Nothing is copied up front; the segments page in
//! on first use.
//!
//! Alongside the segments, the loader builds the task's stack
//! region and a small *load record* region holding tagged
//! descriptions of the stack, the TLS image (from `PT_TLS`) and the
//! entry point, for the user-side runtime to parse. The entry point
//! and initial stack pointer are returned for the caller to write
//! into the task's register file.

#![no_std]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

extern crate alloc;

use addrspace::{Access, AddressSpace, FaultOutcome, RegionKind, TaskId};
use align::{align_down, align_up, PAGE_SIZE};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use memobj::{MemoryObject, PageRequest};
use memory::constants::USERSPACE;
use memory::{phys_to_virt_addr, FrameAllocator, FrameDeallocator, VirtAddr};

mod elf;

use crate::elf::{ElfHeader, ProgramHeader, PF_W, PF_X, PT_LOAD, PT_TLS};

/// The number of pages in a new task's stack.
///
pub const STACK_PAGES: usize = 128; // 512 KiB.

/// The top of the stack region.
///
const STACK_TOP: usize = 0x7fff_ffff_f000;

/// Load-record tag: end of the record.
pub const LOAD_TAG_END: u32 = 0;

/// Load-record tag: stack base and size.
pub const LOAD_TAG_STACK: u32 = 1;

/// Load-record tag: TLS image location, file size, memory size
/// and alignment.
pub const LOAD_TAG_TLS: u32 = 2;

/// Load-record tag: the executable's entry point.
pub const LOAD_TAG_ENTRY: u32 = 3;

/// Describes an error encountered while loading an executable.
///
#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    /// The binary is not a loadable ELF-64 executable.
    BadBinary(&'static str),

    /// The object's bytes are not resident yet; retry once the
    /// pager has delivered them.
    NotReady,

    /// The target address space rejected a region.
    Space(abi::Error),
}

impl From<abi::Error> for Error {
    fn from(err: abi::Error) -> Error {
        Error::Space(err)
    }
}

/// What [`load`] produced: the values to write into the task's
/// register file.
///
#[derive(Debug, Clone, Copy)]
pub struct LoadResult {
    /// The executable's entry point.
    pub entry: usize,

    /// The initial stack pointer, at the top of the stack
    /// region.
    pub stack_top: usize,

    /// The address of the load record, passed to the task as
    /// its first argument.
    pub load_record: usize,

    /// The size of the load record in bytes.
    pub load_record_size: usize,
}

// Reads `buf.len()` bytes at `offset` from the object.
pub(crate) fn read_object<M>(
    object: &Arc<MemoryObject>,
    offset: u64,
    buf: &mut [u8],
    frames: &mut M,
) -> Result<(), Error>
where
    M: FrameAllocator,
{
    let mut done = 0;
    while done < buf.len() {
        let at = offset + done as u64;
        let page_offset = (at % PAGE_SIZE as u64) as usize;
        let take = core::cmp::min(PAGE_SIZE - page_offset, buf.len() - done);

        let frame = match object.request_page(at - page_offset as u64, frames) {
            Ok(PageRequest::Mapped(frame)) => frame,
            Ok(_) => return Err(Error::NotReady),
            Err(err) => return Err(Error::Space(err)),
        };

        let virt = phys_to_virt_addr(frame.start_address());
        let bytes =
            unsafe { core::slice::from_raw_parts(virt.as_ptr().add(page_offset), take) };
        buf[done..done + take].copy_from_slice(bytes);
        done += take;
    }

    Ok(())
}

// Appends a load-record tag: a 32-bit tag, a 32-bit payload
// size, then the payload words.
fn push_tag(record: &mut Vec<u8>, tag: u32, payload: &[u64]) {
    record.extend_from_slice(&tag.to_le_bytes());
    record.extend_from_slice(&((payload.len() * 8) as u32).to_le_bytes());
    for word in payload {
        record.extend_from_slice(&word.to_le_bytes());
    }
}

/// Loads the ELF-64 executable held in `object` into `space`.
///
/// On success the segments, the stack and the load record are
/// installed; on any failure the regions created so far are
/// removed again.
///
pub fn load<M>(
    space: &Arc<AddressSpace>,
    object: &Arc<MemoryObject>,
    frames: &mut M,
) -> Result<LoadResult, Error>
where
    M: FrameAllocator + FrameDeallocator,
{
    let mut created: Vec<VirtAddr> = Vec::new();
    match load_inner(space, object, frames, &mut created) {
        Ok(result) => Ok(result),
        Err(err) => {
            // Unwind the regions installed before the failure.
            for start in created {
                let _ = space.delete_region(start, frames);
            }

            Err(err)
        }
    }
}

fn load_inner<M>(
    space: &Arc<AddressSpace>,
    object: &Arc<MemoryObject>,
    frames: &mut M,
    created: &mut Vec<VirtAddr>,
) -> Result<LoadResult, Error>
where
    M: FrameAllocator + FrameDeallocator,
{
    let header = ElfHeader::parse(object, frames)?;
    let mut tls: Option<ProgramHeader> = None;

    for index in 0..header.phnum {
        let phdr = ProgramHeader::parse(object, &header, index, frames)?;
        match phdr.kind {
            PT_LOAD => {
                let start = install_segment(space, object, &phdr)?;
                created.push(start);
            }
            PT_TLS => tls = Some(phdr),
            _ => {}
        }
    }

    let entry = header.entry as usize;
    if !USERSPACE.contains_addr(VirtAddr::try_new(entry).map_err(|_| {
        Error::BadBinary("entry point is not a canonical address")
    })?) {
        return Err(Error::BadBinary("entry point outside userspace"));
    }

    // The stack, at the top of userspace.
    let stack_size = STACK_PAGES * PAGE_SIZE;
    let stack_base = VirtAddr::new(STACK_TOP - stack_size);
    let (_, stack_start) = space.create_region(
        Some(stack_base),
        stack_size,
        String::from("stack"),
        Access::READ | Access::WRITE,
        RegionKind::Anonymous { pattern: 0 },
    )?;
    created.push(stack_start);
    let stack_top = stack_start.as_usize() + stack_size;

    // The load record describing what was set up.
    let mut record = Vec::new();
    push_tag(&mut record, LOAD_TAG_STACK, &[
        stack_start.as_usize() as u64,
        stack_size as u64,
    ]);
    if let Some(tls) = &tls {
        push_tag(&mut record, LOAD_TAG_TLS, &[
            tls.vaddr,
            tls.filesz,
            tls.memsz,
            tls.align,
        ]);
    }
    push_tag(&mut record, LOAD_TAG_ENTRY, &[entry as u64]);
    push_tag(&mut record, LOAD_TAG_END, &[]);

    let record_pages = align::pages_for(record.len());
    let (_, record_start) = space.create_region(
        None,
        record_pages * PAGE_SIZE,
        String::from("load record"),
        Access::READ | Access::WRITE,
        RegionKind::Anonymous { pattern: 0 },
    )?;
    created.push(record_start);
    write_to_region(space, record_start, &record, frames)?;

    Ok(LoadResult {
        entry,
        stack_top,
        load_record: record_start.as_usize(),
        load_record_size: record.len(),
    })
}

// Installs one PT_LOAD segment as an object-backed region. The
// pages arrive lazily, on first touch.
fn install_segment(
    space: &Arc<AddressSpace>,
    object: &Arc<MemoryObject>,
    phdr: &ProgramHeader,
) -> Result<VirtAddr, Error> {
    if phdr.memsz < phdr.filesz {
        return Err(Error::BadBinary("segment memory size below file size"));
    }

    // ELF guarantees congruent file and memory offsets, which
    // is exactly the region layer's window alignment rule.
    if phdr.offset % PAGE_SIZE as u64 != phdr.vaddr % PAGE_SIZE as u64 {
        return Err(Error::BadBinary("segment offsets are not congruent"));
    }

    let vaddr = phdr.vaddr as usize;
    let end = vaddr
        .checked_add(phdr.memsz as usize)
        .filter(|&end| end <= USERSPACE.end().as_usize())
        .ok_or(Error::BadBinary("segment exceeds userspace"))?;
    let start = align_down(vaddr, PAGE_SIZE);
    let size = align_up(end, PAGE_SIZE) - start;
    let object_offset = align_down(phdr.offset as usize, PAGE_SIZE) as u64;
    let head = phdr.offset - object_offset;

    let mut access = Access::READ;
    if phdr.flags & PF_W != 0 {
        access |= Access::WRITE;
    }
    if phdr.flags & PF_X != 0 {
        access |= Access::EXECUTE;
    }

    let writable = phdr.flags & PF_W != 0;
    let kind = if writable || phdr.memsz != phdr.filesz {
        // Private data (and zero-filled tails): copy on touch.
        RegionKind::ObjectBacked {
            object: object.clone(),
            object_offset,
            window_offset: 0,
            window_size: head + phdr.filesz,
            cow: true,
        }
    } else {
        // Read-only code and rodata: share the object's frames.
        let window = align_up((head + phdr.filesz) as usize, PAGE_SIZE) as u64;
        if window != size as u64 {
            return Err(Error::BadBinary("read-only segment window mismatch"));
        }

        RegionKind::ObjectBacked {
            object: object.clone(),
            object_offset,
            window_offset: 0,
            window_size: window,
            cow: false,
        }
    };

    let (_, start) = space.create_region(
        Some(VirtAddr::new(start)),
        size,
        String::from(phdr.region_name()),
        access,
        kind,
    )?;

    Ok(start)
}

// Writes bytes into a freshly created anonymous region by
// faulting its pages in.
fn write_to_region<M>(
    space: &Arc<AddressSpace>,
    start: VirtAddr,
    bytes: &[u8],
    frames: &mut M,
) -> Result<(), Error>
where
    M: FrameAllocator + FrameDeallocator,
{
    const LOADER_TASK: TaskId = 0;

    let mut done = 0;
    while done < bytes.len() {
        let va = start + done;
        let page = va.align_down_page();
        match space.handle_fault(page, Access::WRITE, LOADER_TASK, frames)? {
            FaultOutcome::Mapped => {}
            FaultOutcome::Wait { .. } => return Err(Error::NotReady),
        }

        let take = core::cmp::min(PAGE_SIZE - va.page_offset(), bytes.len() - done);
        let phys = space.phys_addr_of(va).map_err(Error::Space)?;
        let virt = phys_to_virt_addr(phys);
        unsafe {
            core::ptr::copy_nonoverlapping(bytes[done..].as_ptr(), virt.as_mut_ptr(), take)
        };
        done += take;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{load, Error, LOAD_TAG_STACK, STACK_PAGES};
    use addrspace::{Access, AddressSpace};
    use alloc::boxed::Box;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use memobj::{MemoryObject, PageRequest};
    use memory::testing::HeapFrameAllocator;
    use memory::{phys_to_virt_addr, VirtAddr, PAGE_SIZE};
    use paging::X86PageTable;

    fn new_space(frames: &mut HeapFrameAllocator) -> Arc<AddressSpace> {
        let table = X86PageTable::create_empty(frames, None).expect("table allocation");
        AddressSpace::new(Box::new(table))
    }

    // Materialises the object's pages and copies bytes in.
    fn write_object(
        object: &Arc<MemoryObject>,
        offset: u64,
        bytes: &[u8],
        frames: &mut HeapFrameAllocator,
    ) {
        let mut done = 0;
        while done < bytes.len() {
            let at = offset + done as u64;
            let page_offset = (at % PAGE_SIZE as u64) as usize;
            let take = core::cmp::min(PAGE_SIZE - page_offset, bytes.len() - done);
            let frame = match object.request_page(at - page_offset as u64, frames).unwrap() {
                PageRequest::Mapped(frame) => frame,
                other => panic!("object page not resident: {:?}", other),
            };

            let virt = phys_to_virt_addr(frame.start_address());
            unsafe {
                core::ptr::copy_nonoverlapping(
                    bytes[done..].as_ptr(),
                    virt.as_mut_ptr().add(page_offset),
                    take,
                )
            };
            done += take;
        }
    }

    fn push_u64(bytes: &mut Vec<u8>, value: u64) {
        bytes.extend_from_slice(&value.to_le_bytes());
    }

    fn program_header(
        kind: u32,
        flags: u32,
        offset: u64,
        vaddr: u64,
        filesz: u64,
        memsz: u64,
    ) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&kind.to_le_bytes());
        bytes.extend_from_slice(&flags.to_le_bytes());
        push_u64(&mut bytes, offset);
        push_u64(&mut bytes, vaddr);
        push_u64(&mut bytes, vaddr); // paddr, ignored
        push_u64(&mut bytes, filesz);
        push_u64(&mut bytes, memsz);
        push_u64(&mut bytes, 0x1000); // alignment
        bytes
    }

    // A minimal static executable: one read-execute segment at
    // 0x40_1000 (one page of 0xcc), one read-write segment at
    // 0x40_2000 (0x100 bytes of 0xdd plus zero fill), and a TLS
    // header.
    fn build_test_binary(frames: &mut HeapFrameAllocator) -> Arc<MemoryObject> {
        let object = MemoryObject::create(3);

        let mut header = Vec::new();
        header.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
        header.extend_from_slice(&[0; 8]);
        header.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        header.extend_from_slice(&0x3eu16.to_le_bytes()); // x86_64
        header.extend_from_slice(&1u32.to_le_bytes());
        push_u64(&mut header, 0x40_1000); // entry
        push_u64(&mut header, 64); // phoff
        push_u64(&mut header, 0); // shoff
        header.extend_from_slice(&0u32.to_le_bytes()); // flags
        header.extend_from_slice(&64u16.to_le_bytes()); // ehsize
        header.extend_from_slice(&56u16.to_le_bytes()); // phentsize
        header.extend_from_slice(&3u16.to_le_bytes()); // phnum
        assert_eq!(header.len(), 58);

        write_object(&object, 0, &header, frames);
        write_object(
            &object,
            64,
            &program_header(super::elf::PT_LOAD, 0x5, 0x1000, 0x40_1000, 0x1000, 0x1000),
            frames,
        );
        write_object(
            &object,
            64 + 56,
            &program_header(super::elf::PT_LOAD, 0x6, 0x2000, 0x40_2000, 0x100, 0x1800),
            frames,
        );
        write_object(
            &object,
            64 + 112,
            &program_header(super::elf::PT_TLS, 0x4, 0x2000, 0x40_2000, 0x100, 0x200),
            frames,
        );

        write_object(&object, 0x1000, &[0xcc; 0x1000], frames);
        write_object(&object, 0x2000, &[0xdd; 0x100], frames);
        object
    }

    fn read_byte(space: &AddressSpace, va: usize) -> u8 {
        let phys = space.phys_addr_of(VirtAddr::new(va)).expect("page is mapped");
        unsafe { *(phys.as_usize() as *const u8) }
    }

    #[test]
    fn loads_segments_stack_and_record() {
        let mut frames = HeapFrameAllocator::new();
        let space = new_space(&mut frames);
        let object = build_test_binary(&mut frames);

        let result = load(&space, &object, &mut frames).expect("load succeeds");
        assert_eq!(result.entry, 0x40_1000);
        assert_eq!(result.stack_top % PAGE_SIZE, 0);

        // Code, data, stack and the load record.
        assert_eq!(space.region_count(), 4);

        // The code page is the object's own frame, shared.
        space
            .handle_fault(VirtAddr::new(0x40_1000), Access::READ, 1, &mut frames)
            .unwrap();
        assert_eq!(read_byte(&space, 0x40_1234), 0xcc);
        let code_phys = space.phys_addr_of(VirtAddr::new(0x40_1000)).unwrap();
        assert_eq!(
            code_phys,
            object.page_address(0x1000).unwrap().start_address()
        );

        // The data page is a private copy: file bytes, then the
        // zero fill.
        space
            .handle_fault(VirtAddr::new(0x40_2000), Access::WRITE, 1, &mut frames)
            .unwrap();
        assert_eq!(read_byte(&space, 0x40_2000), 0xdd);
        assert_eq!(read_byte(&space, 0x40_20ff), 0xdd);
        assert_eq!(read_byte(&space, 0x40_2100), 0x00);
        assert_ne!(
            space.phys_addr_of(VirtAddr::new(0x40_2000)).unwrap(),
            object.page_address(0x2000).unwrap().start_address()
        );

        // The stack region exists and faults in as zeroes.
        let below_top = result.stack_top - PAGE_SIZE;
        space
            .handle_fault(VirtAddr::new(below_top), Access::WRITE, 1, &mut frames)
            .unwrap();
        assert_eq!(read_byte(&space, below_top), 0x00);
        assert!(result.stack_top - STACK_PAGES * PAGE_SIZE <= below_top);

        // The load record leads with the stack tag.
        space
            .handle_fault(
                VirtAddr::new(result.load_record),
                Access::READ,
                1,
                &mut frames,
            )
            .unwrap();
        let phys = space
            .phys_addr_of(VirtAddr::new(result.load_record))
            .unwrap();
        let record =
            unsafe { core::slice::from_raw_parts(phys.as_usize() as *const u8, 8) };
        assert_eq!(&record[..4], &LOAD_TAG_STACK.to_le_bytes());

        AddressSpace::unregister(space.id());
        space.tear_down(&mut frames);
        object.destroy(&mut frames);
        MemoryObject::unregister(object.id());
        assert_eq!(frames.live_frames(), 0);
    }

    #[test]
    fn rejects_garbage() {
        let mut frames = HeapFrameAllocator::new();
        let space = new_space(&mut frames);
        let object = MemoryObject::create(1);
        write_object(&object, 0, &[0u8; 64], &mut frames);

        assert_eq!(
            load(&space, &object, &mut frames).unwrap_err(),
            Error::BadBinary("not an ELF file")
        );

        // Nothing was left behind.
        assert_eq!(space.region_count(), 0);

        AddressSpace::unregister(space.id());
        space.tear_down(&mut frames);
        object.destroy(&mut frames);
        MemoryObject::unregister(object.id());
    }
}
