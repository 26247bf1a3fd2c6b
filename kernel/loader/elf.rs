// Copyright 2026 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! ELF-64 parsing, limited to what loading needs.

use crate::{read_object, Error};
use alloc::sync::Arc;
use memobj::MemoryObject;
use memory::FrameAllocator;

/// Program header type: a loadable segment.
pub const PT_LOAD: u32 = 1;

/// Program header type: the TLS initialisation image.
pub const PT_TLS: u32 = 7;

/// Segment flag: executable.
pub const PF_X: u32 = 0x1;

/// Segment flag: writable.
pub const PF_W: u32 = 0x2;

/// Segment flag: readable.
pub const PF_R: u32 = 0x4;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const CLASS_64: u8 = 2;
const DATA_LITTLE_ENDIAN: u8 = 1;
const TYPE_EXECUTABLE: u16 = 2;
const MACHINE_X86_64: u16 = 0x3e;
const MACHINE_RISCV: u16 = 0xf3;

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(word)
}

/// The fields of the ELF file header that loading uses.
///
pub(crate) struct ElfHeader {
    pub entry: u64,
    pub phoff: u64,
    pub phentsize: u16,
    pub phnum: u16,
}

impl ElfHeader {
    pub(crate) fn parse<M>(
        object: &Arc<MemoryObject>,
        frames: &mut M,
    ) -> Result<ElfHeader, Error>
    where
        M: FrameAllocator,
    {
        let mut bytes = [0u8; 64];
        read_object(object, 0, &mut bytes, frames)?;

        if bytes[..4] != ELF_MAGIC {
            return Err(Error::BadBinary("not an ELF file"));
        }

        if bytes[4] != CLASS_64 {
            return Err(Error::BadBinary("not a 64-bit binary"));
        }

        if bytes[5] != DATA_LITTLE_ENDIAN {
            return Err(Error::BadBinary("not little-endian"));
        }

        if read_u16(&bytes, 16) != TYPE_EXECUTABLE {
            return Err(Error::BadBinary("not a static executable"));
        }

        let machine = read_u16(&bytes, 18);
        if machine != MACHINE_X86_64 && machine != MACHINE_RISCV {
            return Err(Error::BadBinary("unsupported machine"));
        }

        let phentsize = read_u16(&bytes, 54);
        if (phentsize as usize) < 56 {
            return Err(Error::BadBinary("malformed program header size"));
        }

        Ok(ElfHeader {
            entry: read_u64(&bytes, 24),
            phoff: read_u64(&bytes, 32),
            phentsize,
            phnum: read_u16(&bytes, 56),
        })
    }
}

/// One program header.
///
pub(crate) struct ProgramHeader {
    pub kind: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub align: u64,
}

impl ProgramHeader {
    pub(crate) fn parse<M>(
        object: &Arc<MemoryObject>,
        header: &ElfHeader,
        index: u16,
        frames: &mut M,
    ) -> Result<ProgramHeader, Error>
    where
        M: FrameAllocator,
    {
        let at = header.phoff + index as u64 * header.phentsize as u64;
        let mut bytes = [0u8; 56];
        read_object(object, at, &mut bytes, frames)?;

        Ok(ProgramHeader {
            kind: read_u32(&bytes, 0),
            flags: read_u32(&bytes, 4),
            offset: read_u64(&bytes, 8),
            vaddr: read_u64(&bytes, 16),
            filesz: read_u64(&bytes, 32),
            memsz: read_u64(&bytes, 40),
            align: read_u64(&bytes, 48),
        })
    }

    // A diagnostic name for the region holding this segment.
    pub(crate) fn region_name(&self) -> &'static str {
        if self.flags & PF_X != 0 {
            "code"
        } else if self.flags & PF_W != 0 {
            "data"
        } else if self.flags & PF_R != 0 {
            "rodata"
        } else {
            "segment"
        }
    }
}
