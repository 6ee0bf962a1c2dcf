//! Program headers.

use super::{ElfError, Raw};
use num_enum::TryFromPrimitive;

/// Size of one ELF32 program header.
pub const PHDR_SIZE: usize = 32;

/// Program header types the loader recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum PType {
    /// Unused entry.
    Null = 0,
    /// Loadable segment.
    Load = 1,
    /// Dynamic linking tables.
    Dynamic = 2,
    /// Interpreter path.
    Interp = 3,
    /// Auxiliary information.
    Note = 4,
    /// Reserved.
    Shlib = 5,
    /// The program header table itself.
    Phdr = 6,
}

/// One program header (segment descriptor).
#[derive(Debug, Clone, Copy)]
pub struct ProgramHeader {
    ptype: u32,
    /// Segment offset in the file image.
    pub offset: u32,
    /// Virtual address of the segment.
    pub vaddr: u32,
    /// Physical address; unused by this kernel.
    pub paddr: u32,
    /// Bytes of the segment stored in the file.
    pub filesz: u32,
    /// Bytes of the segment in memory; at least `filesz`.
    pub memsz: u32,
    /// Segment flags.
    pub flags: u32,
    /// Required alignment.
    pub align: u32,
}

impl ProgramHeader {
    pub(super) fn parse(bytes: &[u8; PHDR_SIZE]) -> Self {
        let raw = Raw(bytes);
        Self {
            ptype: raw.u32(0),
            offset: raw.u32(4),
            vaddr: raw.u32(8),
            paddr: raw.u32(12),
            filesz: raw.u32(16),
            memsz: raw.u32(20),
            flags: raw.u32(24),
            align: raw.u32(28),
        }
    }

    /// The segment type, or `None` for toolchain-specific kinds the
    /// kernel skips over.
    pub fn type_(&self) -> Option<PType> {
        PType::try_from(self.ptype).ok()
    }

    pub(super) fn check(&self) -> Result<(), ElfError> {
        if self.memsz < self.filesz {
            return Err(ElfError::BadFormat);
        }
        Ok(())
    }
}
