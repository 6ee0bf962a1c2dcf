//! Section headers.

use super::{ElfError, Raw};
use bitflags::bitflags;
use num_enum::TryFromPrimitive;

/// Size of one ELF32 section header.
pub const SHDR_SIZE: usize = 40;

/// Section types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum SType {
    /// Unused.
    Null = 0,
    /// Program data.
    ProgBits = 1,
    /// Symbol table.
    Symtab = 2,
    /// String table.
    Strtab = 3,
    /// Relocation entries with addends.
    Rela = 4,
    /// Symbol hash table.
    Hash = 5,
    /// Dynamic linking information.
    Dynamic = 6,
    /// Notes.
    Note = 7,
    /// Program space with no file data (bss).
    Nobits = 8,
    /// Relocation entries, no addends.
    Rel = 9,
    /// Reserved.
    Shlib = 10,
    /// Dynamic linker symbol table.
    Dynsym = 11,
}

bitflags! {
    /// Section attribute flags the loader cares about.
    pub struct SFlags: u32 {
        /// Writable during execution.
        const WRITE = 0x1;
        /// Occupies memory during execution.
        const ALLOC = 0x2;
        /// Contains executable instructions.
        const EXECINSTR = 0x4;
    }
}

/// One section of the executable.
#[derive(Debug, Clone)]
pub struct Section {
    /// Section name, resolved from the string table.
    pub name: String,
    /// Section type.
    pub stype: SType,
    /// Attribute flags, restricted to the subset the loader understands.
    pub flags: SFlags,
    /// Virtual address of the first byte, for ALLOC sections.
    pub vaddr: u32,
    /// Offset of the section contents in the file image.
    pub offset: u32,
    /// Size of the section in bytes.
    pub size: u32,
    /// Required alignment.
    pub addralign: u32,
    /// Size of each entry for table sections, else zero.
    pub entsize: u32,
    /// First virtual page of the section; zero unless loadable.
    pub first_vpn: usize,
    /// Number of pages the section occupies; zero unless loadable.
    pub num_pages: usize,
}

impl Section {
    pub(super) fn parse(bytes: &[u8; SHDR_SIZE], page_size: usize) -> Result<(u32, Self), ElfError> {
        let raw = Raw(bytes);
        let name_index = raw.u32(0);
        let stype = SType::try_from(raw.u32(4)).map_err(|_| ElfError::BadFormat)?;
        let flags = SFlags::from_bits_truncate(raw.u32(8));
        let vaddr = raw.u32(12);
        let size = raw.u32(20);

        let (first_vpn, num_pages) = if flags.contains(SFlags::ALLOC) {
            (
                vaddr as usize / page_size,
                (size as usize + page_size - 1) / page_size,
            )
        } else {
            (0, 0)
        };
        Ok((
            name_index,
            Self {
                name: String::new(),
                stype,
                flags,
                vaddr,
                offset: raw.u32(16),
                size,
                addralign: raw.u32(32),
                entsize: raw.u32(36),
                first_vpn,
                num_pages,
            },
        ))
    }

    /// Whether the section occupies memory at run time.
    #[inline]
    pub fn loadable(&self) -> bool {
        self.flags.contains(SFlags::ALLOC)
    }

    /// Whether user-mode writes to this section must trap.
    #[inline]
    pub fn read_only(&self) -> bool {
        self.loadable() && !self.flags.contains(SFlags::WRITE)
    }

    /// Whether the section holds executable code.
    #[inline]
    pub fn executable(&self) -> bool {
        self.flags.contains(SFlags::EXECINSTR)
    }
}
