//! The 52-byte ELF32 file header.

use super::{ElfError, Raw};

/// Size of an ELF32 file header.
pub const EHDR_SIZE: usize = 52;

const MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const CLASS_32: u8 = 1;
const DATA_LE: u8 = 1;
const TYPE_EXEC: u16 = 2;

/// Decoded file header fields the loader consumes.
///
/// Half-words zero-extend to 32 bits; everything is unsigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Entry-point virtual address.
    pub entry: u32,
    /// File offset of the program-header table.
    pub phoff: u32,
    /// Size of one program-header entry.
    pub phentsize: u32,
    /// Number of program headers.
    pub phnum: u32,
    /// File offset of the section-header table.
    pub shoff: u32,
    /// Size of one section-header entry.
    pub shentsize: u32,
    /// Number of section headers.
    pub shnum: u32,
    /// Index of the section-name string table.
    pub shstrndx: u32,
}

impl Header {
    /// Decode and validate a file header.
    ///
    /// Rejects anything that is not a little-endian 32-bit executable with
    /// a plausible header size.
    pub fn parse(bytes: &[u8; EHDR_SIZE]) -> Result<Self, ElfError> {
        if bytes[0..4] != MAGIC || bytes[4] != CLASS_32 || bytes[5] != DATA_LE {
            return Err(ElfError::BadFormat);
        }
        let raw = Raw(bytes);
        if raw.u16(16) != TYPE_EXEC {
            return Err(ElfError::BadFormat);
        }
        let ehsize = raw.u16(40) as usize;
        if ehsize < EHDR_SIZE {
            return Err(ElfError::BadFormat);
        }
        Ok(Self {
            entry: raw.u32(24),
            phoff: raw.u32(28),
            phentsize: raw.u16(42) as u32,
            phnum: raw.u16(44) as u32,
            shoff: raw.u32(32),
            shentsize: raw.u16(46) as u32,
            shnum: raw.u16(48) as u32,
            shstrndx: raw.u16(50) as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_header() -> [u8; EHDR_SIZE] {
        let mut b = [0u8; EHDR_SIZE];
        b[0..4].copy_from_slice(&MAGIC);
        b[4] = CLASS_32;
        b[5] = DATA_LE;
        b[16..18].copy_from_slice(&TYPE_EXEC.to_le_bytes());
        b[24..28].copy_from_slice(&0x1000u32.to_le_bytes()); // entry
        b[40..42].copy_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        b
    }

    #[test]
    fn accepts_little_endian_exec() {
        let h = Header::parse(&valid_header()).unwrap();
        assert_eq!(h.entry, 0x1000);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut b = valid_header();
        b[0] = 0;
        assert_eq!(Header::parse(&b), Err(ElfError::BadFormat));
    }

    #[test]
    fn rejects_64_bit_class() {
        let mut b = valid_header();
        b[4] = 2;
        assert_eq!(Header::parse(&b), Err(ElfError::BadFormat));
    }

    #[test]
    fn rejects_big_endian() {
        let mut b = valid_header();
        b[5] = 2;
        assert_eq!(Header::parse(&b), Err(ElfError::BadFormat));
    }

    #[test]
    fn rejects_short_header_size() {
        let mut b = valid_header();
        b[40..42].copy_from_slice(&40u16.to_le_bytes());
        assert_eq!(Header::parse(&b), Err(ElfError::BadFormat));
    }
}
