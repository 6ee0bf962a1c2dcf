//! ELF32 executable reader.
//!
//! Parses the header, section and program headers of a little-endian
//! 32-bit executable and exposes the loadable sections to the address-space
//! builder. All integer fields are decoded explicitly little-endian from
//! raw bytes, so a malformed image can fail only with [`ElfError`], never
//! by faulting the kernel.

mod header;
mod phdr;
mod shdr;

pub use header::Header;
pub use phdr::{PType, ProgramHeader};
pub use shdr::{SFlags, SType, Section};

use crate::machine::OpenFile;
use std::sync::Arc;

/// Errors surfaced while reading an executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    /// The image is not a little-endian 32-bit executable, or its tables
    /// are inconsistent or truncated.
    BadFormat,
    /// The underlying file failed.
    Io,
}

/// Little-endian field access into a raw header.
pub(crate) struct Raw<'a>(pub &'a [u8]);

impl Raw<'_> {
    #[inline]
    pub fn u16(&self, pos: usize) -> u16 {
        u16::from_le_bytes(self.0[pos..pos + 2].try_into().unwrap())
    }

    #[inline]
    pub fn u32(&self, pos: usize) -> u32 {
        u32::from_le_bytes(self.0[pos..pos + 4].try_into().unwrap())
    }
}

/// A parsed executable, held open for page loads.
pub struct Elf {
    file: Arc<dyn OpenFile>,
    page_size: usize,
    header: Header,
    sections: Vec<Section>,
    phdrs: Vec<ProgramHeader>,
}

impl Elf {
    /// Parse the executable in `file`.
    ///
    /// Reads the file header, every section header past index 0 (resolving
    /// names through the section-name string table), and every program
    /// header. The file handle stays open for [`Elf::load_page`].
    pub fn from_file(file: Arc<dyn OpenFile>, page_size: usize) -> Result<Self, ElfError> {
        let mut ehdr = [0u8; header::EHDR_SIZE];
        read_exact_at(file.as_ref(), 0, &mut ehdr)?;
        let header = Header::parse(&ehdr)?;

        // Raw section table, index 0 included so shstrndx indexes line up.
        let mut raw_sections = Vec::new();
        if header.shnum > 0 {
            if (header.shentsize as usize) < shdr::SHDR_SIZE {
                return Err(ElfError::BadFormat);
            }
            for i in 0..header.shnum {
                let mut bytes = [0u8; shdr::SHDR_SIZE];
                let off = header.shoff as usize + i as usize * header.shentsize as usize;
                read_exact_at(file.as_ref(), off, &mut bytes)?;
                raw_sections.push(Section::parse(&bytes, page_size)?);
            }
        }

        // Section names live in the string-table section named by the
        // header; a zero index means the image carries no names.
        let strtab = match raw_sections.get(header.shstrndx as usize) {
            Some((_, s)) if header.shstrndx != 0 => {
                let mut bytes = vec![0u8; s.size as usize];
                read_exact_at(file.as_ref(), s.offset as usize, &mut bytes)?;
                bytes
            }
            _ => Vec::new(),
        };

        let mut sections = Vec::new();
        for (name_index, mut section) in raw_sections.into_iter().skip(1) {
            section.name = string_at(&strtab, name_index as usize);
            sections.push(section);
        }

        let mut phdrs = Vec::new();
        if header.phnum > 0 {
            if (header.phentsize as usize) < phdr::PHDR_SIZE {
                return Err(ElfError::BadFormat);
            }
            for i in 0..header.phnum {
                let mut bytes = [0u8; phdr::PHDR_SIZE];
                let off = header.phoff as usize + i as usize * header.phentsize as usize;
                read_exact_at(file.as_ref(), off, &mut bytes)?;
                let ph = ProgramHeader::parse(&bytes);
                ph.check()?;
                phdrs.push(ph);
            }
        }

        Ok(Self {
            file,
            page_size,
            header,
            sections,
            phdrs,
        })
    }

    /// Entry-point virtual address.
    #[inline]
    pub fn entry(&self) -> u32 {
        self.header.entry
    }

    /// The sections of the image, file order, index 0 excluded.
    #[inline]
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// The program headers of the image.
    #[inline]
    pub fn program_headers(&self) -> &[ProgramHeader] {
        &self.phdrs
    }

    /// The first program header of type `ty`, if any.
    pub fn program_entry(&self, ty: PType) -> Option<&ProgramHeader> {
        self.phdrs.iter().find(|p| p.type_() == Some(ty))
    }

    /// Copy page `spn` of section `sx` into `frame`.
    ///
    /// `frame` must be exactly one page. NOBITS sections are zero-filled;
    /// otherwise the bytes the section still has at that page offset are
    /// read from the file and the rest of the frame is zeroed. A section
    /// whose size is an exact multiple of the page size fills its last
    /// page completely.
    pub fn load_page(&self, sx: usize, spn: usize, frame: &mut [u8]) -> Result<(), ElfError> {
        assert_eq!(frame.len(), self.page_size);
        let section = &self.sections[sx];
        assert!(spn < section.num_pages, "page {} outside section", spn);

        frame.fill(0);
        if section.stype == SType::Nobits {
            return Ok(());
        }
        let page_off = spn * self.page_size;
        let n = (section.size as usize - page_off).min(self.page_size);
        read_exact_at(
            self.file.as_ref(),
            section.offset as usize + page_off,
            &mut frame[..n],
        )
    }
}

fn string_at(strtab: &[u8], index: usize) -> String {
    if index >= strtab.len() {
        return String::new();
    }
    let bytes = &strtab[index..];
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn read_exact_at(file: &dyn OpenFile, off: usize, buf: &mut [u8]) -> Result<(), ElfError> {
    file.seek(off);
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => return Err(ElfError::BadFormat),
            Ok(n) => filled += n,
            Err(_) => return Err(ElfError::Io),
        }
    }
    Ok(())
}
