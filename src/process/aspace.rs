//! Per-process virtual address spaces.
//!
//! An address space is built by `load`: the executable's loadable sections
//! occupy the low virtual pages (they must be contiguous from vpn 0), then
//! come the stack pages, and the final page holds the argument vector. The
//! eager kernel materializes every page at load time; under demand paging
//! the table starts empty and pages are faulted in, so the ELF handle stays
//! open for the life of the process.
//!
//! `read_vm`/`write_vm` are the only paths the kernel uses to touch user
//! memory. They copy as much as the address space allows and report the
//! transferred prefix, so a bad user pointer can never take the kernel
//! down.

use super::Pid;
use crate::elf::{Elf, ElfError, PType};
use crate::kernel::Kernel;
use crate::machine::Processor;
use crate::mm::{EntryFlags, TranslationEntry};
use crate::vm::{PageSource, PinnedPage};

/// Reasons a program fails to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    /// The executable does not exist.
    NoSuchFile,
    /// The image is not a loadable little-endian ELF32 executable.
    BadFormat,
    /// Loadable sections are not contiguous starting at vpn 0.
    Fragmented,
    /// The argument vector does not fit in one page.
    ArgsTooLong,
    /// Not enough free frames for the image.
    OutOfMemory,
}

impl From<ElfError> for LoadError {
    fn from(_: ElfError) -> Self {
        LoadError::BadFormat
    }
}

/// Page-fault resolution failure; the faulting process is killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFaultError {
    /// The faulting page is outside the address space.
    OutOfRange,
}

/// The pages one loadable section occupies.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SectionSpan {
    /// Index into the ELF section table.
    pub index: usize,
    /// First virtual page of the section.
    pub first_vpn: usize,
    /// Pages the section covers.
    pub num_pages: usize,
    /// Whether user writes to these pages trap.
    pub read_only: bool,
    /// Whether the section holds code.
    pub executable: bool,
}

impl SectionSpan {
    pub(crate) fn contains(&self, vpn: usize) -> bool {
        (self.first_vpn..self.first_vpn + self.num_pages).contains(&vpn)
    }
}

/// A process's virtual address space.
pub struct AddressSpace {
    pid: Pid,
    page_size: usize,
    num_pages: usize,
    page_table: Vec<TranslationEntry>,
    sections: Vec<SectionSpan>,
    elf: Option<Elf>,
    entry_pc: u32,
    initial_sp: u32,
    argc: u32,
    argv: u32,
}

enum FrameRef<'a> {
    Direct(usize),
    Pinned(PinnedPage<'a>),
}

impl FrameRef<'_> {
    fn ppn(&self) -> usize {
        match self {
            FrameRef::Direct(ppn) => *ppn,
            FrameRef::Pinned(pin) => pin.ppn(),
        }
    }
}

impl AddressSpace {
    /// Build the address space for `name` with arguments `args`.
    ///
    /// Opens the executable, verifies its layout, sizes the image
    /// (sections + stack + argv page), reserves memory, and writes the
    /// argument vector. On any failure everything taken so far is
    /// released.
    pub(crate) fn load(
        k: &Kernel,
        pid: Pid,
        name: &str,
        args: &[String],
    ) -> Result<AddressSpace, LoadError> {
        let page_size = k.machine().page_size();
        let file = k.fs().open(name, false).ok_or(LoadError::NoSuchFile)?;
        let elf = Elf::from_file(file, page_size)?;

        // Loadable sections must tile the low pages without holes.
        let mut image_pages = 0;
        let mut sections = Vec::new();
        for (index, section) in elf.sections().iter().enumerate() {
            if !section.loadable() {
                continue;
            }
            if section.first_vpn != image_pages {
                log::debug!(
                    "load {}: section {} starts at vpn {}, expected {}",
                    name,
                    section.name,
                    section.first_vpn,
                    image_pages
                );
                return Err(LoadError::Fragmented);
            }
            sections.push(SectionSpan {
                index,
                first_vpn: section.first_vpn,
                num_pages: section.num_pages,
                read_only: section.read_only(),
                executable: section.executable(),
            });
            image_pages += section.num_pages;
        }

        // The LOAD segment must fit in the pages the sections claim.
        if let Some(load) = elf.program_entry(PType::Load) {
            if load.memsz as usize > image_pages * page_size {
                return Err(LoadError::BadFormat);
            }
        }

        let argv_bytes: usize = args.iter().map(|a| 4 + a.len() + 1).sum();
        if argv_bytes > page_size {
            return Err(LoadError::ArgsTooLong);
        }

        let num_pages = image_pages + k.config().stack_pages + 1;
        let entry_pc = elf.entry();
        let mut aspace = AddressSpace {
            pid,
            page_size,
            num_pages,
            page_table: (0..num_pages)
                .map(|vpn| TranslationEntry {
                    vpn,
                    ..TranslationEntry::invalid()
                })
                .collect(),
            sections,
            elf: Some(elf),
            entry_pc,
            initial_sp: (num_pages * page_size) as u32,
            argc: args.len() as u32,
            argv: ((num_pages - 1) * page_size) as u32,
        };

        let populated = if k.vm().is_some() {
            // Demand paging: nothing resident yet; writing argv faults in
            // the argv page. The ELF stays open for section faults.
            aspace.write_argv(k, args);
            Ok(())
        } else {
            let r = aspace.populate_eager(k, image_pages, args);
            if r.is_ok() {
                // Fully loaded; the executable is no longer needed.
                aspace.elf = None;
            }
            r
        };
        match populated {
            Ok(()) => Ok(aspace),
            Err(e) => {
                aspace.unload(k);
                Err(e)
            }
        }
    }

    fn populate_eager(
        &mut self,
        k: &Kernel,
        image_pages: usize,
        args: &[String],
    ) -> Result<(), LoadError> {
        let mem = k.machine().memory();
        let ppns = k
            .frames()
            .allocate(self.pid, self.num_pages)
            .map_err(|_| LoadError::OutOfMemory)?;

        for vpn in 0..self.num_pages {
            let read_only = self
                .sections
                .iter()
                .any(|s| s.contains(vpn) && s.read_only);
            self.page_table[vpn] = TranslationEntry::new(vpn, ppns[vpn], read_only);
        }

        let elf = self.elf.as_ref().expect("executable closed during load");
        let mut buf = vec![0u8; self.page_size];
        for span in &self.sections {
            for spn in 0..span.num_pages {
                elf.load_page(span.index, spn, &mut buf)?;
                mem.write(ppns[span.first_vpn + spn], 0, &buf);
            }
        }
        // Stack and argv frames may be recycled; scrub them.
        for vpn in image_pages..self.num_pages {
            mem.zero_frame(ppns[vpn]);
        }
        self.write_argv(k, args);
        Ok(())
    }

    /// Write the argument vector into the last page: `argc` little-endian
    /// pointers, then the NUL-terminated strings they point at.
    fn write_argv(&mut self, k: &Kernel, args: &[String]) {
        let mut bytes = Vec::new();
        let strings_base = self.argv + 4 * args.len() as u32;
        let mut offset = 0u32;
        for arg in args {
            bytes.extend_from_slice(&(strings_base + offset).to_le_bytes());
            offset += arg.len() as u32 + 1;
        }
        for arg in args {
            bytes.extend_from_slice(arg.as_bytes());
            bytes.push(0);
        }
        let written = self.write_vm(k, self.argv, &bytes);
        assert_eq!(written, bytes.len(), "argv page write fell short");
    }

    /// Program `ctx` for the first user instruction: PC at the entry
    /// point, SP at the top of the address space, argc/argv in a0/a1,
    /// everything else zero.
    pub(crate) fn init_context(&self, ctx: &mut Processor) {
        use crate::machine::Register;
        ctx.reset_registers();
        ctx.write_register(Register::Pc, self.entry_pc);
        ctx.write_register(Register::NextPc, self.entry_pc.wrapping_add(4));
        ctx.write_register(Register::Sp, self.initial_sp);
        ctx.write_register(Register::A0, self.argc);
        ctx.write_register(Register::A1, self.argv);
        ctx.set_page_table(self.page_table.clone());
    }

    /// Called when this process's thread is handed the CPU. Under demand
    /// paging the inverted table is authoritative: the local table is
    /// resynchronized from it and the TLB is flushed.
    pub(crate) fn restore_state(&mut self, k: &Kernel, ctx: &mut Processor) {
        if let Some(vm) = k.vm() {
            vm.sync_table(self.pid, &mut self.page_table);
            ctx.tlb_flush();
        }
        ctx.set_page_table(self.page_table.clone());
    }

    /// Resolve a fault on `vpn`: make the page resident and reprogram the
    /// MMU image for it.
    pub(crate) fn handle_fault(
        &mut self,
        k: &Kernel,
        ctx: &mut Processor,
        vpn: usize,
    ) -> Result<(), PageFaultError> {
        let vm = k.vm().expect("page fault without demand paging");
        if vpn >= self.num_pages {
            return Err(PageFaultError::OutOfRange);
        }
        let src = PageSource {
            pid: self.pid,
            sections: &self.sections,
            elf: self.elf.as_ref(),
        };
        let pin = vm
            .pin_page(k, &src, vpn, false)
            .expect("read fault cannot hit a permission check");
        let mut entry = TranslationEntry::new(vpn, pin.ppn(), pin.read_only());
        entry.flags |= EntryFlags::USED;
        self.page_table[vpn] = entry;
        ctx.page_table_mut()[vpn] = entry;
        if let Some(len) = ctx.tlb().map(|t| t.len()) {
            ctx.tlb_set(vpn % len, entry);
        }
        Ok(())
    }

    fn frame_for<'a>(&mut self, k: &'a Kernel, vpn: usize, write: bool) -> Option<FrameRef<'a>> {
        if let Some(vm) = k.vm() {
            let src = PageSource {
                pid: self.pid,
                sections: &self.sections,
                elf: self.elf.as_ref(),
            };
            return vm.pin_page(k, &src, vpn, write).ok().map(FrameRef::Pinned);
        }
        let entry = self.page_table.get_mut(vpn)?;
        if !entry.is_valid() || (write && entry.is_read_only()) {
            return None;
        }
        entry.flags |= EntryFlags::USED;
        if write {
            entry.flags |= EntryFlags::DIRTY;
        }
        Some(FrameRef::Direct(entry.ppn))
    }

    /// Copy bytes out of this address space into `buf`, starting at
    /// `vaddr`. Returns how many bytes were transferred; the count is
    /// short when the range runs off the end of the address space.
    pub fn read_vm(&mut self, k: &Kernel, vaddr: u32, buf: &mut [u8]) -> usize {
        let page_size = self.page_size;
        let mut done = 0;
        while done < buf.len() {
            let va = vaddr as usize + done;
            let (vpn, offset) = (va / page_size, va % page_size);
            if vpn >= self.num_pages {
                break;
            }
            let chunk = (page_size - offset).min(buf.len() - done);
            match self.frame_for(k, vpn, false) {
                Some(frame) => {
                    k.machine()
                        .memory()
                        .read(frame.ppn(), offset, &mut buf[done..done + chunk]);
                }
                None => break,
            }
            done += chunk;
        }
        done
    }

    /// Copy `buf` into this address space at `vaddr`. Returns how many
    /// bytes were transferred; the count is short when the range runs off
    /// the end of the address space or hits a read-only page.
    pub fn write_vm(&mut self, k: &Kernel, vaddr: u32, buf: &[u8]) -> usize {
        let page_size = self.page_size;
        let mut done = 0;
        while done < buf.len() {
            let va = vaddr as usize + done;
            let (vpn, offset) = (va / page_size, va % page_size);
            if vpn >= self.num_pages {
                break;
            }
            let chunk = (page_size - offset).min(buf.len() - done);
            match self.frame_for(k, vpn, true) {
                Some(frame) => {
                    k.machine()
                        .memory()
                        .write(frame.ppn(), offset, &buf[done..done + chunk]);
                }
                None => break,
            }
            done += chunk;
        }
        done
    }

    /// Read a NUL-terminated string of at most `max_len` bytes starting at
    /// `vaddr`. `None` when no NUL shows up in the window or the address
    /// is bad.
    pub fn read_vm_string(&mut self, k: &Kernel, vaddr: u32, max_len: usize) -> Option<String> {
        let mut bytes = vec![0u8; max_len + 1];
        let got = self.read_vm(k, vaddr, &mut bytes);
        let nul = bytes[..got].iter().position(|&b| b == 0)?;
        Some(String::from_utf8_lossy(&bytes[..nul]).into_owned())
    }

    /// Release every frame and swap slot this address space holds.
    pub(crate) fn unload(&mut self, k: &Kernel) {
        if let Some(vm) = k.vm() {
            vm.release_process(self.pid);
        }
        k.frames().free_all(self.pid);
        for entry in self.page_table.iter_mut() {
            entry.flags = EntryFlags::empty();
        }
        self.elf = None;
    }

    /// Total pages, argv page included.
    #[inline]
    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    /// Entry-point PC.
    #[inline]
    pub fn entry_pc(&self) -> u32 {
        self.entry_pc
    }

    /// Initial stack pointer: the top of the address space.
    #[inline]
    pub fn initial_sp(&self) -> u32 {
        self.initial_sp
    }

    /// Number of arguments.
    #[inline]
    pub fn argc(&self) -> u32 {
        self.argc
    }

    /// Virtual address of the argv pointer array.
    #[inline]
    pub fn argv(&self) -> u32 {
        self.argv
    }

    /// The translation entries, for inspection.
    pub fn page_table(&self) -> &[TranslationEntry] {
        &self.page_table
    }

    pub(crate) fn pid(&self) -> Pid {
        self.pid
    }

    pub(crate) fn sections(&self) -> &[SectionSpan] {
        &self.sections
    }

    pub(crate) fn elf(&self) -> Option<&Elf> {
        self.elf.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelConfig;
    use crate::machine::MachineConfig;
    use crate::test_util::{ElfImage, Harness};

    const PAGE: usize = 256;

    fn harness(frames: usize) -> Harness {
        Harness::new(
            MachineConfig {
                page_size: PAGE,
                num_frames: frames,
                tlb_size: None,
            },
            b"",
        )
    }

    fn simple_image() -> Vec<u8> {
        // One read-only code page, one writable data page.
        ElfImage::new(PAGE, 0x40)
            .text(0, &[0xaa; PAGE])
            .data(PAGE as u32, b"hello from data")
            .build()
    }

    #[test]
    fn eager_load_builds_a_full_table() {
        let h = harness(16);
        let k = h.boot(KernelConfig::default());
        h.fs.install("prog", simple_image());

        let aspace = AddressSpace::load(&k, Pid(1), "prog", &[]).unwrap();
        // 2 image pages + 8 stack pages + argv page.
        assert_eq!(aspace.num_pages(), 11);
        assert_eq!(aspace.entry_pc(), 0x40);
        assert_eq!(aspace.initial_sp(), (11 * PAGE) as u32);
        assert!(aspace.page_table().iter().all(|e| e.is_valid()));
        assert!(aspace.page_table()[0].is_read_only());
        assert!(!aspace.page_table()[1].is_read_only());
        assert_eq!(k.frames().owned_by(Pid(1)).len(), 11);
        // Fully loaded, so the executable is closed.
        assert!(aspace.elf().is_none());
    }

    #[test]
    fn load_rejects_missing_and_malformed_files() {
        let h = harness(16);
        let k = h.boot(KernelConfig::default());
        assert_eq!(
            AddressSpace::load(&k, Pid(1), "nothing", &[]).err(),
            Some(LoadError::NoSuchFile)
        );
        h.fs.install("garbage", vec![0u8; 128]);
        assert_eq!(
            AddressSpace::load(&k, Pid(1), "garbage", &[]).err(),
            Some(LoadError::BadFormat)
        );
    }

    #[test]
    fn load_rejects_fragmented_images() {
        let h = harness(16);
        let k = h.boot(KernelConfig::default());
        // Data starts two pages past the end of text.
        let image = ElfImage::new(PAGE, 0)
            .text(0, &[0xaa; PAGE])
            .data(3 * PAGE as u32, &[1, 2, 3])
            .build();
        h.fs.install("prog", image);
        assert_eq!(
            AddressSpace::load(&k, Pid(1), "prog", &[]).err(),
            Some(LoadError::Fragmented)
        );
    }

    #[test]
    fn load_rejects_oversized_argv() {
        let h = harness(16);
        let k = h.boot(KernelConfig::default());
        h.fs.install("prog", simple_image());
        let big = vec!["x".repeat(PAGE); 1];
        assert_eq!(
            AddressSpace::load(&k, Pid(1), "prog", &big).err(),
            Some(LoadError::ArgsTooLong)
        );
    }

    #[test]
    fn load_fails_cleanly_when_memory_is_short() {
        let h = harness(4);
        let k = h.boot(KernelConfig::default());
        h.fs.install("prog", simple_image());
        assert_eq!(
            AddressSpace::load(&k, Pid(1), "prog", &[]).err(),
            Some(LoadError::OutOfMemory)
        );
        // Nothing leaked.
        assert_eq!(k.frames().num_free(), 4);
    }

    #[test]
    fn argv_page_holds_pointers_then_strings() {
        let h = harness(16);
        let k = h.boot(KernelConfig::default());
        h.fs.install("prog", simple_image());
        let args = vec!["prog".to_string(), "xy".to_string()];
        let mut aspace = AddressSpace::load(&k, Pid(1), "prog", &args).unwrap();

        assert_eq!(aspace.argc(), 2);
        let argv = aspace.argv();
        assert_eq!(argv, (10 * PAGE) as u32);

        let mut raw = [0u8; 8];
        assert_eq!(aspace.read_vm(&k, argv, &mut raw), 8);
        let p0 = u32::from_le_bytes(raw[0..4].try_into().unwrap());
        let p1 = u32::from_le_bytes(raw[4..8].try_into().unwrap());
        assert_eq!(p0, argv + 8);
        assert_eq!(p1, argv + 8 + 5);
        assert_eq!(aspace.read_vm_string(&k, p0, 64), Some("prog".to_string()));
        assert_eq!(aspace.read_vm_string(&k, p1, 64), Some("xy".to_string()));
    }

    #[test]
    fn vm_transfer_roundtrips_and_reports_short_counts() {
        let h = harness(16);
        let k = h.boot(KernelConfig::default());
        h.fs.install("prog", simple_image());
        let mut aspace = AddressSpace::load(&k, Pid(1), "prog", &[]).unwrap();

        // A write that crosses a page boundary comes back intact.
        let data: Vec<u8> = (0..600).map(|i| i as u8).collect();
        let va = (2 * PAGE) as u32 + 100;
        assert_eq!(aspace.write_vm(&k, va, &data), 600);
        let mut back = vec![0u8; 600];
        assert_eq!(aspace.read_vm(&k, va, &mut back), 600);
        assert_eq!(back, data);

        // Running off the end of the address space transfers the prefix.
        let top = aspace.initial_sp() - 4;
        assert_eq!(aspace.write_vm(&k, top, &[1, 2, 3, 4, 5, 6, 7, 8]), 4);
        let mut tail = [0u8; 8];
        assert_eq!(aspace.read_vm(&k, top, &mut tail), 4);
        assert_eq!(&tail[..4], &[1, 2, 3, 4]);

        // Entirely outside: nothing moves.
        assert_eq!(aspace.write_vm(&k, aspace.initial_sp(), &[9]), 0);
    }

    #[test]
    fn write_vm_stops_at_read_only_pages() {
        let h = harness(16);
        let k = h.boot(KernelConfig::default());
        h.fs.install("prog", simple_image());
        let mut aspace = AddressSpace::load(&k, Pid(1), "prog", &[]).unwrap();

        assert_eq!(aspace.write_vm(&k, 0, &[0u8; 16]), 0);
        // A write that starts in writable memory stops at the boundary of
        // a read-only page. Data page is vpn 1; text is vpn 0, so start in
        // data and nothing blocks: instead check the code page kept its
        // bytes.
        let mut code = [0u8; 16];
        assert_eq!(aspace.read_vm(&k, 0, &mut code), 16);
        assert_eq!(code, [0xaa; 16]);
    }

    #[test]
    fn read_vm_string_requires_a_terminator() {
        let h = harness(16);
        let k = h.boot(KernelConfig::default());
        h.fs.install("prog", simple_image());
        let mut aspace = AddressSpace::load(&k, Pid(1), "prog", &[]).unwrap();

        let va = (2 * PAGE) as u32;
        assert_eq!(aspace.write_vm(&k, va, b"hi\0"), 3);
        assert_eq!(aspace.read_vm_string(&k, va, 16), Some("hi".to_string()));
        // No NUL within the window.
        assert_eq!(aspace.write_vm(&k, va, &[b'x'; 20]), 20);
        assert!(aspace.read_vm_string(&k, va, 8).is_none());
    }

    #[test]
    fn unload_returns_every_frame() {
        let h = harness(16);
        let k = h.boot(KernelConfig::default());
        h.fs.install("prog", simple_image());
        let mut aspace = AddressSpace::load(&k, Pid(1), "prog", &[]).unwrap();
        assert!(k.frames().num_free() < 16);
        aspace.unload(&k);
        assert_eq!(k.frames().num_free(), 16);
        assert!(aspace.page_table().iter().all(|e| !e.is_valid()));
    }

    #[test]
    fn init_context_sets_the_documented_registers() {
        use crate::machine::Register;
        let h = harness(16);
        let k = h.boot(KernelConfig::default());
        h.fs.install("prog", simple_image());
        let args = vec!["prog".to_string()];
        let aspace = AddressSpace::load(&k, Pid(1), "prog", &args).unwrap();

        let ctx_lock = h.machine.new_processor();
        let mut ctx = ctx_lock.lock();
        aspace.init_context(&mut ctx);
        assert_eq!(ctx.read_register(Register::Pc), 0x40);
        assert_eq!(ctx.read_register(Register::NextPc), 0x44);
        assert_eq!(ctx.read_register(Register::Sp), aspace.initial_sp());
        assert_eq!(ctx.read_register(Register::A0), 1);
        assert_eq!(ctx.read_register(Register::A1), aspace.argv());
        assert_eq!(ctx.read_register(Register::A2), 0);
        assert_eq!(ctx.page_table().len(), aspace.num_pages());
    }
}
