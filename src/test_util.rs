//! Shared test doubles: an in-memory file system, a loopback console, a
//! byte-level ELF image builder, and a scripted stand-in for the MIPS
//! interpreter that drives syscalls straight through the trap path.

use crate::machine::{
    Console, FileSystem, Interpreter, IoError, Machine, OpenFile, Processor, Register, Trap,
    TrapOutcome,
};
use crate::sync::Lock;
use crate::syscall::Syscall;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

// ---------------------------------------------------------------- MemFs --

type Node = Arc<Lock<Vec<u8>>>;

/// An in-memory [`FileSystem`].
pub struct MemFs {
    files: Lock<HashMap<String, Node>>,
}

impl MemFs {
    pub fn new() -> Self {
        Self {
            files: Lock::new(HashMap::new()),
        }
    }

    /// Drop a file with the given contents into the file system.
    pub fn install(&self, name: &str, bytes: Vec<u8>) {
        self.files
            .lock()
            .insert(name.to_string(), Arc::new(Lock::new(bytes)));
    }

    /// A copy of a file's contents.
    pub fn contents(&self, name: &str) -> Option<Vec<u8>> {
        self.files.lock().get(name).map(|n| n.lock().clone())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.files.lock().contains_key(name)
    }
}

struct MemFile {
    name: String,
    node: Node,
    pos: Lock<usize>,
}

impl OpenFile for MemFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize, IoError> {
        let data = self.node.lock();
        let mut pos = self.pos.lock();
        let n = buf.len().min(data.len().saturating_sub(*pos));
        buf[..n].copy_from_slice(&data[*pos..*pos + n]);
        *pos += n;
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> Result<usize, IoError> {
        let mut data = self.node.lock();
        let mut pos = self.pos.lock();
        let end = *pos + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[*pos..end].copy_from_slice(buf);
        *pos = end;
        Ok(buf.len())
    }

    fn seek(&self, pos: usize) {
        *self.pos.lock() = pos;
    }
}

impl FileSystem for MemFs {
    fn open(&self, name: &str, create: bool) -> Option<Arc<dyn OpenFile>> {
        let mut files = self.files.lock();
        let node = match files.get(name) {
            Some(node) => {
                if create {
                    node.lock().clear();
                }
                node.clone()
            }
            None if create => {
                let node: Node = Arc::new(Lock::new(Vec::new()));
                files.insert(name.to_string(), node.clone());
                node
            }
            None => return None,
        };
        Some(Arc::new(MemFile {
            name: name.to_string(),
            node,
            pos: Lock::new(0),
        }))
    }

    fn remove(&self, name: &str) -> bool {
        self.files.lock().remove(name).is_some()
    }
}

// -------------------------------------------------------------- Console --

/// A loopback [`Console`]: reads come from a pre-filled buffer, writes are
/// captured for inspection.
pub struct PipeConsole {
    input: Arc<Lock<VecDeque<u8>>>,
    output: Arc<Lock<Vec<u8>>>,
}

impl PipeConsole {
    pub fn new(input: &[u8]) -> Self {
        Self {
            input: Arc::new(Lock::new(input.iter().copied().collect())),
            output: Arc::new(Lock::new(Vec::new())),
        }
    }

    /// Everything written to fd 1 so far.
    pub fn output(&self) -> Vec<u8> {
        self.output.lock().clone()
    }
}

struct PipeIn(Arc<Lock<VecDeque<u8>>>);

impl OpenFile for PipeIn {
    fn name(&self) -> &str {
        "console(in)"
    }
    fn read(&self, buf: &mut [u8]) -> Result<usize, IoError> {
        let mut input = self.0.lock();
        let n = buf.len().min(input.len());
        for b in buf[..n].iter_mut() {
            *b = input.pop_front().unwrap();
        }
        Ok(n)
    }
    fn write(&self, _buf: &[u8]) -> Result<usize, IoError> {
        Err(IoError::Unsupported)
    }
    fn seek(&self, _pos: usize) {}
}

struct PipeOut(Arc<Lock<Vec<u8>>>);

impl OpenFile for PipeOut {
    fn name(&self) -> &str {
        "console(out)"
    }
    fn read(&self, _buf: &mut [u8]) -> Result<usize, IoError> {
        Err(IoError::Unsupported)
    }
    fn write(&self, buf: &[u8]) -> Result<usize, IoError> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn seek(&self, _pos: usize) {}
}

impl Console for PipeConsole {
    fn open_for_reading(&self) -> Arc<dyn OpenFile> {
        Arc::new(PipeIn(self.input.clone()))
    }
    fn open_for_writing(&self) -> Arc<dyn OpenFile> {
        Arc::new(PipeOut(self.output.clone()))
    }
}

// --------------------------------------------------------- Interpreters --

/// An interpreter that executes nothing; for tests that drive the kernel
/// directly.
pub struct NullInterpreter;

impl Interpreter for NullInterpreter {
    fn run(&self, _machine: &Machine, _ctx: &Lock<Processor>) {}
}

/// A user program for the scripted interpreter: a closure issuing syscalls
/// through [`UserCtx`].
pub type UserProgram = Arc<dyn Fn(&UserCtx<'_>) + Send + Sync>;

/// Stands in for the MIPS core: each program is a closure keyed by its
/// ELF entry point, and every syscall goes through the real trap path.
pub struct ScriptedInterpreter {
    programs: Lock<HashMap<u32, UserProgram>>,
    kernel: Lock<Option<std::sync::Weak<crate::kernel::Kernel>>>,
}

impl ScriptedInterpreter {
    pub fn new() -> Self {
        Self {
            programs: Lock::new(HashMap::new()),
            kernel: Lock::new(None),
        }
    }

    /// Attach the program body for the executable whose entry point is
    /// `entry_pc`.
    pub fn register(&self, entry_pc: u32, body: impl Fn(&UserCtx<'_>) + Send + Sync + 'static) {
        self.programs.lock().insert(entry_pc, Arc::new(body));
    }

    /// Let scripted programs reach their own memory through the kernel's
    /// translation path, the way user loads and stores would.
    pub fn attach_kernel(&self, kernel: &Arc<crate::kernel::Kernel>) {
        *self.kernel.lock() = Some(Arc::downgrade(kernel));
    }
}

impl Interpreter for ScriptedInterpreter {
    fn run(&self, machine: &Machine, ctx: &Lock<Processor>) {
        let pc = ctx.lock().read_register(Register::Pc);
        let program = self
            .programs
            .lock()
            .get(&pc)
            .cloned()
            .unwrap_or_else(|| panic!("no scripted program with entry {:#x}", pc));
        let user = UserCtx {
            machine,
            ctx,
            kernel: self.kernel.lock().as_ref().and_then(|w| w.upgrade()),
            finished: std::cell::Cell::new(false),
        };
        program(&user);
    }
}

/// The view a scripted program has of its machine context.
pub struct UserCtx<'a> {
    machine: &'a Machine,
    ctx: &'a Lock<Processor>,
    kernel: Option<Arc<crate::kernel::Kernel>>,
    finished: std::cell::Cell<bool>,
}

impl UserCtx<'_> {
    /// Issue a syscall; `None` once the kernel has finished this thread.
    pub fn syscall(&self, no: Syscall, args: [u32; 4]) -> Option<i32> {
        self.syscall_raw(no as u32, args)
    }

    /// Issue a syscall by raw number, legal or not.
    pub fn syscall_raw(&self, no: u32, args: [u32; 4]) -> Option<i32> {
        if self.finished.get() || self.machine.is_halted() {
            return None;
        }
        {
            let mut ctx = self.ctx.lock();
            ctx.write_register(Register::V0, no);
            ctx.write_register(Register::A0, args[0]);
            ctx.write_register(Register::A1, args[1]);
            ctx.write_register(Register::A2, args[2]);
            ctx.write_register(Register::A3, args[3]);
        }
        match self.machine.raise(Trap::Syscall) {
            TrapOutcome::Continue => Some(self.ctx.lock().read_register(Register::V0) as i32),
            TrapOutcome::Finished => {
                self.finished.set(true);
                None
            }
        }
    }

    /// Report a memory trap at `vaddr`, the way the MMU would.
    pub fn fault(&self, trap: Trap, vaddr: u32) -> TrapOutcome {
        if self.finished.get() {
            return TrapOutcome::Finished;
        }
        self.ctx
            .lock()
            .write_register(Register::BadVAddr, vaddr);
        let outcome = self.machine.raise(trap);
        if outcome == TrapOutcome::Finished {
            self.finished.set(true);
        }
        outcome
    }

    /// Read a register of this context.
    pub fn register(&self, r: Register) -> u32 {
        self.ctx.lock().read_register(r)
    }

    /// Load bytes from this program's own memory, through the kernel's
    /// translation path (and its fault path, under paging).
    pub fn read_memory(&self, va: u32, buf: &mut [u8]) -> usize {
        let kernel = self.kernel.as_ref().expect("no kernel attached");
        let process = crate::process::current().expect("no current process");
        let mut st = process.state();
        st.aspace
            .as_mut()
            .map_or(0, |aspace| aspace.read_vm(kernel, va, buf))
    }

    /// Store bytes into this program's own memory, the way user stores
    /// would land.
    pub fn write_memory(&self, va: u32, buf: &[u8]) -> usize {
        let kernel = self.kernel.as_ref().expect("no kernel attached");
        let process = crate::process::current().expect("no current process");
        let mut st = process.state();
        st.aspace
            .as_mut()
            .map_or(0, |aspace| aspace.write_vm(kernel, va, buf))
    }
}

// ------------------------------------------------------------- Harness --

/// A machine, file system and console assembled for end-to-end tests.
pub struct Harness {
    pub fs: Arc<MemFs>,
    pub console: Arc<PipeConsole>,
    pub interp: Arc<ScriptedInterpreter>,
    pub machine: Arc<Machine>,
}

impl Harness {
    pub fn new(config: crate::machine::MachineConfig, console_input: &[u8]) -> Self {
        let fs = Arc::new(MemFs::new());
        let console = Arc::new(PipeConsole::new(console_input));
        let interp = Arc::new(ScriptedInterpreter::new());
        let machine = Machine::new(
            config,
            Arc::new(crate::machine::HostTimer::new()),
            Box::new(interp.clone()),
        );
        Self {
            fs,
            console,
            interp,
            machine,
        }
    }

    /// Boot a kernel over this harness's machine and devices.
    pub fn boot(&self, config: crate::kernel::KernelConfig) -> Arc<crate::kernel::Kernel> {
        let kernel = crate::kernel::Kernel::new(
            self.machine.clone(),
            self.fs.clone(),
            self.console.as_ref(),
            config,
        )
        .expect("kernel boot failed");
        self.interp.attach_kernel(&kernel);
        kernel
    }
}

// ------------------------------------------------------------ ElfImage --

const SHT_PROGBITS: u32 = 1;
const SHT_STRTAB: u32 = 3;
const SHT_NOBITS: u32 = 8;
const SHF_WRITE: u32 = 0x1;
const SHF_ALLOC: u32 = 0x2;
const SHF_EXECINSTR: u32 = 0x4;

struct SectionSpec {
    name: &'static str,
    stype: u32,
    flags: u32,
    vaddr: u32,
    data: Vec<u8>,
    size: u32,
}

/// Builds syntactically valid ELF32 images for the loader.
pub struct ElfImage {
    page_size: usize,
    entry: u32,
    sections: Vec<SectionSpec>,
}

impl ElfImage {
    pub fn new(page_size: usize, entry: u32) -> Self {
        Self {
            page_size,
            entry,
            sections: Vec::new(),
        }
    }

    fn push(mut self, name: &'static str, stype: u32, flags: u32, vaddr: u32, data: Vec<u8>, size: u32) -> Self {
        self.sections.push(SectionSpec {
            name,
            stype,
            flags,
            vaddr,
            data,
            size,
        });
        self
    }

    /// Read-only executable code.
    pub fn text(self, vaddr: u32, data: &[u8]) -> Self {
        let size = data.len() as u32;
        self.push(".text", SHT_PROGBITS, SHF_ALLOC | SHF_EXECINSTR, vaddr, data.to_vec(), size)
    }

    /// Writable data.
    pub fn data(self, vaddr: u32, data: &[u8]) -> Self {
        let size = data.len() as u32;
        self.push(".data", SHT_PROGBITS, SHF_ALLOC | SHF_WRITE, vaddr, data.to_vec(), size)
    }

    /// Zero-initialized writable memory with no file contents.
    pub fn bss(self, vaddr: u32, size: u32) -> Self {
        self.push(".bss", SHT_NOBITS, SHF_ALLOC | SHF_WRITE, vaddr, Vec::new(), size)
    }

    /// Serialize the image.
    pub fn build(self) -> Vec<u8> {
        let mut out = vec![0u8; 52 + 32]; // ehdr + one LOAD phdr

        // Section payloads.
        let mut file_offsets = Vec::new();
        for s in &self.sections {
            file_offsets.push(out.len() as u32);
            if s.stype != SHT_NOBITS {
                out.extend_from_slice(&s.data);
            }
        }

        // .shstrtab payload.
        let mut strtab = vec![0u8];
        let mut name_offsets = Vec::new();
        for s in &self.sections {
            name_offsets.push(strtab.len() as u32);
            strtab.extend_from_slice(s.name.as_bytes());
            strtab.push(0);
        }
        let shstr_name = strtab.len() as u32;
        strtab.extend_from_slice(b".shstrtab\0");
        let strtab_off = out.len() as u32;
        let strtab_len = strtab.len() as u32;
        out.extend_from_slice(&strtab);

        // Section header table: null, the sections, .shstrtab.
        let shoff = out.len() as u32;
        let shnum = self.sections.len() as u32 + 2;
        out.extend_from_slice(&[0u8; 40]);
        for (i, s) in self.sections.iter().enumerate() {
            let size = if s.stype == SHT_NOBITS { s.size } else { s.data.len() as u32 };
            out.extend_from_slice(&shdr(
                name_offsets[i],
                s.stype,
                s.flags,
                s.vaddr,
                file_offsets[i],
                size,
                self.page_size as u32,
            ));
        }
        out.extend_from_slice(&shdr(shstr_name, SHT_STRTAB, 0, 0, strtab_off, strtab_len, 1));

        // The LOAD segment spans the ALLOC sections.
        let mut mem_end = 0u32;
        let mut file_end = 0u32;
        let mut load_off = 0u32;
        let mut first = true;
        for (i, s) in self.sections.iter().enumerate() {
            if s.flags & SHF_ALLOC == 0 {
                continue;
            }
            let size = if s.stype == SHT_NOBITS { s.size } else { s.data.len() as u32 };
            if first {
                load_off = file_offsets[i];
                first = false;
            }
            mem_end = mem_end.max(s.vaddr + size);
            if s.stype != SHT_NOBITS {
                file_end = file_end.max(s.vaddr + size);
            }
        }
        let phdr = phdr_load(load_off, 0, file_end, mem_end);
        out[52..84].copy_from_slice(&phdr);

        // File header.
        out[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        out[4] = 1; // 32-bit
        out[5] = 1; // little-endian
        out[6] = 1; // version
        out[16..18].copy_from_slice(&2u16.to_le_bytes()); // EXEC
        out[18..20].copy_from_slice(&8u16.to_le_bytes()); // MIPS
        out[20..24].copy_from_slice(&1u32.to_le_bytes());
        out[24..28].copy_from_slice(&self.entry.to_le_bytes());
        out[28..32].copy_from_slice(&52u32.to_le_bytes()); // phoff
        out[32..36].copy_from_slice(&shoff.to_le_bytes());
        out[40..42].copy_from_slice(&52u16.to_le_bytes()); // ehsize
        out[42..44].copy_from_slice(&32u16.to_le_bytes()); // phentsize
        out[44..46].copy_from_slice(&1u16.to_le_bytes()); // phnum
        out[46..48].copy_from_slice(&40u16.to_le_bytes()); // shentsize
        out[48..50].copy_from_slice(&(shnum as u16).to_le_bytes());
        out[50..52].copy_from_slice(&((shnum - 1) as u16).to_le_bytes()); // shstrndx
        out
    }
}

fn shdr(name: u32, stype: u32, flags: u32, vaddr: u32, offset: u32, size: u32, align: u32) -> [u8; 40] {
    let mut b = [0u8; 40];
    b[0..4].copy_from_slice(&name.to_le_bytes());
    b[4..8].copy_from_slice(&stype.to_le_bytes());
    b[8..12].copy_from_slice(&flags.to_le_bytes());
    b[12..16].copy_from_slice(&vaddr.to_le_bytes());
    b[16..20].copy_from_slice(&offset.to_le_bytes());
    b[20..24].copy_from_slice(&size.to_le_bytes());
    b[32..36].copy_from_slice(&align.to_le_bytes());
    b
}

fn phdr_load(offset: u32, vaddr: u32, filesz: u32, memsz: u32) -> [u8; 32] {
    let mut b = [0u8; 32];
    b[0..4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
    b[4..8].copy_from_slice(&offset.to_le_bytes());
    b[8..12].copy_from_slice(&vaddr.to_le_bytes());
    b[12..16].copy_from_slice(&vaddr.to_le_bytes());
    b[16..20].copy_from_slice(&filesz.to_le_bytes());
    b[20..24].copy_from_slice(&memsz.to_le_bytes());
    b[24..28].copy_from_slice(&7u32.to_le_bytes()); // rwx
    b[28..32].copy_from_slice(&1u32.to_le_bytes());
    b
}
