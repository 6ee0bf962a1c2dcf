//! Contracts of the simulated MIPS machine and its host-side devices.
//!
//! The kernel never decodes instructions itself. An external interpreter
//! (the simulated processor core) executes user code and reports traps back
//! through [`Machine::raise`]; everything the kernel needs from the hardware
//! is here: the register file and MMU state of a user context
//! ([`Processor`]), the physical memory array ([`PhysMemory`]), and the
//! device capabilities ([`FileSystem`], [`Console`], [`Timer`]).
//!
//! There is one simulated CPU. Each user process carries its own
//! [`Processor`] context (the registers and MMU image that a context switch
//! would save and restore); the interpreter multiplexes them.

pub mod console;
pub mod hostfs;

use crate::mm::TranslationEntry;
use crate::sync::Lock;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Total simulated registers: 32 general purpose plus the status registers
/// below.
pub const NUM_REGS: usize = 40;

/// Register names the kernel reads and writes.
///
/// The numbering is the MIPS convention for r0..r31; the registers past 31
/// hold interpreter status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(usize)]
pub enum Register {
    /// Always-zero register.
    Zero = 0,
    /// Syscall number in, result out.
    V0 = 2,
    /// Second result register.
    V1 = 3,
    /// First syscall argument.
    A0 = 4,
    /// Second syscall argument.
    A1 = 5,
    /// Third syscall argument.
    A2 = 6,
    /// Fourth syscall argument.
    A3 = 7,
    /// Stack pointer.
    Sp = 29,
    /// Return address.
    Ra = 31,
    /// Program counter.
    Pc = 34,
    /// Address of the next instruction.
    NextPc = 35,
    /// Address of the previously executed instruction.
    PrevPc = 36,
    /// Faulting virtual address of the last memory trap.
    BadVAddr = 39,
}

/// Trap causes the kernel services. The set is closed: a raw cause
/// outside it fails to decode in [`Machine::raise_cause`] and is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum Trap {
    /// A syscall instruction was executed.
    Syscall = 1,
    /// No translation for the referenced page.
    TlbMiss = 2,
    /// A user-mode write through a read-only translation.
    ReadOnly = 3,
    /// Unaligned or otherwise invalid physical access.
    BusError = 4,
    /// Reference to a virtual address outside the address space.
    AddressError = 5,
    /// Undecodable instruction.
    IllegalInstruction = 7,
}

/// What the interpreter should do after a trap was serviced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapOutcome {
    /// Resume the user instruction stream.
    Continue,
    /// The current user thread is done; return from [`Interpreter::run`].
    Finished,
}

/// The saved machine state of one user context: registers, the page table
/// image programmed into the MMU, and the optional software-managed TLB.
pub struct Processor {
    regs: [u32; NUM_REGS],
    page_table: Vec<TranslationEntry>,
    tlb: Option<Vec<TranslationEntry>>,
}

impl Processor {
    fn new(tlb_size: Option<usize>) -> Self {
        Self {
            regs: [0; NUM_REGS],
            page_table: Vec::new(),
            tlb: tlb_size.map(|n| vec![TranslationEntry::invalid(); n]),
        }
    }

    /// Read register `r`.
    #[inline]
    pub fn read_register(&self, r: Register) -> u32 {
        self.regs[usize::from(r)]
    }

    /// Write `value` into register `r`. Writes to `Zero` are discarded.
    #[inline]
    pub fn write_register(&mut self, r: Register, value: u32) {
        if r != Register::Zero {
            self.regs[usize::from(r)] = value;
        }
    }

    /// Zero every register.
    pub fn reset_registers(&mut self) {
        self.regs = [0; NUM_REGS];
    }

    /// Step the program counters past the instruction that trapped.
    pub fn advance_pc(&mut self) {
        let next = self.read_register(Register::NextPc);
        self.write_register(Register::PrevPc, self.read_register(Register::Pc));
        self.write_register(Register::Pc, next);
        self.write_register(Register::NextPc, next.wrapping_add(4));
    }

    /// Program the MMU with `table`.
    pub fn set_page_table(&mut self, table: Vec<TranslationEntry>) {
        self.page_table = table;
    }

    /// The page table currently programmed into the MMU.
    pub fn page_table(&self) -> &[TranslationEntry] {
        &self.page_table
    }

    /// Mutable view of the programmed page table, for servicing faults.
    pub fn page_table_mut(&mut self) -> &mut [TranslationEntry] {
        &mut self.page_table
    }

    /// Invalidate every TLB entry.
    pub fn tlb_flush(&mut self) {
        if let Some(tlb) = self.tlb.as_mut() {
            for entry in tlb.iter_mut() {
                *entry = TranslationEntry::invalid();
            }
        }
    }

    /// Install `entry` into TLB slot `index`.
    ///
    /// Panics if the machine has no TLB or the slot is out of range.
    pub fn tlb_set(&mut self, index: usize, entry: TranslationEntry) {
        self.tlb.as_mut().expect("machine has no tlb")[index] = entry;
    }

    /// The TLB contents, if this machine has one.
    pub fn tlb(&self) -> Option<&[TranslationEntry]> {
        self.tlb.as_deref()
    }
}

/// The simulated physical memory: `num_frames` frames of `page_size` bytes.
///
/// All kernel-driven transfers go through the frame-relative copy helpers;
/// offsets are validated against the frame boundary, so a bad translation
/// can never silently spill into a neighboring frame.
pub struct PhysMemory {
    page_size: usize,
    num_frames: usize,
    bytes: Lock<Box<[u8]>>,
}

impl PhysMemory {
    fn new(num_frames: usize, page_size: usize) -> Self {
        assert!(page_size.is_power_of_two());
        Self {
            page_size,
            num_frames,
            bytes: Lock::new(vec![0; num_frames * page_size].into_boxed_slice()),
        }
    }

    /// Bytes per page.
    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of physical frames.
    #[inline]
    pub fn num_frames(&self) -> usize {
        self.num_frames
    }

    /// Copy bytes out of frame `ppn` starting at `offset`.
    pub fn read(&self, ppn: usize, offset: usize, buf: &mut [u8]) {
        let base = self.frame_range(ppn, offset, buf.len());
        buf.copy_from_slice(&self.bytes.lock()[base..base + buf.len()]);
    }

    /// Copy bytes into frame `ppn` starting at `offset`.
    pub fn write(&self, ppn: usize, offset: usize, buf: &[u8]) {
        let base = self.frame_range(ppn, offset, buf.len());
        self.bytes.lock()[base..base + buf.len()].copy_from_slice(buf);
    }

    /// Zero-fill frame `ppn`.
    pub fn zero_frame(&self, ppn: usize) {
        assert!(ppn < self.num_frames);
        let base = ppn * self.page_size;
        self.bytes.lock()[base..base + self.page_size].fill(0);
    }

    fn frame_range(&self, ppn: usize, offset: usize, len: usize) -> usize {
        assert!(ppn < self.num_frames, "frame {} out of range", ppn);
        assert!(
            offset + len <= self.page_size,
            "access crosses frame boundary"
        );
        ppn * self.page_size + offset
    }
}

/// Geometry of the simulated machine.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Bytes per page; must be a power of two.
    pub page_size: usize,
    /// Number of physical frames.
    pub num_frames: usize,
    /// TLB slots, or `None` for a machine without a software TLB.
    pub tlb_size: Option<usize>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            page_size: 1024,
            num_frames: 32,
            tlb_size: None,
        }
    }
}

type TrapHandler = Arc<dyn Fn(Trap) -> TrapOutcome + Send + Sync>;

/// The simulated machine: physical memory, the halt latch, the registered
/// exception handler, and the external instruction interpreter.
pub struct Machine {
    config: MachineConfig,
    memory: PhysMemory,
    timer: Arc<dyn Timer>,
    interpreter: Box<dyn Interpreter>,
    handler: Lock<Option<TrapHandler>>,
    halted: AtomicBool,
}

impl Machine {
    /// Build a machine with the given geometry, timer and interpreter core.
    pub fn new(
        config: MachineConfig,
        timer: Arc<dyn Timer>,
        interpreter: Box<dyn Interpreter>,
    ) -> Arc<Self> {
        let memory = PhysMemory::new(config.num_frames, config.page_size);
        Arc::new(Self {
            config,
            memory,
            timer,
            interpreter,
            handler: Lock::new(None),
            halted: AtomicBool::new(false),
        })
    }

    /// Bytes per page.
    #[inline]
    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    /// The physical memory array.
    #[inline]
    pub fn memory(&self) -> &PhysMemory {
        &self.memory
    }

    /// A fresh user context for this machine.
    pub fn new_processor(&self) -> Lock<Processor> {
        Lock::new(Processor::new(self.config.tlb_size))
    }

    /// Register the kernel's exception handler. The previous handler, if
    /// any, is replaced.
    pub fn set_exception_handler(
        &self,
        handler: impl Fn(Trap) -> TrapOutcome + Send + Sync + 'static,
    ) {
        *self.handler.lock() = Some(Arc::new(handler));
    }

    /// Deliver a trap from the interpreter to the kernel.
    ///
    /// Panics if no handler is registered; a machine without a kernel
    /// cannot make progress.
    pub fn raise(&self, trap: Trap) -> TrapOutcome {
        let handler = self
            .handler
            .lock()
            .clone()
            .expect("no exception handler registered");
        handler(trap)
    }

    /// Deliver a trap by its raw cause number.
    ///
    /// Panics on a cause outside the [`Trap`] set. The panic crosses the
    /// user thread's kernel boundary, which halts the machine: an
    /// unrecognized cause is a simulator bug, never a per-process error.
    pub fn raise_cause(&self, cause: u32) -> TrapOutcome {
        match Trap::try_from(cause) {
            Ok(trap) => self.raise(trap),
            Err(_) => panic!("unrecognized trap cause {}", cause),
        }
    }

    /// Enter user mode on `ctx`, returning when the kernel finishes the
    /// current user thread or the machine halts.
    pub fn run(&self, ctx: &Lock<Processor>) {
        self.interpreter.run(self, ctx);
    }

    /// Latch the halt flag. Interpreters observe it and stop.
    pub fn halt(&self) {
        log::info!("machine halting at tick {}", self.time());
        self.halted.store(true, Ordering::SeqCst);
    }

    /// Whether [`Machine::halt`] has been called.
    #[inline]
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Current simulated time.
    #[inline]
    pub fn time(&self) -> u64 {
        self.timer.time()
    }
}

/// The external MIPS interpreter core.
///
/// `run` executes user instructions from `ctx` and reports every trap
/// through [`Machine::raise`], returning when a trap handler answers
/// [`TrapOutcome::Finished`] or the machine halts.
pub trait Interpreter: Send + Sync {
    /// Drive the user context until its thread is done.
    fn run(&self, machine: &Machine, ctx: &Lock<Processor>);
}

impl<T: Interpreter + ?Sized> Interpreter for Arc<T> {
    fn run(&self, machine: &Machine, ctx: &Lock<Processor>) {
        (**self).run(machine, ctx)
    }
}

/// Errors surfaced by device and file operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// The underlying host device failed.
    Device,
    /// The operation is not supported by this handle.
    Unsupported,
}

/// An open file handle from the host file system.
///
/// Handles keep their own position; the host serializes per-file
/// operations, so all methods take `&self`. Dropping the last handle closes
/// the file.
pub trait OpenFile: Send + Sync {
    /// The name the file was opened with.
    fn name(&self) -> &str;
    /// Read up to `buf.len()` bytes at the current position. `Ok(0)` means
    /// end of file.
    fn read(&self, buf: &mut [u8]) -> Result<usize, IoError>;
    /// Write `buf` at the current position, returning the bytes written.
    fn write(&self, buf: &[u8]) -> Result<usize, IoError>;
    /// Move the position to `pos` bytes from the start.
    fn seek(&self, pos: usize);
}

/// The host file system capability.
pub trait FileSystem: Send + Sync {
    /// Open `name`. With `create`, the file is created (or truncated) first;
    /// without it, missing files yield `None`.
    fn open(&self, name: &str, create: bool) -> Option<Arc<dyn OpenFile>>;
    /// Delete `name`, returning whether it existed.
    fn remove(&self, name: &str) -> bool;
}

/// The synchronized console device. The two directions are exposed as
/// ordinary [`OpenFile`] handles so the syscall layer has a single I/O path.
pub trait Console: Send + Sync {
    /// The read side (user fd 0).
    fn open_for_reading(&self) -> Arc<dyn OpenFile>;
    /// The write side (user fd 1).
    fn open_for_writing(&self) -> Arc<dyn OpenFile>;
}

/// The periodic timer capability. The kernel only samples it for log
/// stamps; the alarm machinery lives outside this crate.
pub trait Timer: Send + Sync {
    /// Monotonic tick count.
    fn time(&self) -> u64;
}

/// A [`Timer`] over the host monotonic clock, one tick per microsecond.
pub struct HostTimer {
    origin: std::time::Instant,
}

impl HostTimer {
    /// Create a timer starting at tick zero.
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

impl Default for HostTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer for HostTimer {
    fn time(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}
