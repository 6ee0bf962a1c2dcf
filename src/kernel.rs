//! The kernel proper: owns the global tables, wires the machine's trap
//! entry to the handlers, and drives process lifecycle.
//!
//! Global state (frame allocator, process table, paging state) is created
//! here at init and handed to components as capabilities; nothing reaches
//! for ambient globals.

use crate::machine::{Console, FileSystem, Machine, OpenFile, Register, Trap, TrapOutcome};
use crate::mm::FrameAllocator;
use crate::process::aspace::{AddressSpace, LoadError};
use crate::process::{self, ExitStatus, Pid, Process, ProcessTable};
use crate::sync::Lock;
use crate::syscall;
use crate::vm::{SwapStore, VmState};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Tunables of the kernel.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Stack pages reserved above the image.
    pub stack_pages: usize,
    /// Cap on strings read from user memory by syscalls.
    pub max_syscall_arg: usize,
    /// File-descriptor slots per process.
    pub max_open_files: usize,
    /// Demand paging instead of eager loading.
    pub paging: bool,
    /// Swap file capacity in pages.
    pub swap_slots: usize,
    /// Name of the swap file, created at init and removed at halt.
    pub swap_file: String,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            stack_pages: 8,
            max_syscall_arg: 256,
            max_open_files: 16,
            paging: false,
            swap_slots: 64,
            swap_file: "nachos.swp".to_string(),
        }
    }
}

/// Kernel boot failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// The swap file could not be created.
    SwapUnavailable,
}

/// Why `exec` failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    /// No free PID.
    PidExhausted,
    /// The program could not be loaded.
    Load(LoadError),
}

/// The kernel.
pub struct Kernel {
    machine: Arc<Machine>,
    fs: Arc<dyn FileSystem>,
    stdin: Arc<dyn OpenFile>,
    stdout: Arc<dyn OpenFile>,
    frames: FrameAllocator,
    table: ProcessTable,
    vm: Option<VmState>,
    config: KernelConfig,
    threads: Lock<Vec<JoinHandle<()>>>,
}

impl Kernel {
    /// Boot the kernel on `machine`: build the global tables, create the
    /// swap store when paging is on, pre-open the console, and register
    /// the trap handler.
    pub fn new(
        machine: Arc<Machine>,
        fs: Arc<dyn FileSystem>,
        console: &dyn Console,
        config: KernelConfig,
    ) -> Result<Arc<Self>, KernelError> {
        let num_frames = machine.memory().num_frames();
        let vm = if config.paging {
            let swap = SwapStore::create(
                fs.as_ref(),
                &config.swap_file,
                config.swap_slots,
                machine.page_size(),
            )
            .ok_or(KernelError::SwapUnavailable)?;
            Some(VmState::new(num_frames, swap))
        } else {
            None
        };

        let kernel = Arc::new(Self {
            frames: FrameAllocator::new(num_frames),
            table: ProcessTable::new(),
            stdin: console.open_for_reading(),
            stdout: console.open_for_writing(),
            machine,
            fs,
            vm,
            config,
            threads: Lock::new(Vec::new()),
        });

        let weak = Arc::downgrade(&kernel);
        kernel.machine.set_exception_handler(move |trap| match weak.upgrade() {
            Some(k) => k.handle_trap(trap),
            None => TrapOutcome::Finished,
        });
        log::info!(
            "kernel up at tick {}: {} frames of {} bytes, paging {}",
            kernel.machine.time(),
            num_frames,
            kernel.machine.page_size(),
            if kernel.vm.is_some() { "on" } else { "off" },
        );
        Ok(kernel)
    }

    /// The simulated machine.
    #[inline]
    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    /// The host file system.
    #[inline]
    pub fn fs(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    /// The frame allocator.
    #[inline]
    pub fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    /// The process table.
    #[inline]
    pub fn table(&self) -> &ProcessTable {
        &self.table
    }

    /// The demand-paging state, when paging is on.
    #[inline]
    pub fn vm(&self) -> Option<&VmState> {
        self.vm.as_ref()
    }

    /// The kernel tunables.
    #[inline]
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Run the first user program. Its PID is 1 and it has no parent.
    pub fn start(self: &Arc<Self>, name: &str, args: &[String]) -> Result<Pid, ExecError> {
        self.exec(name, args, None)
    }

    /// Block until every user thread has finished.
    pub fn wait_idle(&self) {
        loop {
            let handle = self.threads.lock().pop();
            match handle {
                Some(h) => {
                    let _ = h.join();
                }
                None => break,
            }
        }
    }

    /// Create a process running `name`: assign a PID, wire fds 0/1 to the
    /// console, load the address space, and fork a user thread into the
    /// interpreter. Returns the new PID, or cleans up and fails.
    pub(crate) fn exec(
        self: &Arc<Self>,
        name: &str,
        args: &[String],
        parent: Option<&Arc<Process>>,
    ) -> Result<Pid, ExecError> {
        let pid = self.table.assign().map_err(|_| ExecError::PidExhausted)?;
        let process = Arc::new(Process::new(
            pid,
            parent.map(|p| p.pid()),
            self.machine.new_processor(),
            self.config.max_open_files,
        ));
        {
            let mut st = process.state();
            st.fds.install(0, self.stdin.clone());
            st.fds.install(1, self.stdout.clone());
        }
        self.table.register(pid, process.clone());

        let aspace = match AddressSpace::load(self, pid, name, args) {
            Ok(a) => a,
            Err(e) => {
                log::info!("exec {} failed: {:?}", name, e);
                self.table.mark_exited(pid);
                self.table.unregister(pid);
                return Err(ExecError::Load(e));
            }
        };
        {
            let mut ctx = process.ctx().lock();
            aspace.init_context(&mut ctx);
        }
        process.state().aspace = Some(aspace);
        if let Some(pp) = parent {
            pp.state().children.insert(pid);
        }
        log::info!("exec {} as pid {} with {} args", name, pid, args.len());

        let kernel = Arc::clone(self);
        let thread_proc = process.clone();
        let handle = std::thread::Builder::new()
            .name(format!("user-{}", pid))
            .spawn(move || {
                process::set_current(Some(thread_proc.clone()));
                // A panic on a user thread is a kernel bug. Unwinding one
                // host thread reaches nothing on its own, so catch it
                // here: stop the machine and tear the process down, so
                // live counts stay right and a joining parent wakes.
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    kernel.run_user(&thread_proc)
                }));
                if outcome.is_err() {
                    log::error!("kernel panic on the user thread of pid {}", pid);
                    kernel.halt_machine();
                    kernel.exit_process(&thread_proc, -1, true);
                }
                process::set_current(None);
            })
            .expect("failed to spawn user thread");
        self.threads.lock().push(handle);
        Ok(pid)
    }

    fn run_user(&self, p: &Arc<Process>) {
        {
            let mut st = p.state();
            if let Some(aspace) = st.aspace.as_mut() {
                let mut ctx = p.ctx().lock();
                aspace.restore_state(self, &mut ctx);
            }
        }
        self.machine.run(p.ctx());
    }

    /// The machine's trap entry. Runs on the kernel thread of the process
    /// that trapped.
    pub fn handle_trap(self: &Arc<Self>, trap: Trap) -> TrapOutcome {
        let process = process::current().expect("trap raised outside a user thread");
        match trap {
            Trap::Syscall => syscall::dispatch(self, &process),
            Trap::TlbMiss => self.handle_page_fault(&process),
            Trap::ReadOnly | Trap::BusError | Trap::AddressError | Trap::IllegalInstruction => {
                log::info!("pid {} killed by {:?}", process.pid(), trap);
                self.exit_process(&process, -1, true)
            }
        }
    }

    fn handle_page_fault(&self, p: &Arc<Process>) -> TrapOutcome {
        if self.vm.is_none() {
            // The eager kernel maps everything up front; a miss is a bad
            // reference.
            log::info!("pid {} faulted without demand paging", p.pid());
            return self.exit_process(p, -1, true);
        }
        let bad = p.ctx().lock().read_register(Register::BadVAddr);
        let vpn = bad as usize / self.machine.page_size();
        let outcome = {
            let mut st = p.state();
            match st.aspace.as_mut() {
                Some(aspace) => {
                    let mut ctx = p.ctx().lock();
                    aspace.handle_fault(self, &mut ctx, vpn)
                }
                None => Err(crate::process::aspace::PageFaultError::OutOfRange),
            }
        };
        match outcome {
            Ok(()) => TrapOutcome::Continue,
            Err(_) => {
                log::info!("pid {} faulted outside its address space at {:#x}", p.pid(), bad);
                self.exit_process(p, -1, true)
            }
        }
    }

    /// Tear a process down: close its files, release its memory, record
    /// the exit status, signal the join semaphore, and halt the machine if
    /// it was the last live process. Resources go before the signal, so a
    /// joining parent never sees a half-freed child.
    pub(crate) fn exit_process(&self, p: &Arc<Process>, code: i32, abnormal: bool) -> TrapOutcome {
        let pid = p.pid();
        let (children, parent) = {
            let mut st = p.state();
            if st.exit.is_some() {
                return TrapOutcome::Finished;
            }
            st.fds.close_all();
            if let Some(mut aspace) = st.aspace.take() {
                aspace.unload(self);
            }
            st.exit = Some(ExitStatus { code, abnormal });
            (std::mem::take(&mut st.children), st.parent)
        };

        // Reap zombie children; disown live ones.
        for child_pid in children {
            if let Some(child) = self.table.lookup(child_pid) {
                let already_exited = {
                    let mut cst = child.state();
                    if cst.exit.is_some() {
                        true
                    } else {
                        cst.parent = None;
                        false
                    }
                };
                if already_exited {
                    self.table.unregister(child_pid);
                }
            }
        }

        // With no parent left to join, there is no reason to linger as a
        // zombie.
        let orphaned = match parent {
            Some(pp) => self
                .table
                .lookup(pp)
                .map_or(true, |pproc| pproc.exit_status().is_some()),
            None => true,
        };
        if orphaned {
            self.table.unregister(pid);
        }

        let remaining = self.table.mark_exited(pid);
        p.exit_sem().up();
        log::info!(
            "pid {} exited with status {}{}",
            pid,
            code,
            if abnormal { " (abnormal)" } else { "" }
        );
        if remaining == 0 {
            self.halt_machine();
        }
        TrapOutcome::Finished
    }

    /// Parent-side wait for a child's exit.
    ///
    /// Returns 1 for a clean exit, 0 for abnormal termination, and -1 when
    /// `child_pid` is not a joinable child of `parent`. The child's status
    /// is stored little-endian at `status_va`.
    pub(crate) fn join(&self, parent: &Arc<Process>, child_pid: Pid, status_va: u32) -> i32 {
        {
            let mut st = parent.state();
            if st.joining.is_some() || !st.children.contains(&child_pid) {
                return -1;
            }
            st.joining = Some(child_pid);
        }
        let child = match self.table.lookup(child_pid) {
            Some(c) => c,
            None => {
                parent.state().joining = None;
                return -1;
            }
        };
        child.exit_sem().down();
        let status = child.exit_status().expect("joined child has no exit status");

        self.table.unregister(child_pid);
        {
            let mut st = parent.state();
            st.children.remove(&child_pid);
            st.joining = None;
            if let Some(aspace) = st.aspace.as_mut() {
                let written = aspace.write_vm(self, status_va, &status.code.to_le_bytes());
                if written != 4 {
                    log::debug!("pid {}: join status pointer is bad", parent.pid());
                }
            }
        }
        if status.abnormal {
            0
        } else {
            1
        }
    }

    /// Stop the machine and tear down the swap file. Idempotent, since
    /// the last exit and the panic boundary can both reach it.
    pub(crate) fn halt_machine(&self) {
        if self.machine.is_halted() {
            return;
        }
        self.machine.halt();
        if self.vm.is_some() && !self.fs.remove(&self.config.swap_file) {
            log::warn!("could not remove {}", self.config.swap_file);
        }
    }
}
