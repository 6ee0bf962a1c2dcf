//! User processes.
//!
//! A process owns its address space, file-descriptor table, saved machine
//! context and exit bookkeeping. Parent/child relations are kept as PID
//! keys only; the process table owns every [`Process`], so no reference
//! cycles exist.

pub mod aspace;
pub mod fd;
pub mod table;

pub use aspace::{AddressSpace, LoadError};
pub use fd::FdTable;
pub use table::ProcessTable;

use crate::machine::Processor;
use crate::sync::{Lock, LockGuard, Semaphore};
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// A process identifier. Always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    /// The status passed to `exit`, or -1 for a trap-killed process.
    pub code: i32,
    /// Whether the process was ended by a hardware trap.
    pub abnormal: bool,
}

/// The lock-serialized mutable state of a process.
///
/// The per-process lock serializes fd-table and address-space mutations
/// against syscalls issued from sibling kernel threads.
pub(crate) struct ProcState {
    /// Parent PID; cleared when the parent dies first.
    pub parent: Option<Pid>,
    /// Open files.
    pub fds: FdTable,
    /// The address space; `None` once the process has exited.
    pub aspace: Option<AddressSpace>,
    /// Live and zombie children, by PID.
    pub children: BTreeSet<Pid>,
    /// The child this process is currently blocked joining on.
    pub joining: Option<Pid>,
    /// Set exactly once, when the process exits.
    pub exit: Option<ExitStatus>,
}

/// One user process.
pub struct Process {
    pid: Pid,
    ctx: Lock<Processor>,
    state: Lock<ProcState>,
    exit_sem: Semaphore,
}

impl Process {
    pub(crate) fn new(
        pid: Pid,
        parent: Option<Pid>,
        ctx: Lock<Processor>,
        fd_capacity: usize,
    ) -> Self {
        Self {
            pid,
            ctx,
            state: Lock::new(ProcState {
                parent,
                fds: FdTable::new(fd_capacity),
                aspace: None,
                children: BTreeSet::new(),
                joining: None,
                exit: None,
            }),
            exit_sem: Semaphore::new(0),
        }
    }

    /// This process's PID.
    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// The saved machine context of this process's user thread.
    #[inline]
    pub fn ctx(&self) -> &Lock<Processor> {
        &self.ctx
    }

    pub(crate) fn state(&self) -> LockGuard<'_, ProcState> {
        self.state.lock()
    }

    /// The semaphore a joining parent blocks on; `exit` releases resources
    /// and then ups it.
    pub(crate) fn exit_sem(&self) -> &Semaphore {
        &self.exit_sem
    }

    /// The recorded exit status, once the process has exited.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.state.lock().exit
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Process>>> = RefCell::new(None);
}

/// Bind `process` as the current process of this kernel thread.
pub(crate) fn set_current(process: Option<Arc<Process>>) {
    CURRENT.with(|c| *c.borrow_mut() = process);
}

/// The process whose user thread is running on this kernel thread.
pub fn current() -> Option<Arc<Process>> {
    CURRENT.with(|c| c.borrow().clone())
}
