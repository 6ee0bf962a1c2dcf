//! The kernel-global process table.

use super::{Pid, Process};
use crate::sync::Lock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// PID assignment failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidError {
    /// Every positive PID is in use.
    Exhausted,
}

struct Inner {
    map: BTreeMap<Pid, Arc<Process>>,
    reserved: BTreeSet<Pid>,
    cursor: u32,
    live: usize,
}

/// Tracks every process in the system.
///
/// PIDs come from an unsigned monotonic cursor that skips PIDs still in use
/// and wraps back to 1, so a long-running kernel can never hand out a
/// negative or duplicate PID. Zombies stay registered until the parent
/// reaps them; `live` counts processes that have not exited yet.
pub struct ProcessTable {
    inner: Lock<Inner>,
}

impl ProcessTable {
    /// An empty table; the first assigned PID is 1.
    pub fn new() -> Self {
        Self {
            inner: Lock::new(Inner {
                map: BTreeMap::new(),
                reserved: BTreeSet::new(),
                cursor: 1,
                live: 0,
            }),
        }
    }

    /// Reserve and return the next unused PID.
    pub fn assign(&self) -> Result<Pid, PidError> {
        let mut inner = self.inner.lock();
        let start = inner.cursor;
        loop {
            let candidate = Pid(inner.cursor);
            inner.cursor = match inner.cursor.checked_add(1) {
                Some(next) => next,
                None => 1,
            };
            if !inner.map.contains_key(&candidate) && !inner.reserved.contains(&candidate) {
                inner.reserved.insert(candidate);
                return Ok(candidate);
            }
            if inner.cursor == start {
                return Err(PidError::Exhausted);
            }
        }
    }

    /// Insert `process` under its reserved `pid`, counting it live.
    pub fn register(&self, pid: Pid, process: Arc<Process>) {
        let mut inner = self.inner.lock();
        inner.reserved.remove(&pid);
        let previous = inner.map.insert(pid, process);
        assert!(previous.is_none(), "pid {} registered twice", pid);
        inner.live += 1;
    }

    /// Remove `pid` from the table (reaping a zombie, or dropping a process
    /// whose load failed).
    pub fn unregister(&self, pid: Pid) -> Option<Arc<Process>> {
        self.inner.lock().map.remove(&pid)
    }

    /// Note that `pid` has exited; returns how many live processes remain.
    pub fn mark_exited(&self, _pid: Pid) -> usize {
        let mut inner = self.inner.lock();
        inner.live -= 1;
        inner.live
    }

    /// Look up a registered process.
    pub fn lookup(&self, pid: Pid) -> Option<Arc<Process>> {
        self.inner.lock().map.get(&pid).cloned()
    }

    /// Number of processes that have not exited.
    pub fn live(&self) -> usize {
        self.inner.lock().live
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{Machine, MachineConfig};

    fn dummy_process(pid: Pid) -> Arc<Process> {
        let machine = Machine::new(
            MachineConfig::default(),
            Arc::new(crate::machine::HostTimer::new()),
            Box::new(crate::test_util::NullInterpreter),
        );
        Arc::new(Process::new(pid, None, machine.new_processor(), 16))
    }

    #[test]
    fn assigns_increasing_pids_skipping_used() {
        let table = ProcessTable::new();
        let a = table.assign().unwrap();
        let b = table.assign().unwrap();
        assert_eq!(a, Pid(1));
        assert_eq!(b, Pid(2));
        table.register(a, dummy_process(a));
        table.register(b, dummy_process(b));
        assert_eq!(table.live(), 2);

        assert_eq!(table.mark_exited(a), 1);
        table.unregister(a);
        // The cursor keeps moving forward; 1 is only reused after a wrap.
        assert_eq!(table.assign().unwrap(), Pid(3));
    }

    #[test]
    fn lookup_finds_registered_processes() {
        let table = ProcessTable::new();
        let pid = table.assign().unwrap();
        assert!(table.lookup(pid).is_none());
        table.register(pid, dummy_process(pid));
        assert_eq!(table.lookup(pid).unwrap().pid(), pid);
    }
}
