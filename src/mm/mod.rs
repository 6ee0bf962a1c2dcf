//! Physical memory management: translation entries and the kernel-global
//! frame allocator.

use crate::process::Pid;
use crate::sync::Lock;
use bitflags::bitflags;
use std::collections::BTreeSet;

bitflags! {
    /// Status bits of a translation entry.
    pub struct EntryFlags: u8 {
        /// The entry maps a resident frame.
        const VALID = 1 << 0;
        /// User-mode writes through this entry trap.
        const READ_ONLY = 1 << 1;
        /// The page was referenced since the bit was last cleared.
        const USED = 1 << 2;
        /// The page was written since it was last loaded.
        const DIRTY = 1 << 3;
    }
}

/// One row of a page table: a virtual page mapped to a physical frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationEntry {
    /// Virtual page number.
    pub vpn: usize,
    /// Physical frame number; meaningless unless `VALID` is set.
    pub ppn: usize,
    /// Status bits.
    pub flags: EntryFlags,
}

impl TranslationEntry {
    /// An entry that maps nothing.
    pub fn invalid() -> Self {
        Self {
            vpn: 0,
            ppn: 0,
            flags: EntryFlags::empty(),
        }
    }

    /// A valid entry mapping `vpn` to `ppn`.
    pub fn new(vpn: usize, ppn: usize, read_only: bool) -> Self {
        let mut flags = EntryFlags::VALID;
        if read_only {
            flags |= EntryFlags::READ_ONLY;
        }
        Self { vpn, ppn, flags }
    }

    /// Whether the entry maps a resident frame.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.flags.contains(EntryFlags::VALID)
    }

    /// Whether user-mode writes through this entry trap.
    #[inline]
    pub fn is_read_only(&self) -> bool {
        self.flags.contains(EntryFlags::READ_ONLY)
    }
}

/// Reasons frame allocation can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Fewer free frames than requested; nothing was taken.
    Empty,
}

struct Inner {
    free: BTreeSet<usize>,
    owner: Vec<Option<Pid>>,
}

/// Owner of all physical frames.
///
/// Every frame is either free or owned by exactly one process. Ownership is
/// tracked per frame, not by counting, so a stray `free` from the wrong
/// process is logged and ignored instead of corrupting another process's
/// memory.
pub struct FrameAllocator {
    inner: Lock<Inner>,
}

impl FrameAllocator {
    /// Create an allocator owning frames `0..num_frames`, all free.
    pub fn new(num_frames: usize) -> Self {
        Self {
            inner: Lock::new(Inner {
                free: (0..num_frames).collect(),
                owner: vec![None; num_frames],
            }),
        }
    }

    /// Atomically reserve `n` frames for `pid`, returned in ascending
    /// order. Fails without taking anything if fewer than `n` are free.
    pub fn allocate(&self, pid: Pid, n: usize) -> Result<Vec<usize>, AllocError> {
        let mut inner = self.inner.lock();
        if inner.free.len() < n {
            return Err(AllocError::Empty);
        }
        let taken: Vec<usize> = inner.free.iter().take(n).copied().collect();
        for &ppn in &taken {
            inner.free.remove(&ppn);
            inner.owner[ppn] = Some(pid);
        }
        Ok(taken)
    }

    /// Return `ppn` to the free set, provided `pid` owns it. Mismatched or
    /// double frees are logged and ignored.
    pub fn free(&self, pid: Pid, ppn: usize) {
        let mut inner = self.inner.lock();
        if ppn >= inner.owner.len() {
            log::warn!("pid {} freed nonexistent frame {}", pid, ppn);
            return;
        }
        match inner.owner[ppn] {
            Some(owner) if owner == pid => {
                inner.owner[ppn] = None;
                inner.free.insert(ppn);
            }
            Some(owner) => {
                log::warn!("pid {} tried to free frame {} owned by pid {}", pid, ppn, owner);
            }
            None => {
                log::warn!("pid {} double-freed frame {}", pid, ppn);
            }
        }
    }

    /// Release every frame owned by `pid`, returning how many there were.
    pub fn free_all(&self, pid: Pid) -> usize {
        let mut inner = self.inner.lock();
        let mut released = 0;
        for ppn in 0..inner.owner.len() {
            if inner.owner[ppn] == Some(pid) {
                inner.owner[ppn] = None;
                inner.free.insert(ppn);
                released += 1;
            }
        }
        released
    }

    /// Number of free frames.
    pub fn num_free(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Frames currently owned by `pid`, in ascending order.
    pub fn owned_by(&self, pid: Pid) -> Vec<usize> {
        let inner = self.inner.lock();
        (0..inner.owner.len())
            .filter(|&ppn| inner.owner[ppn] == Some(pid))
            .collect()
    }
}
