//! The backing swap file and its slot table.

use crate::machine::{FileSystem, OpenFile};
use crate::process::Pid;
use crate::sync::Lock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A slot binding: where a page's contents live in the swap file, plus the
/// permission bits the page gets back when it is faulted in.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SlotInfo {
    /// Slot index; slot `k` covers file bytes `[k*page_size, (k+1)*page_size)`.
    pub slot: usize,
    /// Whether the page is read-only.
    pub read_only: bool,
    /// Whether the page holds code.
    pub executable: bool,
}

struct SwapInner {
    free: Vec<usize>,
    bound: BTreeMap<(Pid, usize), SlotInfo>,
}

/// A pre-sized backing store of page-sized slots.
///
/// A slot is either free or bound to one `(pid, vpn)`. Bindings are
/// published only after the page bytes are on disk, so a concurrent fault
/// can never read a half-written slot; swap-in takes the binding away and
/// returns the slot to the free pool.
///
/// The file handle keeps one position, so each seek-and-transfer pair runs
/// under `io`.
pub struct SwapStore {
    file: Arc<dyn OpenFile>,
    page_size: usize,
    io: Lock<()>,
    inner: Lock<SwapInner>,
}

impl SwapStore {
    /// Create the swap file through the host file system, pre-sized to
    /// `slots` zeroed pages.
    pub fn create(
        fs: &dyn FileSystem,
        name: &str,
        slots: usize,
        page_size: usize,
    ) -> Option<Self> {
        let file = fs.open(name, true)?;
        let zeros = vec![0u8; page_size];
        file.seek(0);
        for _ in 0..slots {
            if write_all(file.as_ref(), &zeros).is_err() {
                return None;
            }
        }
        Some(Self {
            file,
            page_size,
            io: Lock::new(()),
            inner: Lock::new(SwapInner {
                free: (0..slots).rev().collect(),
                bound: BTreeMap::new(),
            }),
        })
    }

    /// Write `bytes` (one page) to a fresh slot and bind it to
    /// `(pid, vpn)`.
    ///
    /// Panics when the swap file is full or the device fails; the backing
    /// store is sized at kernel init and losing it is not survivable.
    pub(crate) fn store(
        &self,
        pid: Pid,
        vpn: usize,
        read_only: bool,
        executable: bool,
        bytes: &[u8],
    ) {
        assert_eq!(bytes.len(), self.page_size);
        let slot = self
            .inner
            .lock()
            .free
            .pop()
            .expect("out of swap slots");
        {
            let _io = self.io.lock();
            self.file.seek(slot * self.page_size);
            write_all(self.file.as_ref(), bytes).expect("swap device failed");
        }
        let mut inner = self.inner.lock();
        inner.bound.insert(
            (pid, vpn),
            SlotInfo {
                slot,
                read_only,
                executable,
            },
        );
    }

    /// Take the binding for `(pid, vpn)`, if the page is swapped out. The
    /// caller reads the slot and then releases it.
    pub(crate) fn take_binding(&self, pid: Pid, vpn: usize) -> Option<SlotInfo> {
        self.inner.lock().bound.remove(&(pid, vpn))
    }

    /// Read one page out of `slot` into `buf`.
    pub(crate) fn read_slot(&self, slot: usize, buf: &mut [u8]) {
        assert_eq!(buf.len(), self.page_size);
        let _io = self.io.lock();
        self.file.seek(slot * self.page_size);
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(n) if n > 0 => filled += n,
                _ => panic!("swap device failed"),
            }
        }
    }

    /// Return `slot` to the free pool.
    pub(crate) fn release_slot(&self, slot: usize) {
        self.inner.lock().free.push(slot);
    }

    /// Drop every binding `pid` holds and free the slots.
    pub(crate) fn release_process(&self, pid: Pid) {
        let mut inner = self.inner.lock();
        let dead: Vec<(Pid, usize)> = inner
            .bound
            .keys()
            .filter(|(p, _)| *p == pid)
            .copied()
            .collect();
        for key in dead {
            let info = inner.bound.remove(&key).unwrap();
            inner.free.push(info.slot);
        }
    }

    /// Whether `(pid, vpn)` currently lives in swap.
    pub fn is_bound(&self, pid: Pid, vpn: usize) -> bool {
        self.inner.lock().bound.contains_key(&(pid, vpn))
    }

    /// Free slots remaining.
    pub fn free_slots(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Pages currently living in swap.
    pub fn bound_pages(&self) -> usize {
        self.inner.lock().bound.len()
    }
}

fn write_all(file: &dyn OpenFile, mut bytes: &[u8]) -> Result<(), ()> {
    while !bytes.is_empty() {
        match file.write(bytes) {
            Ok(n) if n > 0 => bytes = &bytes[n..],
            _ => return Err(()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::MemFs;

    #[test]
    fn store_take_read_roundtrip() {
        let fs = MemFs::new();
        let swap = SwapStore::create(&fs, "nachos.swp", 4, 128).unwrap();
        assert_eq!(swap.free_slots(), 4);

        let page = vec![0x5au8; 128];
        swap.store(Pid(3), 7, false, false, &page);
        assert_eq!(swap.free_slots(), 3);
        assert_eq!(swap.bound_pages(), 1);

        let info = swap.take_binding(Pid(3), 7).unwrap();
        let mut back = vec![0u8; 128];
        swap.read_slot(info.slot, &mut back);
        assert_eq!(back, page);
        swap.release_slot(info.slot);
        assert_eq!(swap.free_slots(), 4);
        assert_eq!(swap.bound_pages(), 0);
        assert!(swap.take_binding(Pid(3), 7).is_none());
    }

    #[test]
    fn release_process_frees_all_bindings() {
        let fs = MemFs::new();
        let swap = SwapStore::create(&fs, "nachos.swp", 4, 64).unwrap();
        let page = vec![1u8; 64];
        swap.store(Pid(1), 0, false, false, &page);
        swap.store(Pid(1), 1, false, false, &page);
        swap.store(Pid(2), 0, false, false, &page);
        swap.release_process(Pid(1));
        assert_eq!(swap.free_slots(), 3);
        assert!(swap.take_binding(Pid(2), 0).is_some());
    }
}
