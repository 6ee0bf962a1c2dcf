//! Demand paging: the inverted page table, the pin set, and page
//! replacement.
//!
//! With paging on, no frame is handed out at load time. Every translation
//! the kernel performs goes through [`VmState::pin_page`]: a resident page
//! is pinned and returned; anything else is faulted in, evicting a victim
//! when memory is full. The inverted table is the authoritative record of
//! residency; per-process page tables are mere MMU images resynchronized
//! from it on every context switch.
//!
//! Lock order (after the frame allocator): pin set, then swap slot table,
//! then inverted table. Eviction publishes the victim's swap binding before
//! retiring its inverted entry, and a page mid-eviction is flagged so the
//! owner's fault path waits instead of resurrecting a page whose bytes are
//! still in flight.

mod swap;

pub use swap::SwapStore;

use crate::kernel::Kernel;
use crate::mm::{EntryFlags, TranslationEntry};
use crate::process::aspace::SectionSpan;
use crate::process::Pid;
use crate::sync::{Condition, Lock};
use rand::Rng;
use std::collections::BTreeMap;

/// Permission failure from a kernel-driven transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VmFault {
    /// Write through a read-only translation.
    ReadOnly,
}

/// One resident page.
#[derive(Debug, Clone, Copy)]
struct Resident {
    pid: Pid,
    vpn: usize,
    read_only: bool,
    executable: bool,
    used: bool,
    dirty: bool,
    /// The page is being written out; its bytes are in flight.
    evicting: bool,
}

struct Ipt {
    /// Indexed by frame; the victim scanner walks this directly.
    by_frame: Vec<Option<Resident>>,
    /// `(pid, vpn)` to frame, for translation.
    index: BTreeMap<(Pid, usize), usize>,
}

/// Where the bytes of a faulted-in page come from: a loadable section of
/// the process's executable, or a zero-filled stack/argv page.
pub(crate) struct PageSource<'a> {
    pub pid: Pid,
    pub sections: &'a [SectionSpan],
    pub elf: Option<&'a crate::elf::Elf>,
}

impl PageSource<'_> {
    /// Fill frame `ppn` with the initial contents of `vpn`; returns the
    /// page's (read_only, executable) bits.
    fn fill(&self, k: &Kernel, vpn: usize, ppn: usize) -> (bool, bool) {
        let mem = k.machine().memory();
        match self.sections.iter().find(|s| s.contains(vpn)) {
            Some(span) => {
                let elf = self.elf.expect("faulting a section page without the executable");
                let mut buf = vec![0u8; mem.page_size()];
                elf.load_page(span.index, vpn - span.first_vpn, &mut buf)
                    .expect("executable unreadable during fault");
                mem.write(ppn, 0, &buf);
                (span.read_only, span.executable)
            }
            None => {
                mem.zero_frame(ppn);
                (false, false)
            }
        }
    }
}

/// A frame held immovable for the duration of a kernel transfer. Dropping
/// it unpins the frame and wakes any eviction waiting for pins to clear.
pub struct PinnedPage<'a> {
    vm: &'a VmState,
    ppn: usize,
    read_only: bool,
}

impl PinnedPage<'_> {
    /// The pinned frame.
    #[inline]
    pub fn ppn(&self) -> usize {
        self.ppn
    }

    /// Whether the pinned page is read-only.
    #[inline]
    pub fn read_only(&self) -> bool {
        self.read_only
    }
}

impl Drop for PinnedPage<'_> {
    fn drop(&mut self) {
        let mut pins = self.vm.pins.lock();
        pins[self.ppn] -= 1;
        if pins[self.ppn] == 0 {
            self.vm.unpinned.notify_all();
        }
    }
}

/// The demand-paging state of the kernel.
pub struct VmState {
    ipt: Lock<Ipt>,
    ipt_changed: Condition,
    /// Pin counts per frame; pinned frames are never victims.
    pins: Lock<Vec<u32>>,
    unpinned: Condition,
    swap: SwapStore,
}

impl VmState {
    /// Build the paging state: an empty inverted table over `num_frames`
    /// frames and a fresh swap store.
    pub(crate) fn new(num_frames: usize, swap: SwapStore) -> Self {
        Self {
            ipt: Lock::new(Ipt {
                by_frame: (0..num_frames).map(|_| None).collect(),
                index: BTreeMap::new(),
            }),
            ipt_changed: Condition::new(),
            pins: Lock::new(vec![0; num_frames]),
            unpinned: Condition::new(),
            swap,
        }
    }

    /// The swap store.
    pub fn swap(&self) -> &SwapStore {
        &self.swap
    }

    /// Make `vpn` of `src.pid` resident and pin it.
    ///
    /// Fast path: the page is resident, so it is marked used (and dirty
    /// for writes) and pinned. Otherwise a frame is obtained (evicting if
    /// necessary) and filled from swap, from the executable, or with
    /// zeros. A kernel write into a read-only page leaves the page
    /// resident but reports [`VmFault::ReadOnly`].
    pub(crate) fn pin_page<'a>(
        &'a self,
        k: &Kernel,
        src: &PageSource<'_>,
        vpn: usize,
        write: bool,
    ) -> Result<PinnedPage<'a>, VmFault> {
        let pid = src.pid;
        loop {
            {
                let mut pins = self.pins.lock();
                let mut ipt = self.ipt.lock();
                if let Some(&ppn) = ipt.index.get(&(pid, vpn)) {
                    let r = ipt.by_frame[ppn].as_mut().expect("inverted index out of sync");
                    if r.evicting {
                        // The bytes are moving to swap; wait and retry.
                        drop(pins);
                        drop(self.ipt_changed.wait(ipt));
                        continue;
                    }
                    if write && r.read_only {
                        return Err(VmFault::ReadOnly);
                    }
                    r.used = true;
                    if write {
                        r.dirty = true;
                    }
                    pins[ppn] += 1;
                    return Ok(PinnedPage {
                        vm: self,
                        ppn,
                        read_only: r.read_only,
                    });
                }
            }

            // Fault. Only the owning process's thread faults its own
            // pages, so nobody else can be bringing this one in.
            let ppn = self.acquire_frame(k, pid);
            let (read_only, executable) = match self.swap.take_binding(pid, vpn) {
                Some(info) => {
                    let mem = k.machine().memory();
                    let mut buf = vec![0u8; mem.page_size()];
                    self.swap.read_slot(info.slot, &mut buf);
                    mem.write(ppn, 0, &buf);
                    self.swap.release_slot(info.slot);
                    log::trace!("pid {} vpn {} swapped in to frame {}", pid, vpn, ppn);
                    (info.read_only, info.executable)
                }
                None => {
                    log::trace!("pid {} vpn {} faulted fresh into frame {}", pid, vpn, ppn);
                    src.fill(k, vpn, ppn)
                }
            };

            let mut pins = self.pins.lock();
            let mut ipt = self.ipt.lock();
            ipt.by_frame[ppn] = Some(Resident {
                pid,
                vpn,
                read_only,
                executable,
                used: true,
                dirty: write && !read_only,
                evicting: false,
            });
            ipt.index.insert((pid, vpn), ppn);
            self.ipt_changed.notify_all();
            if write && read_only {
                return Err(VmFault::ReadOnly);
            }
            pins[ppn] += 1;
            return Ok(PinnedPage {
                vm: self,
                ppn,
                read_only,
            });
        }
    }

    fn acquire_frame(&self, k: &Kernel, pid: Pid) -> usize {
        loop {
            if let Ok(mut frames) = k.frames().allocate(pid, 1) {
                return frames.pop().unwrap();
            }
            self.evict_one(k);
        }
    }

    /// Push one page out of memory.
    fn evict_one(&self, k: &Kernel) {
        let (ppn, info) = loop {
            let pins = self.pins.lock();
            let mut ipt = self.ipt.lock();
            if let Some(ppn) = Self::choose_victim(&mut ipt, &pins) {
                let r = ipt.by_frame[ppn].as_mut().unwrap();
                r.evicting = true;
                break (ppn, *r);
            }
            // Every frame is pinned or mid-eviction; wait for a pin to
            // clear.
            drop(ipt);
            drop(self.unpinned.wait(pins));
        };

        // The write-back below can panic (swap exhausted, device dead).
        // The in-flight flag must not survive the unwind: the owner's
        // fault path and `release_process` block on it.
        struct ClearEvicting<'a> {
            vm: &'a VmState,
            ppn: usize,
            armed: bool,
        }
        impl Drop for ClearEvicting<'_> {
            fn drop(&mut self) {
                if self.armed {
                    let mut ipt = self.vm.ipt.lock();
                    if let Some(r) = ipt.by_frame[self.ppn].as_mut() {
                        r.evicting = false;
                    }
                    drop(ipt);
                    self.vm.ipt_changed.notify_all();
                }
            }
        }
        let mut flag = ClearEvicting {
            vm: self,
            ppn,
            armed: true,
        };

        // Read-only executable pages come back from the ELF for free;
        // everything else goes to swap.
        if info.read_only && info.executable {
            log::trace!("pid {} vpn {} discarded from frame {}", info.pid, info.vpn, ppn);
        } else {
            let mem = k.machine().memory();
            let mut buf = vec![0u8; mem.page_size()];
            mem.read(ppn, 0, &mut buf);
            self.swap
                .store(info.pid, info.vpn, info.read_only, info.executable, &buf);
            log::trace!("pid {} vpn {} swapped out of frame {}", info.pid, info.vpn, ppn);
        }

        flag.armed = false;
        {
            let mut ipt = self.ipt.lock();
            ipt.by_frame[ppn] = None;
            ipt.index.remove(&(info.pid, info.vpn));
        }
        self.ipt_changed.notify_all();
        k.frames().free(info.pid, ppn);
    }

    /// Pick a victim frame, scanning from a randomized origin: first a
    /// clean unreferenced page, then any unreferenced page, and finally
    /// any unpinned page while clearing reference bits along the way.
    fn choose_victim(ipt: &mut Ipt, pins: &[u32]) -> Option<usize> {
        let n = ipt.by_frame.len();
        let start = rand::thread_rng().gen_range(0..n);
        let eligible = |r: &Resident, ppn: usize| !r.evicting && pins[ppn] == 0;

        for i in 0..n {
            let ppn = (start + i) % n;
            if let Some(r) = &ipt.by_frame[ppn] {
                if eligible(r, ppn) && !r.used && !r.dirty {
                    return Some(ppn);
                }
            }
        }
        for i in 0..n {
            let ppn = (start + i) % n;
            if let Some(r) = &ipt.by_frame[ppn] {
                if eligible(r, ppn) && !r.used {
                    return Some(ppn);
                }
            }
        }
        for i in 0..n {
            let ppn = (start + i) % n;
            if let Some(r) = ipt.by_frame[ppn].as_mut() {
                if !r.evicting && pins[ppn] == 0 {
                    return Some(ppn);
                }
                r.used = false;
            }
        }
        None
    }

    /// Rebuild a process's MMU image from the inverted table. Pages absent
    /// (or mid-eviction) become invalid locally.
    pub(crate) fn sync_table(&self, pid: Pid, table: &mut [TranslationEntry]) {
        let ipt = self.ipt.lock();
        for (vpn, entry) in table.iter_mut().enumerate() {
            let resident = ipt
                .index
                .get(&(pid, vpn))
                .and_then(|&ppn| ipt.by_frame[ppn].map(|r| (ppn, r)));
            match resident {
                Some((ppn, r)) if !r.evicting => {
                    let mut flags = EntryFlags::VALID;
                    if r.read_only {
                        flags |= EntryFlags::READ_ONLY;
                    }
                    if r.used {
                        flags |= EntryFlags::USED;
                    }
                    if r.dirty {
                        flags |= EntryFlags::DIRTY;
                    }
                    *entry = TranslationEntry { vpn, ppn, flags };
                }
                _ => {
                    *entry = TranslationEntry {
                        vpn,
                        ..TranslationEntry::invalid()
                    };
                }
            }
        }
    }

    /// Forget every page `pid` holds, waiting out any in-flight eviction
    /// of its pages. The caller still owns the frames and returns them to
    /// the allocator afterwards.
    pub(crate) fn release_process(&self, pid: Pid) {
        loop {
            let mut ipt = self.ipt.lock();
            let in_flight = ipt
                .index
                .iter()
                .any(|(&(p, _), &ppn)| p == pid && ipt.by_frame[ppn].map_or(false, |r| r.evicting));
            if in_flight {
                drop(self.ipt_changed.wait(ipt));
                continue;
            }
            let mine: Vec<((Pid, usize), usize)> = ipt
                .index
                .iter()
                .filter(|(&(p, _), _)| p == pid)
                .map(|(&key, &ppn)| (key, ppn))
                .collect();
            for (key, ppn) in mine {
                ipt.by_frame[ppn] = None;
                ipt.index.remove(&key);
            }
            break;
        }
        self.ipt_changed.notify_all();
        self.swap.release_process(pid);
    }

    /// The frame `(pid, vpn)` is resident in, if any.
    pub fn resident(&self, pid: Pid, vpn: usize) -> Option<usize> {
        self.ipt.lock().index.get(&(pid, vpn)).copied()
    }

    /// Number of resident pages.
    pub fn num_resident(&self) -> usize {
        self.ipt.lock().index.len()
    }

    /// Number of currently pinned frames.
    pub fn num_pinned(&self) -> usize {
        self.pins.lock().iter().filter(|&&c| c > 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelConfig;
    use crate::machine::MachineConfig;
    use crate::process::aspace::AddressSpace;
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

    fn paging_config(stack_pages: usize) -> KernelConfig {
        KernelConfig {
            paging: true,
            stack_pages,
            swap_slots: 64,
            ..KernelConfig::default()
        }
    }

    fn code_and_data_image() -> Vec<u8> {
        ElfImage::new(PAGE, 0)
            .text(0, &[0xaa; PAGE])
            .data(PAGE as u32, b"resident data")
            .build()
    }

    #[test]
    fn lazy_load_defers_page_allocation() {
        let h = harness(8);
        let k = h.boot(paging_config(8));
        h.fs.install("prog", code_and_data_image());

        let args = vec!["prog".to_string()];
        let aspace = AddressSpace::load(&k, Pid(1), "prog", &args).unwrap();
        let vm = k.vm().unwrap();

        // Only the argv page was touched (by the argv write); code and
        // data wait for their first reference.
        assert_eq!(vm.num_resident(), 1);
        assert!(vm.resident(Pid(1), aspace.num_pages() - 1).is_some());
        assert_eq!(k.frames().owned_by(Pid(1)).len(), 1);
        // The executable stays open for section faults.
        assert!(aspace.elf().is_some());
    }

    #[test]
    fn faults_load_sections_and_zero_fill_the_stack() {
        let h = harness(8);
        let k = h.boot(paging_config(8));
        h.fs.install("prog", code_and_data_image());
        let mut aspace = AddressSpace::load(&k, Pid(1), "prog", &[]).unwrap();

        let mut code = [0u8; 16];
        assert_eq!(aspace.read_vm(&k, 0, &mut code), 16);
        assert_eq!(code, [0xaa; 16]);

        let mut data = [0u8; 13];
        assert_eq!(aspace.read_vm(&k, PAGE as u32, &mut data), 13);
        assert_eq!(&data, b"resident data");

        let mut stack = [0xffu8; 32];
        assert_eq!(aspace.read_vm(&k, (3 * PAGE) as u32, &mut stack), 32);
        assert_eq!(stack, [0u8; 32]);
        assert_eq!(k.vm().unwrap().num_resident(), 3);
    }

    #[test]
    fn kernel_writes_respect_read_only_pages() {
        let h = harness(8);
        let k = h.boot(paging_config(8));
        h.fs.install("prog", code_and_data_image());
        let mut aspace = AddressSpace::load(&k, Pid(1), "prog", &[]).unwrap();

        assert_eq!(aspace.write_vm(&k, 4, &[1, 2, 3]), 0);
        // The refused write still leaves the page resident and intact.
        let mut code = [0u8; 4];
        assert_eq!(aspace.read_vm(&k, 4, &mut code), 4);
        assert_eq!(code, [0xaa; 4]);
    }

    #[test]
    fn no_lost_updates_across_swap() {
        let h = harness(2);
        let k = h.boot(paging_config(6));
        h.fs.install("prog", code_and_data_image());
        let mut aspace = AddressSpace::load(&k, Pid(1), "prog", &[]).unwrap();
        let vm = k.vm().unwrap();

        let target = (2 * PAGE) as u32;
        assert_eq!(aspace.write_vm(&k, target, b"survives"), 8);

        // Two frames, many pages: keep touching the rest of the stack
        // until the target page has been pushed through swap.
        let mut vpn = 3;
        let mut spins = 0;
        while vm.resident(Pid(1), 2).is_some() {
            assert_eq!(aspace.write_vm(&k, (vpn * PAGE) as u32, &[vpn as u8]), 1);
            vpn = if vpn >= 7 { 3 } else { vpn + 1 };
            spins += 1;
            assert!(spins < 1000, "target page never evicted");
        }
        assert!(vm.swap().is_bound(Pid(1), 2));

        let mut back = [0u8; 8];
        assert_eq!(aspace.read_vm(&k, target, &mut back), 8);
        assert_eq!(&back, b"survives");
    }

    #[test]
    fn swap_pressure_cycle_preserves_every_page() {
        let h = harness(8);
        // 1 code page + 18 stack pages + argv = 20 pages.
        let k = h.boot(paging_config(18));
        h.fs.install("prog", code_and_data_image_one_page());
        let mut aspace = AddressSpace::load(&k, Pid(1), "prog", &[]).unwrap();
        assert_eq!(aspace.num_pages(), 20);

        for round in 0..100u32 {
            for vpn in 1..20usize {
                let payload = [round as u8, vpn as u8];
                let va = (vpn * PAGE + 7) as u32;
                assert_eq!(aspace.write_vm(&k, va, &payload), 2);
            }
            // Touch the code page too, keeping 20 pages in the cycle.
            let mut one = [0u8; 1];
            assert_eq!(aspace.read_vm(&k, 0, &mut one), 1);
            assert_eq!(one[0], 0xaa);
        }

        for vpn in 1..20usize {
            let mut back = [0u8; 2];
            assert_eq!(aspace.read_vm(&k, (vpn * PAGE + 7) as u32, &mut back), 2);
            assert_eq!(back, [99, vpn as u8], "page {} lost its last write", vpn);
        }

        // Residency can never exceed physical memory, and the allocator's
        // books balance.
        let vm = k.vm().unwrap();
        assert!(vm.num_resident() <= 8);
        assert_eq!(k.frames().num_free() + k.frames().owned_by(Pid(1)).len(), 8);
        assert_eq!(vm.num_pinned(), 0);
    }

    fn code_and_data_image_one_page() -> Vec<u8> {
        ElfImage::new(PAGE, 0).text(0, &[0xaa; PAGE]).build()
    }

    #[test]
    fn read_only_code_is_discarded_not_swapped() {
        let h = harness(2);
        let k = h.boot(paging_config(6));
        h.fs.install("prog", code_and_data_image_one_page());
        let mut aspace = AddressSpace::load(&k, Pid(1), "prog", &[]).unwrap();
        let vm = k.vm().unwrap();

        let mut one = [0u8; 1];
        assert_eq!(aspace.read_vm(&k, 0, &mut one), 1);
        assert!(vm.resident(Pid(1), 0).is_some());

        // Walk the stack until the code page gets chosen as a victim; it
        // must be dropped, never written to swap.
        let mut vpn = 2;
        let mut spins = 0;
        while vm.resident(Pid(1), 0).is_some() {
            assert_eq!(aspace.write_vm(&k, (vpn * PAGE) as u32, &[vpn as u8]), 1);
            vpn = if vpn >= 5 { 2 } else { vpn + 1 };
            spins += 1;
            assert!(spins < 1000, "code page never evicted");
        }
        assert!(!vm.swap().is_bound(Pid(1), 0));

        // And it comes back from the executable.
        assert_eq!(aspace.read_vm(&k, 0, &mut one), 1);
        assert_eq!(one[0], 0xaa);
    }

    #[test]
    fn pinned_frames_are_never_victims() {
        let h = harness(2);
        let k = h.boot(paging_config(6));
        h.fs.install("prog", code_and_data_image_one_page());
        let mut aspace = AddressSpace::load(&k, Pid(1), "prog", &[]).unwrap();
        let vm = k.vm().unwrap();

        assert_eq!(aspace.write_vm(&k, (1 * PAGE) as u32, b"pinned!"), 7);
        let src = PageSource {
            pid: aspace.pid(),
            sections: aspace.sections(),
            elf: aspace.elf(),
        };
        let pin = vm.pin_page(&k, &src, 1, false).unwrap();
        let pinned_frame = pin.ppn();
        assert_eq!(vm.num_pinned(), 1);

        // Each of these faults must claim the other frame.
        assert_eq!(aspace.write_vm(&k, (2 * PAGE) as u32, &[1]), 1);
        assert_eq!(aspace.write_vm(&k, (3 * PAGE) as u32, &[2]), 1);
        assert_eq!(aspace.write_vm(&k, (4 * PAGE) as u32, &[3]), 1);
        assert_eq!(vm.resident(Pid(1), 1), Some(pinned_frame));

        drop(pin);
        assert_eq!(vm.num_pinned(), 0);
        let mut back = [0u8; 7];
        assert_eq!(aspace.read_vm(&k, (1 * PAGE) as u32, &mut back), 7);
        assert_eq!(&back, b"pinned!");
    }

    #[test]
    fn restore_state_resyncs_the_mmu_image() {
        let h = Harness::new(
            MachineConfig {
                page_size: PAGE,
                num_frames: 2,
                tlb_size: Some(4),
            },
            b"",
        );
        let k = h.boot(paging_config(6));
        h.fs.install("prog", code_and_data_image_one_page());
        let mut aspace = AddressSpace::load(&k, Pid(1), "prog", &[]).unwrap();
        let vm = k.vm().unwrap();

        // Make vpn 2 resident, then force it out.
        assert_eq!(aspace.write_vm(&k, (2 * PAGE) as u32, &[7]), 1);
        let mut vpn = 3;
        let mut spins = 0;
        while vm.resident(Pid(1), 2).is_some() {
            assert_eq!(aspace.write_vm(&k, (vpn * PAGE) as u32, &[vpn as u8]), 1);
            vpn = if vpn >= 5 { 3 } else { vpn + 1 };
            spins += 1;
            assert!(spins < 1000, "page never evicted");
        }

        let ctx_lock = h.machine.new_processor();
        let mut ctx = ctx_lock.lock();
        aspace.init_context(&mut ctx);
        ctx.tlb_set(0, TranslationEntry::new(0, 0, false));
        aspace.restore_state(&k, &mut ctx);
        for entry in ctx.page_table() {
            assert_eq!(
                entry.is_valid(),
                vm.resident(Pid(1), entry.vpn).is_some(),
                "vpn {} residency mismatch",
                entry.vpn
            );
        }
        assert!(ctx.tlb().unwrap().iter().all(|e| !e.is_valid()));
    }

    #[test]
    fn release_process_drops_residency_and_swap() {
        let h = harness(2);
        let k = h.boot(paging_config(6));
        h.fs.install("prog", code_and_data_image_one_page());
        let mut aspace = AddressSpace::load(&k, Pid(1), "prog", &[]).unwrap();
        let vm = k.vm().unwrap();

        for vpn in 1..6usize {
            assert_eq!(aspace.write_vm(&k, (vpn * PAGE) as u32, &[vpn as u8]), 1);
        }
        assert!(vm.swap().bound_pages() > 0);

        aspace.unload(&k);
        assert_eq!(vm.num_resident(), 0);
        assert_eq!(vm.swap().bound_pages(), 0);
        assert_eq!(vm.swap().free_slots(), 64);
        assert_eq!(k.frames().num_free(), 2);
    }

    #[test]
    fn two_processes_never_share_frames() {
        let h = harness(4);
        let k = h.boot(paging_config(4));
        h.fs.install("prog", code_and_data_image_one_page());
        let mut a = AddressSpace::load(&k, Pid(1), "prog", &[]).unwrap();
        let mut b = AddressSpace::load(&k, Pid(2), "prog", &[]).unwrap();

        for vpn in 1..5usize {
            assert_eq!(a.write_vm(&k, (vpn * PAGE) as u32, &[0xa0 | vpn as u8]), 1);
            assert_eq!(b.write_vm(&k, (vpn * PAGE) as u32, &[0xb0 | vpn as u8]), 1);
        }
        let owned_a = k.frames().owned_by(Pid(1));
        let owned_b = k.frames().owned_by(Pid(2));
        assert!(owned_a.iter().all(|f| !owned_b.contains(f)));

        for vpn in 1..5usize {
            let mut byte = [0u8; 1];
            assert_eq!(a.read_vm(&k, (vpn * PAGE) as u32, &mut byte), 1);
            assert_eq!(byte[0], 0xa0 | vpn as u8);
            assert_eq!(b.read_vm(&k, (vpn * PAGE) as u32, &mut byte), 1);
            assert_eq!(byte[0], 0xb0 | vpn as u8);
        }
    }
}
