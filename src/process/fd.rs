//! Per-process file-descriptor table.

use crate::machine::OpenFile;
use std::sync::Arc;

/// A fixed-capacity sparse map from small integers to open files.
///
/// Slots 0 and 1 are pre-wired to the console at process creation; they can
/// be closed and their numbers reused like any other descriptor.
pub struct FdTable {
    slots: Vec<Option<Arc<dyn OpenFile>>>,
}

impl FdTable {
    /// An empty table with `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    /// Put `file` into the smallest unused slot, returning its number, or
    /// `None` when the table is full.
    pub fn allocate(&mut self, file: Arc<dyn OpenFile>) -> Option<usize> {
        let fd = self.slots.iter().position(|s| s.is_none())?;
        self.slots[fd] = Some(file);
        Some(fd)
    }

    /// Put `file` into slot `fd`, replacing whatever was there.
    pub fn install(&mut self, fd: usize, file: Arc<dyn OpenFile>) {
        self.slots[fd] = Some(file);
    }

    /// The file behind `fd`, if any. Negative and out-of-range descriptors
    /// yield `None`.
    pub fn get(&self, fd: i32) -> Option<Arc<dyn OpenFile>> {
        usize::try_from(fd)
            .ok()
            .and_then(|fd| self.slots.get(fd))
            .and_then(|s| s.clone())
    }

    /// Free slot `fd`. Returns whether it was in use.
    pub fn close(&mut self, fd: i32) -> bool {
        match usize::try_from(fd).ok().and_then(|fd| self.slots.get_mut(fd)) {
            Some(slot) => slot.take().is_some(),
            None => false,
        }
    }

    /// Drop every open file. Closing twice is harmless.
    pub fn close_all(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.take();
        }
    }
}
