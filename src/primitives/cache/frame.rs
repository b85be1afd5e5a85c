use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::primitives::page::Page;
use crate::types::{PageKey, Result};

pub(super) struct Frame {
    pub(super) key: PageKey,
    pub(super) page: RwLock<Page>,
    pub(super) dirty: AtomicBool,
    pub(super) pins: AtomicU32,
}

impl Frame {
    pub(super) fn new(key: PageKey, page: Page, dirty: bool) -> Self {
        Self {
            key,
            page: RwLock::new(page),
            dirty: AtomicBool::new(dirty),
            pins: AtomicU32::new(0),
        }
    }

    pub(super) fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) > 0
    }

    pub(super) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }
}

/// Pinned reference to a cached page.
///
/// The page cannot be evicted while any handle to it is alive. Cloning a
/// handle adds a pin; dropping it removes one.
pub struct PageHandle {
    frame: Arc<Frame>,
}

impl PageHandle {
    /// Pins `frame`. Callers hold the cache lock or an existing pin.
    pub(super) fn pin(frame: Arc<Frame>) -> Self {
        frame.pins.fetch_add(1, Ordering::AcqRel);
        Self { frame }
    }

    /// Address of the pinned page.
    pub fn key(&self) -> PageKey {
        self.frame.key
    }

    /// Runs `f` with shared access to the page image.
    pub fn read<R>(&self, f: impl FnOnce(&Page) -> R) -> R {
        let page = self.frame.page.read();
        f(&page)
    }

    /// Runs `f` with exclusive access and marks the page dirty.
    pub fn write<R>(&self, f: impl FnOnce(&mut Page) -> R) -> R {
        let mut page = self.frame.page.write();
        let out = f(&mut page);
        self.frame.dirty.store(true, Ordering::Release);
        out
    }

    /// Reads one slot.
    pub fn read_slot(&self, slot: usize) -> Result<i64> {
        self.read(|page| page.read_slot(slot))
    }

    /// Reads one metadata word.
    pub fn read_word(&self, slot: usize) -> Result<u64> {
        self.read(|page| page.read_word(slot))
    }

    /// Writes one slot and marks the page dirty.
    pub fn write_slot(&self, slot: usize, value: i64) -> Result<()> {
        self.write(|page| page.write_slot(slot, value))
    }

    /// Writes one metadata word and marks the page dirty.
    pub fn write_word(&self, slot: usize, value: u64) -> Result<()> {
        self.write(|page| page.write_word(slot, value))
    }

    /// Marks the page dirty without touching its contents.
    pub fn mark_dirty(&self) {
        self.frame.dirty.store(true, Ordering::Release);
    }

    /// Current number of pins, this handle included.
    pub fn pin_count(&self) -> u32 {
        self.frame.pins.load(Ordering::Acquire)
    }
}

impl Clone for PageHandle {
    fn clone(&self) -> Self {
        Self::pin(self.frame.clone())
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        self.frame.pins.fetch_sub(1, Ordering::AcqRel);
    }
}
