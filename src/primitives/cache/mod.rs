#![forbid(unsafe_code)]

//! Bounded page cache (buffer pool) in front of [`DiskStore`].
//!
//! Pages are keyed by (table, column, range, page). A miss loads the block
//! from disk, evicting the least-recently-used unpinned page first and
//! writing it back when dirty. The LRU order and residency live under one
//! short-held mutex that is never held across disk I/O; page contents are
//! guarded per frame and their semantic consistency is the caller's business
//! (record locks).

mod frame;

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use rustc_hash::FxHasher;
use tracing::{debug, warn};

pub use frame::PageHandle;

use self::frame::Frame;
use crate::primitives::disk::DiskStore;
use crate::primitives::page::{Page, PageKind};
use crate::types::{LStoreError, PageKey, Result, TableId};

/// Counters describing cache behaviour since creation.
#[derive(Default, Clone, Debug, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups served from memory.
    pub hits: u64,
    /// Lookups that faulted to disk.
    pub misses: u64,
    /// Pages removed to make room.
    pub evictions: u64,
    /// Dirty pages written back during eviction.
    pub dirty_writebacks: u64,
    /// Dirty pages written back by explicit flushes.
    pub flushes: u64,
    /// Pages resident right now.
    pub resident: usize,
}

const LOAD_LATCHES: usize = 64;

enum Eviction {
    Evicted,
    Retry,
    AllPinned,
}

struct CacheInner {
    frames: LruCache<PageKey, Arc<Frame>>,
    stats: CacheStats,
}

/// Page cache shared by every table of a database.
pub struct Cache {
    capacity: usize,
    verify_checksums: bool,
    disk: Arc<DiskStore>,
    inner: Mutex<CacheInner>,
    loads: Vec<Mutex<()>>,
}

impl Cache {
    /// Creates a cache holding at most `capacity` pages.
    pub fn new(capacity: usize, disk: Arc<DiskStore>, verify_checksums: bool) -> Self {
        Self {
            capacity: capacity.max(1),
            verify_checksums,
            disk,
            inner: Mutex::new(CacheInner {
                frames: LruCache::unbounded(),
                stats: CacheStats::default(),
            }),
            loads: (0..LOAD_LATCHES).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Maximum number of resident pages.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Page size of the backing store.
    pub fn page_size(&self) -> usize {
        self.disk.page_size()
    }

    /// Backing block store.
    pub fn disk(&self) -> &Arc<DiskStore> {
        &self.disk
    }

    /// Returns a pinned handle, loading the page from disk on a miss.
    ///
    /// A block that was never written comes back blank (zero-filled). Disk
    /// reads and write-backs happen outside the cache mutex; concurrent
    /// misses on the same page wait on its load latch and then hit.
    pub fn get_page(&self, key: PageKey) -> Result<PageHandle> {
        if let Some(handle) = self.lookup(&key) {
            return Ok(handle);
        }
        let _loading = self.load_latch(&key).lock();
        if let Some(handle) = self.lookup(&key) {
            return Ok(handle);
        }
        self.inner.lock().stats.misses += 1;
        self.make_room()?;
        let page = self.disk.read_page(&key)?;
        if self.verify_checksums {
            page.verify_checksum(&key)?;
        }
        let frame = Arc::new(Frame::new(key, page, false));
        let handle = PageHandle::pin(frame.clone());
        self.inner.lock().frames.put(key, frame);
        Ok(handle)
    }

    fn lookup(&self, key: &PageKey) -> Option<PageHandle> {
        let mut inner = self.inner.lock();
        let handle = PageHandle::pin(inner.frames.get(key)?.clone());
        inner.stats.hits += 1;
        Some(handle)
    }

    fn load_latch(&self, key: &PageKey) -> &Mutex<()> {
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        &self.loads[hasher.finish() as usize % self.loads.len()]
    }

    /// Installs a freshly initialised page at `key`, replacing any cached
    /// image, and returns it pinned and dirty.
    pub fn new_page(&self, key: PageKey, kind: PageKind) -> Result<PageHandle> {
        let page = Page::new(kind, self.disk.page_size());
        if let Some(frame) = self.inner.lock().frames.get(&key).cloned() {
            let handle = PageHandle::pin(frame);
            handle.write(|current| *current = page);
            return Ok(handle);
        }
        self.make_room()?;
        let mut inner = self.inner.lock();
        if let Some(frame) = inner.frames.get(&key) {
            let handle = PageHandle::pin(frame.clone());
            handle.write(|current| *current = page);
            return Ok(handle);
        }
        let frame = Arc::new(Frame::new(key, page, true));
        let handle = PageHandle::pin(frame.clone());
        inner.frames.put(key, frame);
        Ok(handle)
    }

    /// Evicts unpinned pages until the cache is within capacity.
    pub fn evict_if_needed(&self) -> Result<usize> {
        let mut evicted = 0;
        while self.len() > self.capacity {
            match self.evict_one()? {
                Eviction::Evicted => evicted += 1,
                Eviction::Retry => {}
                Eviction::AllPinned => break,
            }
        }
        Ok(evicted)
    }

    /// Frees one slot for a page about to be inserted. Concurrent loads may
    /// overshoot the capacity by the number of loaders.
    fn make_room(&self) -> Result<()> {
        while self.len() >= self.capacity {
            if let Eviction::AllPinned = self.evict_one()? {
                warn!(
                    capacity = self.capacity,
                    resident = self.len(),
                    "cache.make_room.all_pinned"
                );
                return Err(LStoreError::CapacityExceeded("every cached page is pinned"));
            }
        }
        Ok(())
    }

    /// Removes the least recently used unpinned page. A dirty victim is
    /// written back without the cache mutex and only dropped if nobody
    /// pinned or dirtied it meanwhile.
    fn evict_one(&self) -> Result<Eviction> {
        let (key, frame) = {
            let mut inner = self.inner.lock();
            let victim = inner
                .frames
                .iter()
                .rev()
                .find(|(_, frame)| !frame.is_pinned())
                .map(|(key, frame)| (*key, frame.clone()));
            let Some((key, frame)) = victim else {
                return Ok(Eviction::AllPinned);
            };
            if !frame.is_dirty() {
                inner.frames.pop(&key);
                inner.stats.evictions += 1;
                debug!(page = %key, "cache.evict");
                return Ok(Eviction::Evicted);
            }
            (key, frame)
        };
        self.write_back(&frame)?;
        let mut inner = self.inner.lock();
        inner.stats.dirty_writebacks += 1;
        let unchanged = inner
            .frames
            .peek(&key)
            .is_some_and(|current| Arc::ptr_eq(current, &frame));
        if unchanged && !frame.is_dirty() && !frame.is_pinned() {
            inner.frames.pop(&key);
            inner.stats.evictions += 1;
            debug!(page = %key, "cache.evict");
            return Ok(Eviction::Evicted);
        }
        Ok(Eviction::Retry)
    }

    fn write_back(&self, frame: &Frame) -> Result<()> {
        let mut page = frame.page.write();
        if !frame.is_dirty() {
            return Ok(());
        }
        page.seal_checksum(&frame.key);
        self.disk.write_page(&frame.key, &page)?;
        frame.dirty.store(false, std::sync::atomic::Ordering::Release);
        Ok(())
    }

    /// Writes one page back if it is resident and dirty. Returns whether a
    /// write happened; repeated calls are no-ops.
    pub fn flush(&self, key: PageKey) -> Result<bool> {
        let frame = {
            let inner = self.inner.lock();
            inner.frames.peek(&key).cloned()
        };
        let Some(frame) = frame else {
            return Ok(false);
        };
        if !frame.is_dirty() {
            return Ok(false);
        }
        self.write_back(&frame)?;
        self.inner.lock().stats.flushes += 1;
        Ok(true)
    }

    /// Writes back every dirty page of one table.
    pub fn flush_table(&self, table: TableId) -> Result<usize> {
        self.flush_matching(|key| key.table == table)
    }

    /// Writes back every dirty page.
    pub fn flush_all(&self) -> Result<usize> {
        self.flush_matching(|_| true)
    }

    fn flush_matching(&self, filter: impl Fn(&PageKey) -> bool) -> Result<usize> {
        let dirty: Vec<Arc<Frame>> = {
            let inner = self.inner.lock();
            inner
                .frames
                .iter()
                .filter(|(key, frame)| filter(key) && frame.is_dirty())
                .map(|(_, frame)| frame.clone())
                .collect()
        };
        for frame in &dirty {
            self.write_back(frame)?;
        }
        self.inner.lock().stats.flushes += dirty.len() as u64;
        Ok(dirty.len())
    }

    /// Drops a page without writing it back. Used for pages whose block has
    /// been released for reuse.
    pub fn discard(&self, key: PageKey) {
        self.inner.lock().frames.pop(&key);
    }

    /// Drops every page belonging to `table` without writing it back.
    pub fn discard_table(&self, table: TableId) {
        let mut inner = self.inner.lock();
        let keys: Vec<PageKey> = inner
            .frames
            .iter()
            .filter(|(key, _)| key.table == table)
            .map(|(key, _)| *key)
            .collect();
        for key in keys {
            inner.frames.pop(&key);
        }
    }

    /// True if the page is currently in memory.
    pub fn is_resident(&self, key: &PageKey) -> bool {
        self.inner.lock().frames.contains(key)
    }

    /// Number of resident pages.
    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    /// True when no page is resident.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the cache counters.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let mut stats = inner.stats.clone();
        stats.resident = inner.frames.len();
        stats
    }
}
