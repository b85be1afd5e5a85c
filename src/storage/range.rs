//! Page ranges: a fixed block of base slots plus the tail pages holding
//! their updates.
//!
//! Base columns split in two groups. `RID`, `INDIRECTION` and `TIMESTAMP`
//! live in pages allocated once per range and are written in place; the
//! indirection slot is the linearization point of every update. The merged
//! columns (`SCHEMA_ENCODING` and the user columns) live in a
//! [`BaseLayout`] that only the merge engine replaces, copy-on-write, by
//! swapping an `Arc`.
//!
//! Page numbers are allocated per range and shared by every column file of
//! the range, so one page number addresses a whole row group.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::primitives::cache::{Cache, PageHandle};
use crate::primitives::page::{slots_per_page, Page, PageKind};
use crate::types::{LStoreError, PageKey, PageNo, RangeId, Result, Rid, TableId, Timestamp};

use super::record::{
    user_column, TailEntry, TailPtr, Version, INDIRECTION_COLUMN, META_COLUMNS, RID_COLUMN,
    SCHEMA_ENCODING_COLUMN, TIMESTAMP_COLUMN,
};

/// Merged base pages of one range at one merge generation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BaseLayout {
    /// Page number of each base page index.
    pub pages: Vec<PageNo>,
    /// Tail entries strictly below this pointer are folded into the pages.
    pub watermark: TailPtr,
    /// Newest commit timestamp folded into the pages.
    pub watermark_ts: Timestamp,
    /// Number of merges that produced this layout.
    pub generation: u64,
}

struct TailState {
    pages: BTreeMap<u32, PageNo>,
    next: TailPtr,
    inflight: BTreeSet<TailPtr>,
    since_merge: usize,
}

struct PageAllocator {
    next: u32,
    free: BTreeSet<u32>,
}

struct Retired {
    layout: Arc<BaseLayout>,
    tails: Vec<(u32, PageNo)>,
    retire_ts: Timestamp,
}

struct History {
    retired: Vec<Retired>,
    floor: Timestamp,
}

/// Shape shared by every range of a table.
#[derive(Copy, Clone, Debug)]
pub struct RangeShape {
    /// Owning table.
    pub table: TableId,
    /// Number of user columns.
    pub user_columns: usize,
    /// Base slots per range.
    pub capacity: usize,
    /// Slots per page.
    pub slots_per_page: usize,
}

impl RangeShape {
    /// Derives the shape from table parameters.
    pub fn new(table: TableId, user_columns: usize, capacity: usize, page_size: usize) -> Self {
        Self {
            table,
            user_columns,
            capacity,
            slots_per_page: slots_per_page(page_size),
        }
    }

    /// Base pages needed to hold `capacity` slots.
    pub fn base_pages(&self) -> usize {
        self.capacity.div_ceil(self.slots_per_page)
    }

    fn physical_columns(&self) -> u16 {
        (META_COLUMNS + self.user_columns) as u16
    }
}

/// Persisted description of one range, stored in the table catalog.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RangeMeta {
    /// Range id.
    pub id: RangeId,
    /// Base slots in use.
    pub records: usize,
    /// Pages of the in-place base columns.
    pub inplace_pages: Vec<PageNo>,
    /// Current merged layout.
    pub layout: BaseLayout,
    /// Live tail pages by sequence number.
    pub tail_pages: Vec<(u32, PageNo)>,
    /// Next tail append position.
    pub next_tail: TailPtr,
    /// Tail entries appended since the last merge.
    pub since_merge: usize,
    /// Next never-used page number.
    pub next_page: u32,
    /// Page numbers free for reuse.
    pub free_pages: Vec<u32>,
    /// Oldest readable timestamp.
    pub history_floor: Timestamp,
}

/// One page range.
pub struct PageRange {
    id: RangeId,
    shape: RangeShape,
    cache: Arc<Cache>,
    inplace: Vec<PageNo>,
    records: Mutex<usize>,
    layout: RwLock<Arc<BaseLayout>>,
    tail: Mutex<TailState>,
    allocator: Mutex<PageAllocator>,
    history: Mutex<History>,
    merging: AtomicBool,
    merge_requested: AtomicBool,
}

/// Clears the merge flag of a range when dropped.
pub struct MergeGuard<'a> {
    range: &'a PageRange,
}

impl Drop for MergeGuard<'_> {
    fn drop(&mut self) {
        self.range.merging.store(false, Ordering::Release);
    }
}

impl PageRange {
    /// Creates an empty range.
    pub fn create(id: RangeId, shape: RangeShape, cache: Arc<Cache>) -> Self {
        let pages = shape.base_pages() as u32;
        let inplace = (0..pages).map(PageNo).collect();
        let layout = BaseLayout {
            pages: (pages..2 * pages).map(PageNo).collect(),
            watermark: TailPtr::ORIGIN,
            watermark_ts: 0,
            generation: 0,
        };
        Self::assemble(
            id,
            shape,
            cache,
            inplace,
            0,
            layout,
            TailState {
                pages: BTreeMap::new(),
                next: TailPtr::ORIGIN,
                inflight: BTreeSet::new(),
                since_merge: 0,
            },
            PageAllocator {
                next: 2 * pages,
                free: BTreeSet::new(),
            },
            0,
        )
    }

    /// Rebuilds a range from its catalog entry.
    pub fn restore(meta: RangeMeta, shape: RangeShape, cache: Arc<Cache>) -> Result<Self> {
        if meta.inplace_pages.len() != shape.base_pages()
            || meta.layout.pages.len() != shape.base_pages()
            || meta.records > shape.capacity
        {
            return Err(LStoreError::Corruption("range metadata does not match table shape"));
        }
        Ok(Self::assemble(
            meta.id,
            shape,
            cache,
            meta.inplace_pages,
            meta.records,
            meta.layout,
            TailState {
                pages: meta.tail_pages.into_iter().collect(),
                next: meta.next_tail,
                inflight: BTreeSet::new(),
                since_merge: meta.since_merge,
            },
            PageAllocator {
                next: meta.next_page,
                free: meta.free_pages.into_iter().collect(),
            },
            meta.history_floor,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        id: RangeId,
        shape: RangeShape,
        cache: Arc<Cache>,
        inplace: Vec<PageNo>,
        records: usize,
        layout: BaseLayout,
        tail: TailState,
        allocator: PageAllocator,
        floor: Timestamp,
    ) -> Self {
        Self {
            id,
            shape,
            cache,
            inplace,
            records: Mutex::new(records),
            layout: RwLock::new(Arc::new(layout)),
            tail: Mutex::new(tail),
            allocator: Mutex::new(allocator),
            history: Mutex::new(History {
                retired: Vec::new(),
                floor,
            }),
            merging: AtomicBool::new(false),
            merge_requested: AtomicBool::new(false),
        }
    }

    /// Snapshot of the range for the catalog.
    ///
    /// Retirements older than `horizon` are reclaimed first. Pages of the
    /// rest stay reserved in memory for the snapshots that may still read
    /// them, but the saved image lists them as free since no snapshot
    /// outlives a reopen.
    pub fn meta(&self, horizon: Timestamp) -> RangeMeta {
        self.reclaim(horizon);
        let history = self.history.lock();
        let tail = self.tail.lock();
        let allocator = self.allocator.lock();
        let mut free = allocator.free.clone();
        let mut tail_pages = tail.pages.clone();
        let mut floor = history.floor;
        for retired in &history.retired {
            free.extend(retired.layout.pages.iter().map(|page| page.0));
            for (seq, page) in &retired.tails {
                tail_pages.remove(seq);
                free.insert(page.0);
            }
            floor = floor.max(retired.retire_ts);
        }
        RangeMeta {
            id: self.id,
            records: *self.records.lock(),
            inplace_pages: self.inplace.clone(),
            layout: self.layout().as_ref().clone(),
            tail_pages: tail_pages.into_iter().collect(),
            next_tail: tail.next,
            since_merge: tail.since_merge,
            next_page: allocator.next,
            free_pages: free.into_iter().collect(),
            history_floor: floor,
        }
    }

    /// Range id.
    pub fn id(&self) -> RangeId {
        self.id
    }

    /// Slots per page in this range.
    pub fn slots_per_page(&self) -> usize {
        self.shape.slots_per_page
    }

    fn key(&self, column: u16, page: PageNo) -> PageKey {
        PageKey::new(self.shape.table, column, self.id, page)
    }

    fn locate(&self, slot: u32) -> (usize, usize) {
        let slot = slot as usize;
        (
            slot / self.shape.slots_per_page,
            slot % self.shape.slots_per_page,
        )
    }

    fn read_cell(&self, column: u16, page: PageNo, offset: usize) -> Result<i64> {
        self.cache.get_page(self.key(column, page))?.read_slot(offset)
    }

    fn write_cell(&self, column: u16, page: PageNo, offset: usize, value: i64) -> Result<()> {
        let handle = self.cache.get_page(self.key(column, page))?;
        write_into(&handle, offset, value)
    }

    // ---------------------------------------------------------------- base

    /// Base slots in use.
    pub fn records(&self) -> usize {
        *self.records.lock()
    }

    /// True when every base slot is taken.
    pub fn is_full(&self) -> bool {
        self.records() >= self.shape.capacity
    }

    /// Current merged layout.
    pub fn layout(&self) -> Arc<BaseLayout> {
        self.layout.read().clone()
    }

    /// Writes a new base record into the next free slot.
    ///
    /// Returns `None` when the range is full. The slot only becomes taken
    /// once every column is written.
    pub fn allocate_slot(&self, rid: Rid, values: &[i64], ts: Timestamp) -> Result<Option<u32>> {
        let mut records = self.records.lock();
        if *records >= self.shape.capacity {
            return Ok(None);
        }
        let slot = *records as u32;
        let (idx, offset) = self.locate(slot);
        let inplace = self.inplace[idx];
        self.write_cell(RID_COLUMN, inplace, offset, rid.0 as i64)?;
        self.write_cell(INDIRECTION_COLUMN, inplace, offset, TailPtr::NULL.raw() as i64)?;
        self.write_cell(TIMESTAMP_COLUMN, inplace, offset, ts as i64)?;
        let layout = self.layout();
        let page = layout.pages[idx];
        self.write_cell(SCHEMA_ENCODING_COLUMN, page, offset, 0)?;
        for (column, &value) in values.iter().enumerate() {
            self.write_cell(user_column(column), page, offset, value)?;
        }
        *records += 1;
        Ok(Some(slot))
    }

    /// Record id stored in a base slot.
    pub fn rid_at(&self, slot: u32) -> Result<Rid> {
        let (idx, offset) = self.locate(slot);
        Ok(Rid(self.read_cell(RID_COLUMN, self.inplace[idx], offset)? as u64))
    }

    /// Newest tail entry of a record.
    pub fn head(&self, slot: u32) -> Result<TailPtr> {
        let (idx, offset) = self.locate(slot);
        let raw = self.read_cell(INDIRECTION_COLUMN, self.inplace[idx], offset)?;
        Ok(TailPtr::from_raw(raw as u64))
    }

    /// Repoints a record at a new newest entry.
    pub fn set_head(&self, slot: u32, head: TailPtr) -> Result<()> {
        let (idx, offset) = self.locate(slot);
        self.write_cell(INDIRECTION_COLUMN, self.inplace[idx], offset, head.raw() as i64)
    }

    /// Commit timestamp of the insert that created a record.
    pub fn insert_ts(&self, slot: u32) -> Result<Timestamp> {
        let (idx, offset) = self.locate(slot);
        Ok(self.read_cell(TIMESTAMP_COLUMN, self.inplace[idx], offset)? as u64)
    }

    /// Stamps the insert timestamp of a base record.
    pub fn stamp_insert(&self, slot: u32, ts: Timestamp) -> Result<()> {
        let (idx, offset) = self.locate(slot);
        self.write_cell(TIMESTAMP_COLUMN, self.inplace[idx], offset, ts as i64)
    }

    /// Reads the merged base row of `slot` from `layout`.
    pub(crate) fn read_base(&self, layout: &BaseLayout, slot: u32) -> Result<Version> {
        let (idx, offset) = self.locate(slot);
        let page = layout.pages[idx];
        let encoding = self.read_cell(SCHEMA_ENCODING_COLUMN, page, offset)? as u64;
        let values = (0..self.shape.user_columns)
            .map(|column| self.read_cell(user_column(column), page, offset))
            .collect::<Result<Vec<_>>>()?;
        Ok(Version {
            encoding,
            ts: layout.watermark_ts,
            values,
        })
    }

    // ---------------------------------------------------------------- tail

    /// Appends a tail entry and returns its pointer together with the number
    /// of entries appended since the last merge.
    ///
    /// The entry is registered in-flight until [`PageRange::finish`] is
    /// called for it, which keeps it out of merges.
    pub(crate) fn append_tail(&self, entry: &TailEntry) -> Result<(TailPtr, usize)> {
        let mut tail = self.tail.lock();
        let ptr = tail.next;
        let page = match tail.pages.get(&ptr.seq()) {
            Some(&page) => page,
            None => {
                let page = self.allocate_page();
                for column in 0..self.shape.physical_columns() {
                    if let Err(err) = self.cache.new_page(self.key(column, page), PageKind::Tail) {
                        self.free_page(page);
                        return Err(err);
                    }
                }
                tail.pages.insert(ptr.seq(), page);
                page
            }
        };
        let offset = ptr.slot() as usize;
        self.write_cell(RID_COLUMN, page, offset, entry.rid.0 as i64)?;
        self.write_cell(INDIRECTION_COLUMN, page, offset, entry.prev.raw() as i64)?;
        self.write_cell(SCHEMA_ENCODING_COLUMN, page, offset, entry.encoding as i64)?;
        self.write_cell(TIMESTAMP_COLUMN, page, offset, entry.ts as i64)?;
        for (column, &value) in entry.values.iter().enumerate() {
            self.write_cell(user_column(column), page, offset, value)?;
        }
        tail.next = if offset + 1 >= self.shape.slots_per_page {
            TailPtr::new(ptr.seq() + 1, 0)
        } else {
            TailPtr::new(ptr.seq(), ptr.slot() + 1)
        };
        tail.inflight.insert(ptr);
        tail.since_merge += 1;
        Ok((ptr, tail.since_merge))
    }

    fn tail_page(&self, ptr: TailPtr) -> Result<PageNo> {
        self.tail
            .lock()
            .pages
            .get(&ptr.seq())
            .copied()
            .ok_or(LStoreError::Corruption("tail pointer into reclaimed page"))
    }

    /// Reads a full tail entry.
    pub(crate) fn read_entry(&self, ptr: TailPtr) -> Result<TailEntry> {
        let page = self.tail_page(ptr)?;
        let offset = ptr.slot() as usize;
        let values = (0..self.shape.user_columns)
            .map(|column| self.read_cell(user_column(column), page, offset))
            .collect::<Result<Vec<_>>>()?;
        Ok(TailEntry {
            rid: Rid(self.read_cell(RID_COLUMN, page, offset)? as u64),
            prev: TailPtr::from_raw(self.read_cell(INDIRECTION_COLUMN, page, offset)? as u64),
            encoding: self.read_cell(SCHEMA_ENCODING_COLUMN, page, offset)? as u64,
            ts: self.read_cell(TIMESTAMP_COLUMN, page, offset)? as u64,
            values,
        })
    }

    /// Predecessor of a tail entry.
    pub(crate) fn read_prev(&self, ptr: TailPtr) -> Result<TailPtr> {
        let page = self.tail_page(ptr)?;
        let raw = self.read_cell(INDIRECTION_COLUMN, page, ptr.slot() as usize)?;
        Ok(TailPtr::from_raw(raw as u64))
    }

    /// Stamps the commit timestamp of a tail entry.
    pub(crate) fn stamp_entry(&self, ptr: TailPtr, ts: Timestamp) -> Result<()> {
        let page = self.tail_page(ptr)?;
        self.write_cell(TIMESTAMP_COLUMN, page, ptr.slot() as usize, ts as i64)
    }

    /// Marks entries as resolved (committed or unlinked by an abort).
    pub(crate) fn finish(&self, ptrs: &[TailPtr]) {
        let mut tail = self.tail.lock();
        for ptr in ptrs {
            tail.inflight.remove(ptr);
        }
    }

    /// Tail entries appended since the last merge.
    pub fn pending_entries(&self) -> usize {
        self.tail.lock().since_merge
    }

    /// First tail position a merge may not consume: the oldest in-flight
    /// entry, or the append position when nothing is in flight.
    pub fn merge_horizon(&self) -> TailPtr {
        let tail = self.tail.lock();
        tail.inflight.first().copied().unwrap_or(tail.next)
    }

    /// Number of chain entries newer than the current base.
    pub fn chain_len(&self, slot: u32) -> Result<usize> {
        let layout = self.layout();
        let mut ptr = self.head(slot)?;
        let mut len = 0;
        while !ptr.is_null() && ptr >= layout.watermark {
            len += 1;
            ptr = self.read_prev(ptr)?;
        }
        Ok(len)
    }

    // ---------------------------------------------------------------- reads

    /// Newest version of a record, own uncommitted writes included.
    pub(crate) fn read_latest(&self, slot: u32) -> Result<Version> {
        let layout = self.layout();
        let head = self.head(slot)?;
        if head.is_null() || head < layout.watermark {
            return self.read_base(&layout, slot);
        }
        Ok(self.read_entry(head)?.into_version())
    }

    /// Version of a record visible at `ts`, or `None` when the record did
    /// not exist yet.
    pub(crate) fn read_as_of(&self, slot: u32, ts: Timestamp) -> Result<Option<Version>> {
        let layouts = self.history_view(ts)?;
        let head = self.head(slot)?;
        if head.is_null() {
            if self.insert_ts(slot)? > ts {
                return Ok(None);
            }
            return self.read_base(&layouts[0], slot).map(Some);
        }
        let mut ptr = head;
        let mut next_layout = 0;
        loop {
            while next_layout < layouts.len()
                && !ptr.is_null()
                && ptr < layouts[next_layout].watermark
            {
                let layout = &layouts[next_layout];
                if ts >= layout.watermark_ts {
                    return self.read_base(layout, slot).map(Some);
                }
                next_layout += 1;
            }
            if ptr.is_null() {
                return Ok(None);
            }
            let entry = self.read_entry(ptr)?;
            if entry.ts <= ts {
                return Ok(Some(entry.into_version()));
            }
            ptr = entry.prev;
        }
    }

    /// Current layout followed by retained older layouts, newest first.
    fn history_view(&self, ts: Timestamp) -> Result<Vec<Arc<BaseLayout>>> {
        let history = self.history.lock();
        if ts < history.floor {
            return Err(LStoreError::SnapshotTooOld {
                requested: ts,
                floor: history.floor,
            });
        }
        let mut layouts = Vec::with_capacity(history.retired.len() + 1);
        layouts.push(self.layout());
        layouts.extend(history.retired.iter().rev().map(|r| r.layout.clone()));
        Ok(layouts)
    }

    /// Oldest timestamp an as-of read may ask for.
    pub fn history_floor(&self) -> Timestamp {
        self.history.lock().floor
    }

    // ---------------------------------------------------------------- pages

    /// Takes a page number from the free list or extends the range.
    pub fn allocate_page(&self) -> PageNo {
        let mut allocator = self.allocator.lock();
        match allocator.free.pop_first() {
            Some(page) => PageNo(page),
            None => {
                let page = allocator.next;
                allocator.next += 1;
                PageNo(page)
            }
        }
    }

    /// Drops every cached column of `page` and returns it to the free list.
    pub fn free_page(&self, page: PageNo) {
        for column in 0..self.shape.physical_columns() {
            self.cache.discard(self.key(column, page));
        }
        self.allocator.lock().free.insert(page.0);
    }

    /// Number of page numbers waiting for reuse.
    pub fn free_pages(&self) -> usize {
        self.allocator.lock().free.len()
    }

    // ---------------------------------------------------------------- merge

    /// Claims the range for a merge; `None` while another merge runs.
    ///
    /// Either way the outstanding merge request is consumed, so the next
    /// append past the threshold asks again.
    pub fn try_begin_merge(&self) -> Option<MergeGuard<'_>> {
        self.merge_requested.store(false, Ordering::Release);
        self.merging
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| MergeGuard { range: self })
    }

    /// Marks a merge as requested. Returns false when a request is already
    /// outstanding.
    pub fn request_merge(&self) -> bool {
        !self.merge_requested.swap(true, Ordering::AcqRel)
    }

    /// Creates the merged-column pages of a new layout page.
    pub(crate) fn new_layout_page(&self, page: PageNo) -> Result<Vec<PageHandle>> {
        let mut handles = Vec::with_capacity(self.shape.user_columns + 1);
        handles.push(
            self.cache
                .new_page(self.key(SCHEMA_ENCODING_COLUMN, page), PageKind::Base)?,
        );
        for column in 0..self.shape.user_columns {
            handles.push(
                self.cache
                    .new_page(self.key(user_column(column), page), PageKind::Base)?,
            );
        }
        Ok(handles)
    }

    /// Installs `layout` and retires the one it replaces.
    ///
    /// Rows inserted after the merge snapshotted `merged_rows` are copied
    /// across under the insert lock, so no insert is lost. Tail pages lying
    /// wholly below the new watermark are retired with the old layout.
    pub(crate) fn swap_layout(&self, layout: BaseLayout, merged_rows: usize) -> Result<usize> {
        let mut history = self.history.lock();
        let records = self.records.lock();
        let old = self.layout();
        for slot in merged_rows..*records {
            let row = self.read_base(&old, slot as u32)?;
            let (idx, offset) = self.locate(slot as u32);
            let page = layout.pages[idx];
            self.write_cell(SCHEMA_ENCODING_COLUMN, page, offset, row.encoding as i64)?;
            for (column, &value) in row.values.iter().enumerate() {
                self.write_cell(user_column(column), page, offset, value)?;
            }
        }
        let watermark = layout.watermark;
        let retire_ts = layout.watermark_ts;
        *self.layout.write() = Arc::new(layout);
        drop(records);

        let mut tail = self.tail.lock();
        let retired_tails: Vec<(u32, PageNo)> = tail
            .pages
            .range(..watermark.seq())
            .map(|(&seq, &page)| (seq, page))
            .collect();
        let position =
            |ptr: TailPtr| ptr.seq() as usize * self.shape.slots_per_page + ptr.slot() as usize;
        tail.since_merge = position(tail.next).saturating_sub(position(watermark));
        drop(tail);

        let pages = old.pages.len() + retired_tails.len();
        let already_retired: BTreeSet<u32> = history
            .retired
            .iter()
            .flat_map(|r| r.tails.iter().map(|(seq, _)| *seq))
            .collect();
        history.retired.push(Retired {
            layout: old,
            tails: retired_tails
                .into_iter()
                .filter(|(seq, _)| !already_retired.contains(seq))
                .collect(),
            retire_ts,
        });
        Ok(pages)
    }

    /// Frees retired pages no reader can reach any more.
    ///
    /// A retirement is reclaimable once its layout is referenced only from
    /// here and every registered snapshot reads at or after `horizon`.
    pub fn reclaim(&self, horizon: Timestamp) -> usize {
        let mut history = self.history.lock();
        let mut freed = Vec::new();
        let mut floor = history.floor;
        history.retired.retain(|retired| {
            let reachable = Arc::strong_count(&retired.layout) > 1 || retired.retire_ts > horizon;
            if !reachable {
                freed.extend(retired.layout.pages.iter().copied());
                freed.extend(retired.tails.iter().map(|(_, page)| *page));
                floor = floor.max(retired.retire_ts);
            }
            reachable
        });
        history.floor = floor;
        if freed.is_empty() {
            return 0;
        }
        {
            let mut tail = self.tail.lock();
            let freed_set: BTreeSet<PageNo> = freed.iter().copied().collect();
            tail.pages.retain(|_, page| !freed_set.contains(page));
        }
        for &page in &freed {
            self.free_page(page);
        }
        debug!(range = self.id.0, pages = freed.len(), floor, "range.reclaim");
        freed.len()
    }

    /// Number of retirements waiting for reclamation.
    pub fn retired_len(&self) -> usize {
        self.history.lock().retired.len()
    }
}

/// Writes one slot through a pinned handle, initialising a blank base page
/// and extending its record count.
pub(crate) fn write_into(handle: &PageHandle, offset: usize, value: i64) -> Result<()> {
    handle.write(|page| {
        if page.is_blank() {
            *page = Page::new(PageKind::Base, page.len());
        }
        page.write_slot(offset, value)?;
        if page.num_records() as usize <= offset {
            page.set_num_records(offset as u32 + 1);
        }
        Ok(())
    })
}
