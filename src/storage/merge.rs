//! Background consolidation of tail entries into fresh base pages.
//!
//! A merge folds every committed tail entry below the range's merge horizon
//! into a new [`BaseLayout`], written to freshly allocated pages, and
//! installs it with a single pointer swap. The layout it replaces is
//! retired, together with the tail pages it made redundant, and reclaimed
//! once no reader can reach it.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Weak;
use std::thread;

use tracing::{debug, info, warn};

use crate::types::{LStoreError, PageNo, RangeId, Result};

use super::range::{write_into, BaseLayout, PageRange};
use super::record::{apply_newest_first, TailEntry, TailPtr};
use super::table::TableCore;

/// Outcome of one merge cycle.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MergeStats {
    /// Merged range.
    pub range: RangeId,
    /// Records whose base row absorbed at least one tail entry.
    pub records_merged: usize,
    /// Base pages written (per column group).
    pub pages_written: usize,
    /// Pages handed to the retirement list.
    pub pages_retired: usize,
    /// Retired pages freed by the reclamation following the merge.
    pub pages_reclaimed: usize,
}

/// Runs one merge cycle over `range`.
///
/// Returns `None` when another merge owns the range or nothing committed
/// lies above the current watermark. On failure the fresh pages are freed
/// and the range keeps its current layout.
pub fn merge_range(range: &PageRange) -> Result<Option<MergeStats>> {
    let Some(_guard) = range.try_begin_merge() else {
        return Ok(None);
    };
    let old = range.layout();
    let bound = range.merge_horizon();
    if bound <= old.watermark {
        return Ok(None);
    }
    let rows = range.records();

    let mut fresh = Vec::with_capacity(old.pages.len());
    let result = build_layout(range, &old, bound, rows, &mut fresh).and_then(|(layout, merged)| {
        let pages_written = layout.pages.len();
        let pages_retired = range.swap_layout(layout, rows)?;
        Ok(MergeStats {
            range: range.id(),
            records_merged: merged,
            pages_written,
            pages_retired,
            pages_reclaimed: 0,
        })
    });
    match result {
        Ok(stats) => {
            debug!(
                range = range.id().0,
                records = stats.records_merged,
                watermark = ?bound,
                "merge.swap"
            );
            Ok(Some(stats))
        }
        Err(err) => {
            for page in fresh {
                range.free_page(page);
            }
            Err(err)
        }
    }
}

fn build_layout(
    range: &PageRange,
    old: &BaseLayout,
    bound: TailPtr,
    rows: usize,
    fresh: &mut Vec<PageNo>,
) -> Result<(BaseLayout, usize)> {
    let per_page = range.slots_per_page();
    let mut watermark_ts = old.watermark_ts;
    let mut merged = 0;
    for idx in 0..old.pages.len() {
        let page = range.allocate_page();
        fresh.push(page);
        let handles = range.new_layout_page(page)?;
        let first = idx * per_page;
        for slot in first..rows.min(first + per_page) {
            let slot = slot as u32;
            let mut row = range.read_base(old, slot)?;
            let entries = committed_entries(range, slot, old.watermark, bound)?;
            if !entries.is_empty() {
                if let Some(newest) = entries.iter().map(|e| e.ts).max() {
                    watermark_ts = watermark_ts.max(newest);
                }
                apply_newest_first(&mut row, &entries);
                merged += 1;
            }
            let offset = slot as usize % per_page;
            let (encoding, columns) = handles
                .split_first()
                .ok_or(LStoreError::Corruption("layout page without columns"))?;
            write_into(encoding, offset, row.encoding as i64)?;
            for (handle, &value) in columns.iter().zip(&row.values) {
                write_into(handle, offset, value)?;
            }
        }
    }
    Ok((
        BaseLayout {
            pages: fresh.clone(),
            watermark: bound,
            watermark_ts,
            generation: old.generation + 1,
        },
        merged,
    ))
}

/// Chain entries of `slot` within `watermark..bound`, newest first.
fn committed_entries(
    range: &PageRange,
    slot: u32,
    watermark: TailPtr,
    bound: TailPtr,
) -> Result<Vec<TailEntry>> {
    let mut entries = Vec::new();
    let mut ptr = range.head(slot)?;
    while !ptr.is_null() && ptr >= watermark {
        if ptr >= bound {
            ptr = range.read_prev(ptr)?;
            continue;
        }
        let entry = range.read_entry(ptr)?;
        ptr = entry.prev;
        entries.push(entry);
    }
    Ok(entries)
}

/// Messages accepted by the merge thread.
pub enum MergeMessage {
    /// Merge one range of the owning table.
    Trigger(RangeId),
    /// Stop the thread.
    Shutdown,
}

/// Background thread merging ranges of one table on request.
pub struct MergeWorker {
    sender: Sender<MergeMessage>,
    thread: Option<thread::JoinHandle<()>>,
}

impl MergeWorker {
    /// Starts the merge thread for `core`.
    pub(crate) fn spawn(core: Weak<TableCore>, name: &str) -> Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let thread = thread::Builder::new()
            .name(format!("lstore-merge-{name}"))
            .spawn(move || Self::merge_loop(core, receiver))?;
        Ok(Self {
            sender,
            thread: Some(thread),
        })
    }

    /// Sending half used by writers to request merges.
    pub(crate) fn sender(&self) -> Sender<MergeMessage> {
        self.sender.clone()
    }

    /// Queues a merge of `range`.
    pub fn trigger(&self, range: RangeId) -> Result<()> {
        self.sender
            .send(MergeMessage::Trigger(range))
            .map_err(|_| LStoreError::Corruption("merge channel closed"))
    }

    /// Stops the thread and waits for the merge in progress to finish.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.sender.send(MergeMessage::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("merge.thread_panicked");
            }
        }
    }

    fn merge_loop(core: Weak<TableCore>, receiver: Receiver<MergeMessage>) {
        while let Ok(message) = receiver.recv() {
            match message {
                MergeMessage::Trigger(range) => {
                    let Some(core) = core.upgrade() else {
                        break;
                    };
                    match core.merge_one(range) {
                        Ok(Some(stats)) => info!(
                            table = core.name(),
                            range = range.0,
                            records = stats.records_merged,
                            reclaimed = stats.pages_reclaimed,
                            "merge.completed"
                        ),
                        Ok(None) => {}
                        Err(err) => warn!(
                            table = core.name(),
                            range = range.0,
                            error = %err,
                            "merge.failed"
                        ),
                    }
                }
                MergeMessage::Shutdown => break,
            }
        }
    }
}

impl Drop for MergeWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
