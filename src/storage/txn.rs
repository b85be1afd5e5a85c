//! Per-transaction lock set and undo log.
//!
//! Every write records how to reverse itself. Commit stamps the written
//! versions with one commit timestamp and releases the locks; abort replays
//! the undo log newest first, which restores chain heads and index entries
//! exactly, and then releases the locks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::primitives::concurrency::{LockGuard, LockMode};
use crate::types::{LStoreError, Result, Rid, TableId, Timestamp};

use super::directory::RecordLocation;
use super::mvcc::Clock;
use super::record::TailPtr;
use super::table::TableCore;

/// Index mutation made by a write.
///
/// Postings for the old value stay in place until commit, so a concurrent
/// lookup still finds the record and waits on its lock.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum IndexChange {
    /// The primary key moved from `from` to `to`.
    Rekeyed { from: i64, to: i64 },
    /// The record was deleted while holding `key`.
    Deleted { key: i64 },
    /// A secondary column changed from `from`; `to` is `None` for deletes.
    Secondary {
        column: usize,
        from: i64,
        to: Option<i64>,
    },
}

/// Reversal record for one write.
pub(crate) enum Undo {
    Inserted {
        table: Arc<TableCore>,
        rid: Rid,
        location: RecordLocation,
        key: i64,
        values: Vec<i64>,
    },
    Appended {
        table: Arc<TableCore>,
        rid: Rid,
        location: RecordLocation,
        prior_head: TailPtr,
        /// Appended entries and whether commit must stamp them.
        entries: SmallVec<[(TailPtr, bool); 2]>,
        index: Vec<IndexChange>,
    },
}

impl Undo {
    fn stamp(&self, ts: Timestamp) -> Result<()> {
        match self {
            Undo::Inserted {
                table, location, ..
            } => table.range(location.range)?.stamp_insert(location.slot, ts),
            Undo::Appended {
                table,
                rid,
                location,
                entries,
                index,
                ..
            } => {
                let range = table.range(location.range)?;
                for &(ptr, stamp) in entries {
                    if stamp {
                        range.stamp_entry(ptr, ts)?;
                    }
                }
                table.settle_commit(*rid, *location, index, ts)
            }
        }
    }

    fn finish(&self) -> Result<()> {
        if let Undo::Appended {
            table,
            location,
            entries,
            ..
        } = self
        {
            let ptrs: SmallVec<[TailPtr; 2]> = entries.iter().map(|(ptr, _)| *ptr).collect();
            table.range(location.range)?.finish(&ptrs);
        }
        Ok(())
    }

    fn rollback(self) -> Result<()> {
        match self {
            Undo::Inserted {
                table,
                rid,
                key,
                values,
                ..
            } => {
                table.unindex_insert(rid, key, &values);
                Ok(())
            }
            Undo::Appended {
                table,
                rid,
                location,
                prior_head,
                entries,
                index,
            } => {
                let range = table.range(location.range)?;
                let restored = range
                    .set_head(location.slot, prior_head)
                    .and_then(|()| table.settle_abort(rid, location, &index));
                let ptrs: SmallVec<[TailPtr; 2]> = entries.iter().map(|(ptr, _)| *ptr).collect();
                range.finish(&ptrs);
                restored
            }
        }
    }
}

/// Locks and undo log of one transaction.
pub(crate) struct TxnState {
    timeout: Duration,
    locks: HashMap<(TableId, Rid), LockGuard>,
    undo: Vec<Undo>,
}

impl TxnState {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            locks: HashMap::new(),
            undo: Vec::new(),
        }
    }

    /// Takes, or strengthens, the lock on `rid` of `table`.
    ///
    /// A shared lock already held is upgraded for writes. The shared lock
    /// stays held if the upgrade times out.
    pub fn lock(&mut self, table: &TableCore, rid: Rid, mode: LockMode) -> Result<()> {
        let timeout = self.timeout;
        match self.locks.get_mut(&(table.id(), rid)) {
            Some(guard) => {
                if mode == LockMode::Exclusive && guard.mode() == LockMode::Shared {
                    guard.upgrade(timeout)?;
                }
                Ok(())
            }
            None => {
                let guard = table.locks().acquire(rid, mode, timeout)?;
                self.locks.insert((table.id(), rid), guard);
                Ok(())
            }
        }
    }

    pub fn push(&mut self, undo: Undo) {
        self.undo.push(undo);
    }

    /// Number of writes recorded.
    pub fn writes(&self) -> usize {
        self.undo.len()
    }

    /// Number of record locks held.
    pub fn locks_held(&self) -> usize {
        self.locks.len()
    }

    /// Stamps every write with one commit timestamp and releases the locks.
    ///
    /// Returns `None` for a read-only transaction. When stamping fails the
    /// writes are rolled back under the same commit gate, so no reader sees
    /// a partial commit, and the error is returned with the locks released.
    pub fn commit(&mut self, clock: &Clock) -> Result<Option<Timestamp>> {
        if self.undo.is_empty() {
            self.locks.clear();
            return Ok(None);
        }
        let undo = &mut self.undo;
        let stamped = clock.commit(|ts| match undo.iter().try_for_each(|entry| entry.stamp(ts)) {
            Ok(()) => Ok(ts),
            Err(err) => {
                warn!(ts, error = %err, "txn.stamp_failed");
                if let Err(undone) = rollback_all(std::mem::take(&mut *undo)) {
                    warn!(error = %undone, "txn.rollback_failed");
                }
                Err(err)
            }
        });
        let undo = std::mem::take(&mut self.undo);
        for entry in &undo {
            if let Err(err) = entry.finish() {
                warn!(error = %err, "txn.finish_failed");
            }
        }
        self.locks.clear();
        let ts = stamped?;
        debug!(ts, writes = undo.len(), "txn.commit");
        Ok(Some(ts))
    }

    /// Reverses every write, newest first, and releases the locks.
    pub fn abort(&mut self) -> Result<()> {
        let undo = std::mem::take(&mut self.undo);
        let writes = undo.len();
        let undone = rollback_all(undo);
        self.locks.clear();
        debug!(writes, "txn.abort");
        undone
    }
}

/// Rolls back `undo` newest first, reporting the first failure.
fn rollback_all(undo: Vec<Undo>) -> Result<()> {
    let mut first_error: Option<LStoreError> = None;
    for entry in undo.into_iter().rev() {
        if let Err(err) = entry.rollback() {
            first_error.get_or_insert(err);
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

impl Drop for TxnState {
    fn drop(&mut self) {
        if !self.undo.is_empty() {
            if let Err(err) = self.abort() {
                warn!(error = %err, "txn.abort_on_drop_failed");
            }
        }
    }
}
