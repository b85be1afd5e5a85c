//! Tables: schema, page ranges, indexes and the record operations over them.
//!
//! [`TableCore`] holds the shared state and implements every operation
//! against a caller-supplied transaction context. [`Table`] is the public
//! handle: each of its operations runs as a single-operation transaction,
//! and it owns the background merge thread.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use tracing::{debug, info, warn};

use crate::primitives::cache::Cache;
use crate::primitives::concurrency::{LockManager, LockMode};
use crate::types::{LStoreError, RangeId, Result, Rid, TableId, Timestamp};

use super::catalog::TableCatalog;
use super::directory::{PageDirectory, RecordLocation};
use super::index::{Graveyard, PrimaryIndex, RetiredKind, SecondaryIndexes};
use super::merge::{merge_range, MergeMessage, MergeStats, MergeWorker};
use super::metrics::StorageMetrics;
use super::mvcc::{Clock, ReaderRegistry, Snapshot, PENDING_TS};
use super::options::EngineOptions;
use super::range::{PageRange, RangeShape};
use super::record::{flags, Record, Schema, TailEntry, TailPtr, Version};
use super::txn::{IndexChange, TxnState, Undo};

const LOOKUP_ATTEMPTS: usize = 4;

/// Database-wide services every table uses.
#[derive(Clone)]
pub(crate) struct TableEnv {
    pub cache: Arc<Cache>,
    pub clock: Arc<Clock>,
    pub readers: Arc<ReaderRegistry>,
    pub options: EngineOptions,
    pub metrics: Arc<dyn StorageMetrics>,
}

/// Shared state of one table.
pub(crate) struct TableCore {
    id: TableId,
    name: String,
    dir: PathBuf,
    schema: Schema,
    shape: RangeShape,
    env: TableEnv,
    ranges: RwLock<Vec<Arc<PageRange>>>,
    next_rid: AtomicU64,
    directory: PageDirectory,
    primary: PrimaryIndex,
    secondary: SecondaryIndexes,
    graveyard: Graveyard,
    locks: LockManager,
    merge_tx: Mutex<Option<Sender<MergeMessage>>>,
}

impl TableCore {
    pub fn create(id: TableId, name: &str, dir: PathBuf, schema: Schema, env: TableEnv) -> Self {
        let shape = RangeShape::new(
            id,
            schema.num_columns,
            env.options.records_per_range,
            env.options.page_size,
        );
        Self::assemble(id, name, dir, schema, shape, env, Vec::new(), 0, Graveyard::new())
    }

    pub fn restore(catalog: TableCatalog, dir: PathBuf, env: TableEnv) -> Result<Self> {
        if catalog.page_size != env.options.page_size {
            return Err(LStoreError::Invalid(
                "page size differs from the one the table was written with",
            ));
        }
        let shape = RangeShape::new(
            catalog.id,
            catalog.schema.num_columns,
            catalog.records_per_range,
            catalog.page_size,
        );
        let ranges = catalog
            .ranges
            .into_iter()
            .map(|meta| PageRange::restore(meta, shape, env.cache.clone()).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        let core = Self::assemble(
            catalog.id,
            &catalog.name,
            dir,
            catalog.schema,
            shape,
            env,
            ranges,
            catalog.next_rid,
            Graveyard::restore(catalog.graveyard, catalog.graveyard_floor),
        );
        for (rid, location) in catalog.directory {
            core.directory.insert(rid, location);
        }
        for (key, rid) in catalog.primary {
            core.primary.insert_unique(key, rid)?;
        }
        for column in catalog.secondary_columns {
            core.create_index(column)?;
        }
        Ok(core)
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        id: TableId,
        name: &str,
        dir: PathBuf,
        schema: Schema,
        shape: RangeShape,
        env: TableEnv,
        ranges: Vec<Arc<PageRange>>,
        next_rid: u64,
        graveyard: Graveyard,
    ) -> Self {
        Self {
            id,
            name: name.to_owned(),
            dir,
            schema,
            shape,
            env,
            ranges: RwLock::new(ranges),
            next_rid: AtomicU64::new(next_rid),
            directory: PageDirectory::new(),
            primary: PrimaryIndex::new(),
            secondary: SecondaryIndexes::new(),
            graveyard,
            locks: LockManager::new(),
            merge_tx: Mutex::new(None),
        }
    }

    /// Snapshot of the table for its catalog file.
    ///
    /// Pages and keys that registered snapshots may still read are kept in
    /// memory; the saved image drops them.
    pub fn catalog(&self) -> TableCatalog {
        let horizon = self.env.readers.horizon(&self.env.clock);
        let (graveyard, graveyard_floor) = self.graveyard.entries();
        TableCatalog {
            format: TableCatalog::FORMAT,
            id: self.id,
            name: self.name.clone(),
            schema: self.schema,
            page_size: self.env.options.page_size,
            records_per_range: self.shape.capacity,
            next_rid: self.next_rid.load(Ordering::Acquire),
            clock: self.env.clock.now(),
            ranges: self.ranges().iter().map(|range| range.meta(horizon)).collect(),
            directory: self.directory.entries(),
            primary: self.primary.entries(),
            secondary_columns: self.secondary.columns(),
            graveyard,
            graveyard_floor,
        }
    }

    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn env(&self) -> &TableEnv {
        &self.env
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn lock_timeout(&self) -> Duration {
        self.env.options.lock_timeout()
    }

    pub fn ranges(&self) -> Vec<Arc<PageRange>> {
        self.ranges.read().clone()
    }

    pub fn range(&self, id: RangeId) -> Result<Arc<PageRange>> {
        self.ranges
            .read()
            .get(id.0 as usize)
            .cloned()
            .ok_or(LStoreError::Corruption("record points at a missing page range"))
    }

    /// Live records, counting keys held by uncommitted deletes.
    pub fn len(&self) -> usize {
        self.primary.len()
    }

    pub fn attach_merger(&self, sender: Sender<MergeMessage>) {
        *self.merge_tx.lock() = Some(sender);
    }

    pub fn detach_merger(&self) {
        self.merge_tx.lock().take();
    }

    fn request_merge(&self, range: &PageRange, pending: usize) {
        let cfg = &self.env.options.merge;
        if !cfg.enabled || pending < cfg.tail_threshold {
            return;
        }
        let sender = self.merge_tx.lock();
        let Some(sender) = sender.as_ref() else {
            return;
        };
        if range.request_merge() && sender.send(MergeMessage::Trigger(range.id())).is_err() {
            debug!(table = %self.name, range = range.id().0, "merge.trigger_dropped");
        }
    }

    fn key_of(&self, version: &Version) -> i64 {
        version.values[self.schema.key_column]
    }

    fn latest(&self, location: RecordLocation) -> Result<Version> {
        self.range(location.range)?.read_latest(location.slot)
    }

    // ------------------------------------------------------------ writes

    fn place(&self, rid: Rid, values: &[i64]) -> Result<RecordLocation> {
        loop {
            let open = self.ranges.read().last().cloned();
            if let Some(range) = open {
                if let Some(slot) = range.allocate_slot(rid, values, PENDING_TS)? {
                    return Ok(RecordLocation {
                        range: range.id(),
                        slot,
                    });
                }
            }
            let mut ranges = self.ranges.write();
            if ranges.last().map_or(true, |range| range.is_full()) {
                let id = u32::try_from(ranges.len())
                    .map(RangeId)
                    .map_err(|_| LStoreError::CapacityExceeded("page ranges"))?;
                ranges.push(Arc::new(PageRange::create(
                    id,
                    self.shape,
                    self.env.cache.clone(),
                )));
                debug!(table = %self.name, range = id.0, "table.range_open");
            }
        }
    }

    /// Inserts a new record and returns its RID.
    pub fn insert(self: &Arc<Self>, txn: &mut TxnState, values: &[i64]) -> Result<Rid> {
        self.schema.check_row(values)?;
        let key = values[self.schema.key_column];
        let rid = Rid(self.next_rid.fetch_add(1, Ordering::AcqRel));
        txn.lock(self, rid, LockMode::Exclusive)?;
        self.primary.insert_unique(key, rid)?;
        let location = match self.place(rid, values) {
            Ok(location) => location,
            Err(err) => {
                self.primary.remove_if(key, rid);
                return Err(err);
            }
        };
        self.directory.insert(rid, location);
        for column in self.secondary.columns() {
            self.secondary.add(column, values[column], rid);
        }
        txn.push(Undo::Inserted {
            table: self.clone(),
            rid,
            location,
            key,
            values: values.to_vec(),
        });
        self.env.metrics.record_inserted();
        Ok(rid)
    }

    /// Updates the columns given as `Some`; a changed key must be unused.
    pub fn update(self: &Arc<Self>, txn: &mut TxnState, key: i64, values: &[Option<i64>]) -> Result<()> {
        self.schema.check_partial(values)?;
        let (rid, location, current) = self.lock_key(txn, key, LockMode::Exclusive)?;
        let mut next = current.values.clone();
        let mut encoding = 0u64;
        for (column, value) in values.iter().enumerate() {
            if let Some(value) = *value {
                next[column] = value;
                encoding |= 1 << column;
            }
        }

        let mut changes = Vec::new();
        let new_key = next[self.schema.key_column];
        if new_key != key {
            match self.primary.get(new_key) {
                Some(owner) if owner != rid => return Err(LStoreError::DuplicateKey(new_key)),
                Some(_) => {}
                None => self.primary.insert_unique(new_key, rid)?,
            }
            self.graveyard.retire(key, rid, RetiredKind::Rekeyed);
            changes.push(IndexChange::Rekeyed {
                from: key,
                to: new_key,
            });
        }
        for column in self.secondary.columns() {
            if current.values[column] != next[column] {
                self.secondary.add(column, next[column], rid);
                changes.push(IndexChange::Secondary {
                    column,
                    from: current.values[column],
                    to: Some(next[column]),
                });
            }
        }
        self.append_version(txn, rid, location, &current, encoding, next, changes)?;
        self.env.metrics.record_updated();
        Ok(())
    }

    /// Appends a tombstone for the record holding `key`.
    pub fn delete(self: &Arc<Self>, txn: &mut TxnState, key: i64) -> Result<()> {
        let (rid, location, current) = self.lock_key(txn, key, LockMode::Exclusive)?;
        self.graveyard.retire(key, rid, RetiredKind::Deleted);
        let mut changes = vec![IndexChange::Deleted { key }];
        for column in self.secondary.columns() {
            changes.push(IndexChange::Secondary {
                column,
                from: current.values[column],
                to: None,
            });
        }
        let values = current.values.clone();
        self.append_version(txn, rid, location, &current, flags::TOMBSTONE, values, changes)?;
        self.env.metrics.record_deleted();
        Ok(())
    }

    /// Adds one to `column` of the record holding `key`.
    pub fn increment(self: &Arc<Self>, txn: &mut TxnState, key: i64, column: usize) -> Result<()> {
        self.schema.check_column(column)?;
        let (_, _, current) = self.lock_key(txn, key, LockMode::Exclusive)?;
        let mut values = vec![None; self.schema.num_columns];
        values[column] = Some(current.values[column].wrapping_add(1));
        self.update(txn, key, &values)
    }

    #[allow(clippy::too_many_arguments)]
    fn append_version(
        self: &Arc<Self>,
        txn: &mut TxnState,
        rid: Rid,
        location: RecordLocation,
        current: &Version,
        encoding: u64,
        values: Vec<i64>,
        changes: Vec<IndexChange>,
    ) -> Result<()> {
        let range = self.range(location.range)?;
        let prior_head = range.head(location.slot)?;
        match self.append_chain(&range, rid, location.slot, prior_head, current, encoding, values) {
            Ok((entries, pending)) => {
                txn.push(Undo::Appended {
                    table: self.clone(),
                    rid,
                    location,
                    prior_head,
                    entries,
                    index: changes,
                });
                self.request_merge(&range, pending);
                Ok(())
            }
            Err(err) => {
                if let Err(revert) = self.settle_abort(rid, location, &changes) {
                    warn!(table = %self.name, rid = rid.0, error = %revert, "table.revert_failed");
                }
                Err(err)
            }
        }
    }

    /// Appends the new version, preceded by a snapshot of the base row on
    /// the first update, and repoints the record at it.
    #[allow(clippy::too_many_arguments)]
    fn append_chain(
        &self,
        range: &PageRange,
        rid: Rid,
        slot: u32,
        prior_head: TailPtr,
        current: &Version,
        encoding: u64,
        values: Vec<i64>,
    ) -> Result<(SmallVec<[(TailPtr, bool); 2]>, usize)> {
        let mut entries: SmallVec<[(TailPtr, bool); 2]> = SmallVec::new();
        let mut prev = prior_head;
        if prior_head.is_null() {
            let insert_ts = range.insert_ts(slot)?;
            let (ptr, _) = range.append_tail(&TailEntry {
                rid,
                prev: TailPtr::NULL,
                encoding: flags::SNAPSHOT,
                ts: insert_ts,
                values: current.values.clone(),
            })?;
            entries.push((ptr, insert_ts == PENDING_TS));
            prev = ptr;
        }
        let appended = range.append_tail(&TailEntry {
            rid,
            prev,
            encoding,
            ts: PENDING_TS,
            values,
        });
        let (ptr, pending) = match appended {
            Ok(appended) => appended,
            Err(err) => {
                let ptrs: SmallVec<[TailPtr; 2]> = entries.iter().map(|(ptr, _)| *ptr).collect();
                range.finish(&ptrs);
                return Err(err);
            }
        };
        entries.push((ptr, true));
        if let Err(err) = range.set_head(slot, ptr) {
            let ptrs: SmallVec<[TailPtr; 2]> = entries.iter().map(|(ptr, _)| *ptr).collect();
            range.finish(&ptrs);
            return Err(err);
        }
        Ok((entries, pending))
    }

    /// Drops the index entries of an insert undone by an abort.
    pub fn unindex_insert(&self, rid: Rid, key: i64, values: &[i64]) {
        self.primary.remove_if(key, rid);
        for column in self.secondary.columns() {
            if let Some(&value) = values.get(column) {
                self.secondary.remove(column, value, rid);
            }
        }
        self.directory.remove(rid);
    }

    /// Applies the deferred half of index changes once their writer commits:
    /// postings for values the record no longer holds are removed and
    /// retired keys are stamped.
    pub fn settle_commit(
        &self,
        rid: Rid,
        location: RecordLocation,
        changes: &[IndexChange],
        ts: Timestamp,
    ) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let current = self.latest(location)?;
        let live = !current.is_tombstone();
        for change in changes {
            match *change {
                IndexChange::Rekeyed { from, .. } | IndexChange::Deleted { key: from } => {
                    self.graveyard.stamp(from, rid, ts);
                    if !live || self.key_of(&current) != from {
                        self.primary.remove_if(from, rid);
                    }
                }
                IndexChange::Secondary { column, from, .. } => {
                    if !live || current.values[column] != from {
                        self.secondary.remove(column, from, rid);
                    }
                }
            }
        }
        Ok(())
    }

    /// Reverts index changes after the chain head was restored.
    pub fn settle_abort(&self, rid: Rid, location: RecordLocation, changes: &[IndexChange]) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let current = self.latest(location)?;
        for change in changes.iter().rev() {
            match *change {
                IndexChange::Rekeyed { from, to } => {
                    if self.key_of(&current) != to {
                        self.primary.remove_if(to, rid);
                    }
                    self.restore_key(from, rid)?;
                }
                IndexChange::Deleted { key } => self.restore_key(key, rid)?,
                IndexChange::Secondary { column, from, to } => {
                    if let Some(to) = to {
                        if current.values[column] != to {
                            self.secondary.remove(column, to, rid);
                        }
                    }
                    self.secondary.add(column, from, rid);
                }
            }
        }
        Ok(())
    }

    /// Gives `key` back to `rid` after an abort, including when a failed
    /// commit already released it.
    fn restore_key(&self, key: i64, rid: Rid) -> Result<()> {
        self.graveyard.unretire(key, rid);
        match self.primary.get(key) {
            Some(_) => Ok(()),
            None => self.primary.insert_unique(key, rid),
        }
    }

    // ------------------------------------------------------------- reads

    /// Locks the record holding `key` and returns its newest version.
    ///
    /// The key is looked up again after the lock is granted; a record that
    /// lost the key meanwhile is not returned.
    fn lock_key(
        &self,
        txn: &mut TxnState,
        key: i64,
        mode: LockMode,
    ) -> Result<(Rid, RecordLocation, Version)> {
        for _ in 0..LOOKUP_ATTEMPTS {
            let rid = self.primary.get(key).ok_or(LStoreError::NotFound)?;
            txn.lock(self, rid, mode)?;
            if self.primary.get(key) != Some(rid) {
                continue;
            }
            let location = self.directory.get(rid).ok_or(LStoreError::NotFound)?;
            let version = self.latest(location)?;
            if version.is_tombstone() || self.key_of(&version) != key {
                return Err(LStoreError::NotFound);
            }
            return Ok((rid, location, version));
        }
        Err(LStoreError::NotFound)
    }

    /// Records whose `column` equals `value`, newest versions.
    ///
    /// Fails with [`LStoreError::NotFound`] when nothing matches.
    pub fn select(
        &self,
        txn: &mut TxnState,
        value: i64,
        column: usize,
        projection: &[bool],
    ) -> Result<Vec<Record>> {
        self.schema.check_column(column)?;
        self.schema.check_projection(projection)?;
        if column == self.schema.key_column {
            let (rid, _, version) = self.lock_key(txn, value, LockMode::Shared)?;
            return Ok(vec![Record::project(rid, value, &version.values, projection)]);
        }
        // Every candidate is locked before its value is read, in RID order.
        let mut candidates = match self.secondary.lookup(column, value) {
            Some(rids) => rids,
            None => self.directory.entries().into_iter().map(|(rid, _)| rid).collect(),
        };
        candidates.sort_unstable();
        candidates.dedup();
        let mut records = Vec::new();
        for rid in candidates {
            txn.lock(self, rid, LockMode::Shared)?;
            let Some(location) = self.directory.get(rid) else {
                continue;
            };
            let version = self.latest(location)?;
            if !version.is_tombstone() && version.values[column] == value {
                records.push(Record::project(rid, self.key_of(&version), &version.values, projection));
            }
        }
        if records.is_empty() {
            return Err(LStoreError::NotFound);
        }
        Ok(records)
    }

    fn version_as_of(&self, rid: Rid, ts: Timestamp) -> Result<Option<Version>> {
        let Some(location) = self.directory.get(rid) else {
            return Ok(None);
        };
        let version = self.range(location.range)?.read_as_of(location.slot, ts)?;
        Ok(version.filter(|version| !version.is_tombstone()))
    }

    /// Records whose `column` equaled `value` at time `ts`.
    ///
    /// `ts` is clamped to the newest fully committed time.
    pub fn select_as_of(
        &self,
        value: i64,
        column: usize,
        projection: &[bool],
        ts: Timestamp,
    ) -> Result<Vec<Record>> {
        self.schema.check_column(column)?;
        self.schema.check_projection(projection)?;
        let ts = ts.min(self.env.clock.stable_now());
        let candidates: BTreeSet<Rid> = if column == self.schema.key_column {
            let mut rids: BTreeSet<Rid> = self.graveyard.candidates(value, ts)?.into_iter().collect();
            rids.extend(self.primary.get(value));
            rids
        } else {
            self.graveyard.ensure_readable(ts)?;
            self.directory.entries().into_iter().map(|(rid, _)| rid).collect()
        };
        let mut records = Vec::new();
        for rid in candidates {
            if let Some(version) = self.version_as_of(rid, ts)? {
                if version.values[column] == value {
                    records.push(Record::project(rid, self.key_of(&version), &version.values, projection));
                }
            }
        }
        if records.is_empty() {
            return Err(LStoreError::NotFound);
        }
        Ok(records)
    }

    /// Sum of `column` over live records with keys in the inclusive range
    /// between `start` and `end`, given in either order.
    pub fn sum(&self, txn: &mut TxnState, start: i64, end: i64, column: usize) -> Result<i64> {
        self.schema.check_column(column)?;
        let (lo, hi) = (start.min(end), start.max(end));
        let mut keys = self.primary.keys_in_range(lo, hi);
        keys.sort_unstable_by_key(|&(_, rid)| rid);
        let mut total = 0i64;
        for (key, rid) in keys {
            txn.lock(self, rid, LockMode::Shared)?;
            let Some(location) = self.directory.get(rid) else {
                continue;
            };
            let version = self.latest(location)?;
            if !version.is_tombstone() && self.key_of(&version) == key {
                total = total.wrapping_add(version.values[column]);
            }
        }
        Ok(total)
    }

    /// Sum of `column` over the records that held keys in the range at `ts`.
    pub fn sum_as_of(&self, start: i64, end: i64, column: usize, ts: Timestamp) -> Result<i64> {
        self.schema.check_column(column)?;
        let (lo, hi) = (start.min(end), start.max(end));
        let ts = ts.min(self.env.clock.stable_now());
        let mut pairs: BTreeSet<(i64, Rid)> = self
            .graveyard
            .candidates_in_range(lo, hi, ts)?
            .into_iter()
            .collect();
        pairs.extend(self.primary.keys_in_range(lo, hi));
        let mut total = 0i64;
        for (key, rid) in pairs {
            if let Some(version) = self.version_as_of(rid, ts)? {
                if self.key_of(&version) == key {
                    total = total.wrapping_add(version.values[column]);
                }
            }
        }
        Ok(total)
    }

    /// RID currently indexed under `key`.
    pub fn resolve_key(&self, key: i64) -> Option<Rid> {
        self.primary.get(key)
    }

    /// RIDs indexed under keys between `start` and `end` inclusive.
    pub fn resolve_range(&self, start: i64, end: i64) -> Vec<Rid> {
        self.primary
            .keys_in_range(start.min(end), start.max(end))
            .into_iter()
            .map(|(_, rid)| rid)
            .collect()
    }

    /// RIDs a secondary index lists under `value`; empty when `column` is
    /// not indexed.
    pub fn resolve_value(&self, column: usize, value: i64) -> Vec<Rid> {
        if column == self.schema.key_column {
            return self.resolve_key(value).into_iter().collect();
        }
        self.secondary.lookup(column, value).unwrap_or_default()
    }

    /// Tail entries newer than the merged base of the record holding `key`.
    pub fn chain_len(&self, key: i64) -> Result<usize> {
        let rid = self.primary.get(key).ok_or(LStoreError::NotFound)?;
        let location = self.directory.get(rid).ok_or(LStoreError::NotFound)?;
        self.range(location.range)?.chain_len(location.slot)
    }

    // ----------------------------------------------------------- indexes

    /// Builds a secondary index on `column`. Returns false when one exists.
    pub fn create_index(&self, column: usize) -> Result<bool> {
        self.schema.check_column(column)?;
        if !self.secondary.create(column, std::iter::empty()) {
            return Ok(false);
        }
        for (rid, location) in self.directory.entries() {
            let version = self.latest(location)?;
            if !version.is_tombstone() {
                self.secondary.add(column, version.values[column], rid);
            }
        }
        debug!(table = %self.name, column, "index.create");
        Ok(true)
    }

    /// Drops the secondary index on `column`. Returns false when none exists.
    pub fn drop_index(&self, column: usize) -> Result<bool> {
        self.schema.check_column(column)?;
        Ok(self.secondary.drop_column(column))
    }

    // ------------------------------------------------------------- merge

    /// Merges one range and reclaims what readers no longer need.
    pub fn merge_one(&self, id: RangeId) -> Result<Option<MergeStats>> {
        let range = self.range(id)?;
        let stats = match merge_range(&range) {
            Ok(stats) => stats,
            Err(err) => {
                self.env.metrics.merge_failed();
                return Err(err);
            }
        };
        let Some(mut stats) = stats else {
            return Ok(None);
        };
        stats.pages_reclaimed = self.reclaim();
        self.env
            .metrics
            .merge_completed(stats.records_merged as u64, stats.pages_reclaimed as u64);
        if self.env.options.merge.flush_after_merge {
            self.env.cache.flush_table(self.id)?;
        }
        Ok(Some(stats))
    }

    /// Merges every range with pending tail entries.
    pub fn merge_all(&self) -> Result<Vec<MergeStats>> {
        let mut all = Vec::new();
        for range in self.ranges() {
            if range.pending_entries() == 0 {
                continue;
            }
            if let Some(stats) = self.merge_one(range.id())? {
                all.push(stats);
            }
        }
        Ok(all)
    }

    /// Frees retired pages and retired keys older than every registered
    /// snapshot. Returns the number of pages freed.
    pub fn reclaim(&self) -> usize {
        let horizon = self.env.readers.horizon(&self.env.clock);
        let pages = self.ranges().iter().map(|range| range.reclaim(horizon)).sum();
        for (_, retired) in self.graveyard.purge(horizon) {
            if retired.kind == RetiredKind::Deleted {
                self.directory.remove(retired.rid);
            }
        }
        pages
    }
}

/// Handle to an open table.
///
/// Every operation runs as its own transaction: it takes the record locks
/// it needs, commits on success and rolls back on failure.
pub struct Table {
    core: Arc<TableCore>,
    merger: Mutex<Option<MergeWorker>>,
}

impl Table {
    pub(crate) fn open(core: Arc<TableCore>) -> Result<Self> {
        let merger = if core.env().options.merge.enabled {
            let worker = MergeWorker::spawn(Arc::downgrade(&core), core.name())?;
            core.attach_merger(worker.sender());
            Some(worker)
        } else {
            None
        };
        Ok(Self {
            core,
            merger: Mutex::new(merger),
        })
    }

    pub(crate) fn core(&self) -> &Arc<TableCore> {
        &self.core
    }

    /// Table name.
    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// Table id.
    pub fn id(&self) -> TableId {
        self.core.id()
    }

    /// Column layout.
    pub fn schema(&self) -> Schema {
        *self.core.schema()
    }

    /// Number of keys currently indexed.
    pub fn len(&self) -> usize {
        self.core.len()
    }

    /// True when the table holds no record.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn autocommit<T>(&self, op: impl FnOnce(&mut TxnState) -> Result<T>) -> Result<T> {
        let mut txn = TxnState::new(self.core.lock_timeout());
        match op(&mut txn) {
            Ok(value) => {
                txn.commit(&self.core.env().clock)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(abort) = txn.abort() {
                    warn!(table = %self.name(), error = %abort, "txn.abort_failed");
                }
                Err(err)
            }
        }
    }

    /// Inserts a full row and returns its RID.
    pub fn insert(&self, values: &[i64]) -> Result<Rid> {
        self.autocommit(|txn| self.core.insert(txn, values))
    }

    /// Newest committed records whose `column` equals `value`.
    pub fn select(&self, value: i64, column: usize, projection: &[bool]) -> Result<Vec<Record>> {
        self.autocommit(|txn| self.core.select(txn, value, column, projection))
    }

    /// Records whose `column` equaled `value` at time `ts`.
    pub fn select_as_of(
        &self,
        value: i64,
        column: usize,
        projection: &[bool],
        ts: Timestamp,
    ) -> Result<Vec<Record>> {
        self.core.select_as_of(value, column, projection, ts)
    }

    /// Updates the columns given as `Some` on the record holding `key`.
    pub fn update(&self, key: i64, values: &[Option<i64>]) -> Result<()> {
        self.autocommit(|txn| self.core.update(txn, key, values))
    }

    /// Deletes the record holding `key`.
    pub fn delete(&self, key: i64) -> Result<()> {
        self.autocommit(|txn| self.core.delete(txn, key))
    }

    /// Sums `column` over keys between `start` and `end` inclusive.
    pub fn sum(&self, start: i64, end: i64, column: usize) -> Result<i64> {
        self.autocommit(|txn| self.core.sum(txn, start, end, column))
    }

    /// Sums `column` over the records in the key range as of `ts`.
    pub fn sum_as_of(&self, start: i64, end: i64, column: usize, ts: Timestamp) -> Result<i64> {
        self.core.sum_as_of(start, end, column, ts)
    }

    /// Adds one to `column` of the record holding `key`.
    pub fn increment(&self, key: i64, column: usize) -> Result<()> {
        self.autocommit(|txn| self.core.increment(txn, key, column))
    }

    /// Builds a secondary index on `column`.
    pub fn create_index(&self, column: usize) -> Result<bool> {
        self.core.create_index(column)
    }

    /// Drops the secondary index on `column`.
    pub fn drop_index(&self, column: usize) -> Result<bool> {
        self.core.drop_index(column)
    }

    /// Unmerged tail entries of the record holding `key`.
    pub fn chain_len(&self, key: i64) -> Result<usize> {
        self.core.chain_len(key)
    }

    /// Merges every range with pending updates, synchronously.
    pub fn merge_now(&self) -> Result<Vec<MergeStats>> {
        self.core.merge_all()
    }

    /// Registers a read view at the current time.
    pub fn snapshot(&self) -> Snapshot {
        let env = self.core.env();
        env.readers.register(&env.clock)
    }

    /// Current time of the database clock.
    pub fn now(&self) -> Timestamp {
        self.core.env().clock.stable_now()
    }

    /// Stops the merge thread without merging what is pending.
    pub(crate) fn stop_merger(&self) {
        self.core.detach_merger();
        if let Some(worker) = self.merger.lock().take() {
            worker.shutdown();
        }
    }

    /// Stops the merge thread, merges what is pending, flushes the table's
    /// pages and writes its catalog.
    pub fn close(&self) -> Result<()> {
        self.stop_merger();
        let merged = self.core.merge_all()?;
        let env = self.core.env();
        if env.options.flush_on_close {
            env.cache.flush_table(self.core.id())?;
            env.cache.disk().sync()?;
        }
        self.core.catalog().save(self.core.dir())?;
        info!(
            table = %self.name(),
            merged = merged.len(),
            records = self.len(),
            "table.close"
        );
        Ok(())
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        self.core.detach_merger();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::disk::DiskStore;
    use crate::primitives::io::{FileIo, FileOpener, StdFileIo, StdOpener};
    use crate::storage::metrics::CounterMetrics;
    use crate::storage::options::MergeCfg;
    use std::path::Path;
    use std::sync::atomic::AtomicBool;
    use tempfile::{tempdir, TempDir};

    fn table(options: EngineOptions) -> (TempDir, Table, Arc<CounterMetrics>) {
        table_with(options, Arc::new(StdOpener))
    }

    fn table_with(
        options: EngineOptions,
        opener: Arc<dyn FileOpener>,
    ) -> (TempDir, Table, Arc<CounterMetrics>) {
        let dir = tempdir().unwrap();
        let disk = Arc::new(DiskStore::new(options.page_size, opener));
        disk.register_table(TableId(0), dir.path()).unwrap();
        let metrics = Arc::new(CounterMetrics::default());
        let env = TableEnv {
            cache: Arc::new(Cache::new(options.cache_pages, disk, options.verify_checksums)),
            clock: Arc::new(Clock::new(0)),
            readers: Arc::new(ReaderRegistry::new()),
            options,
            metrics: metrics.clone(),
        };
        let schema = Schema::new(3, 0).unwrap();
        let core = Arc::new(TableCore::create(
            TableId(0),
            "grades",
            dir.path().to_path_buf(),
            schema,
            env,
        ));
        (dir, Table::open(core).unwrap(), metrics)
    }

    fn small() -> EngineOptions {
        EngineOptions::default()
            .page_size(128)
            .records_per_range(20)
            .cache_pages(512)
            .merge(MergeCfg {
                enabled: false,
                ..MergeCfg::default()
            })
    }

    const ALL: [bool; 3] = [true; 3];

    #[test]
    fn insert_update_delete_lifecycle() -> Result<()> {
        let (_dir, table, metrics) = table(small());
        table.insert(&[5, 10, 20])?;
        table.update(5, &[None, None, Some(99)])?;
        let found = table.select(5, 0, &ALL)?;
        assert_eq!(found[0].values(), Some(vec![5, 10, 99]));
        assert_eq!(table.sum(0, 10, 2)?, 99);

        table.delete(5)?;
        assert!(matches!(table.select(5, 0, &ALL), Err(LStoreError::NotFound)));
        assert_eq!(table.sum(10, 0, 2)?, 0);
        assert!(matches!(table.delete(5), Err(LStoreError::NotFound)));
        assert_eq!(metrics.deletes.load(Ordering::Relaxed), 1);
        Ok(())
    }

    #[test]
    fn duplicate_keys_are_rejected_without_side_effects() -> Result<()> {
        let (_dir, table, _) = table(small());
        table.insert(&[1, 0, 0])?;
        table.insert(&[2, 0, 0])?;
        assert!(matches!(table.insert(&[1, 5, 5]), Err(LStoreError::DuplicateKey(1))));
        assert!(matches!(
            table.update(2, &[Some(1), None, None]),
            Err(LStoreError::DuplicateKey(1))
        ));
        assert_eq!(table.len(), 2);
        assert_eq!(table.chain_len(2)?, 0);
        Ok(())
    }

    #[test]
    fn key_change_keeps_old_key_for_snapshots() -> Result<()> {
        let (_dir, table, _) = table(small());
        table.insert(&[1, 7, 7])?;
        let before = table.now();
        table.update(1, &[Some(2), None, None])?;
        assert!(table.select(1, 0, &ALL).is_err());
        assert_eq!(table.select(2, 0, &ALL)?[0].values(), Some(vec![2, 7, 7]));
        let old = table.select_as_of(1, 0, &ALL, before)?;
        assert_eq!(old[0].values(), Some(vec![1, 7, 7]));
        assert!(table.select_as_of(2, 0, &ALL, before).is_err());
        assert_eq!(table.sum_as_of(0, 5, 1, before)?, 7);
        Ok(())
    }

    #[test]
    fn secondary_index_tracks_updates() -> Result<()> {
        let (_dir, table, _) = table(small());
        for key in 0..10 {
            table.insert(&[key, key % 3, 0])?;
        }
        assert!(table.create_index(1)?);
        assert_eq!(table.select(0, 1, &ALL)?.len(), 4);
        table.update(3, &[None, Some(1), None])?;
        table.delete(6)?;
        let keys: Vec<i64> = table.select(0, 1, &ALL)?.iter().map(|r| r.key).collect();
        assert_eq!(keys, vec![0, 9]);
        assert!(table.drop_index(1)?);
        assert_eq!(table.select(1, 1, &ALL)?.len(), 4);
        Ok(())
    }

    #[test]
    fn increment_reads_and_writes_one_column() -> Result<()> {
        let (_dir, table, _) = table(small());
        table.insert(&[4, 1, 1])?;
        for _ in 0..5 {
            table.increment(4, 2)?;
        }
        assert_eq!(table.select(4, 0, &ALL)?[0].values(), Some(vec![4, 1, 6]));
        assert_eq!(table.chain_len(4)?, 6);
        Ok(())
    }

    #[test]
    fn merge_now_empties_chains() -> Result<()> {
        let (_dir, table, metrics) = table(small());
        for key in 0..45 {
            table.insert(&[key, 0, 0])?;
            table.update(key, &[None, Some(key * 2), None])?;
        }
        let stats = table.merge_now()?;
        assert_eq!(stats.len(), 3);
        for key in 0..45 {
            assert_eq!(table.chain_len(key)?, 0);
            assert_eq!(table.select(key, 0, &ALL)?[0].values(), Some(vec![key, key * 2, 0]));
        }
        assert_eq!(metrics.merges.load(Ordering::Relaxed), 3);
        Ok(())
    }

    #[test]
    fn schema_violations_fail_fast() {
        let (_dir, table, _) = table(small());
        assert!(matches!(table.insert(&[1, 2]), Err(LStoreError::SchemaViolation(_))));
        assert!(matches!(table.update(1, &[None]), Err(LStoreError::SchemaViolation(_))));
        assert!(matches!(table.sum(0, 1, 3), Err(LStoreError::SchemaViolation(_))));
        assert!(table.is_empty());
    }

    /// Fails the first read of a range 1 file after being armed.
    struct FlakyOpener {
        armed: Arc<AtomicBool>,
    }

    struct FlakyFile {
        file: StdFileIo,
        armed: Option<Arc<AtomicBool>>,
    }

    impl FileOpener for FlakyOpener {
        fn open(&self, path: &Path) -> Result<Arc<dyn FileIo>> {
            let second_range = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.contains("_r1."));
            Ok(Arc::new(FlakyFile {
                file: StdFileIo::open(path)?,
                armed: second_range.then(|| self.armed.clone()),
            }))
        }
    }

    impl FileIo for FlakyFile {
        fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
            if let Some(armed) = &self.armed {
                if armed.swap(false, Ordering::AcqRel) {
                    return Err(LStoreError::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "injected read failure",
                    )));
                }
            }
            self.file.read_at(off, dst)
        }

        fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
            self.file.write_at(off, src)
        }

        fn sync_all(&self) -> Result<()> {
            self.file.sync_all()
        }

        fn len(&self) -> Result<u64> {
            self.file.len()
        }
    }

    #[test]
    fn failed_commit_rolls_back_stamped_writes() -> Result<()> {
        let armed = Arc::new(AtomicBool::new(false));
        let opener = FlakyOpener {
            armed: armed.clone(),
        };
        let (_dir, table, _metrics) = table_with(small(), Arc::new(opener));
        for key in 0..40 {
            table.insert(&[key, key, 0])?;
        }
        let core = table.core().clone();
        let mut txn = TxnState::new(core.lock_timeout());
        core.update(&mut txn, 1, &[Some(100), None, Some(7)])?;
        core.update(&mut txn, 30, &[None, None, Some(7)])?;
        core.env().cache.flush_all()?;
        core.env().cache.discard_table(core.id());

        armed.store(true, Ordering::Release);
        assert!(matches!(
            txn.commit(&core.env().clock),
            Err(LStoreError::Io(_))
        ));
        assert!(!armed.load(Ordering::Acquire));
        assert_eq!(txn.writes(), 0);
        assert_eq!(txn.locks_held(), 0);

        assert_eq!(table.select(1, 0, &ALL)?[0].values(), Some(vec![1, 1, 0]));
        assert_eq!(table.select(30, 0, &ALL)?[0].values(), Some(vec![30, 30, 0]));
        assert!(matches!(table.select(100, 0, &ALL), Err(LStoreError::NotFound)));
        assert_eq!(table.sum(0, 39, 2)?, 0);
        assert_eq!(table.chain_len(1)?, 0);

        table.insert(&[100, 0, 0])?;
        table.update(30, &[None, None, Some(1)])?;
        assert_eq!(table.sum(0, 100, 2)?, 1);
        Ok(())
    }
}
