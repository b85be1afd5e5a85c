//! Key indexes.
//!
//! The primary index maps a key to the RID currently holding it. Secondary
//! indexes map a column value to every RID currently holding that value.
//! Both are updated synchronously by the writing transaction and reverted
//! by its undo log. Keys that stop pointing at a record (delete, key
//! change) are kept in the [`Graveyard`] until no snapshot can ask for them.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::types::{LStoreError, Result, Rid, Timestamp};

use super::mvcc::PENDING_TS;

const SHARDS: usize = 16;
const POINT_LOOKUP_LIMIT: i128 = 4096;

fn shard_of(key: i64) -> usize {
    let mixed = (key as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    (mixed >> 60) as usize % SHARDS
}

/// Unique key to RID mapping, sharded by key hash.
pub struct PrimaryIndex {
    shards: Vec<RwLock<FxHashMap<i64, Rid>>>,
}

impl Default for PrimaryIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl PrimaryIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| RwLock::new(FxHashMap::default())).collect(),
        }
    }

    fn shard(&self, key: i64) -> &RwLock<FxHashMap<i64, Rid>> {
        &self.shards[shard_of(key)]
    }

    /// Adds `key`, failing if another record holds it.
    pub fn insert_unique(&self, key: i64, rid: Rid) -> Result<()> {
        let mut shard = self.shard(key).write();
        if shard.contains_key(&key) {
            return Err(LStoreError::DuplicateKey(key));
        }
        shard.insert(key, rid);
        Ok(())
    }

    /// RID currently holding `key`.
    pub fn get(&self, key: i64) -> Option<Rid> {
        self.shard(key).read().get(&key).copied()
    }

    /// Removes `key` if it still points at `rid`.
    pub fn remove_if(&self, key: i64, rid: Rid) -> bool {
        let mut shard = self.shard(key).write();
        if shard.get(&key) == Some(&rid) {
            shard.remove(&key);
            true
        } else {
            false
        }
    }

    /// Number of indexed keys.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    /// True when no key is indexed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Indexed keys within `lo..=hi`, ascending.
    ///
    /// Narrow spans are looked up key by key; wide spans scan every shard.
    pub fn keys_in_range(&self, lo: i64, hi: i64) -> Vec<(i64, Rid)> {
        if lo > hi {
            return Vec::new();
        }
        let span = hi as i128 - lo as i128 + 1;
        if span <= POINT_LOOKUP_LIMIT.max(self.len() as i128) {
            return (lo..=hi)
                .filter_map(|key| self.get(key).map(|rid| (key, rid)))
                .collect();
        }
        let mut keys: Vec<(i64, Rid)> = self
            .shards
            .iter()
            .flat_map(|shard| {
                shard
                    .read()
                    .iter()
                    .filter(|(&key, _)| key >= lo && key <= hi)
                    .map(|(&key, &rid)| (key, rid))
                    .collect::<Vec<_>>()
            })
            .collect();
        keys.sort_unstable_by_key(|(key, _)| *key);
        keys
    }

    /// Every entry, ascending by key.
    pub fn entries(&self) -> Vec<(i64, Rid)> {
        self.keys_in_range(i64::MIN, i64::MAX)
    }
}

type Postings = SmallVec<[Rid; 4]>;

/// Value postings of one indexed column, sharded like [`PrimaryIndex`].
struct ColumnIndex {
    shards: Vec<RwLock<FxHashMap<i64, Postings>>>,
}

impl ColumnIndex {
    fn build(rows: impl IntoIterator<Item = (i64, Rid)>) -> Self {
        let mut shards: Vec<FxHashMap<i64, Postings>> =
            (0..SHARDS).map(|_| FxHashMap::default()).collect();
        for (value, rid) in rows {
            let postings = shards[shard_of(value)].entry(value).or_default();
            if !postings.contains(&rid) {
                postings.push(rid);
            }
        }
        Self {
            shards: shards.into_iter().map(RwLock::new).collect(),
        }
    }

    fn shard(&self, value: i64) -> &RwLock<FxHashMap<i64, Postings>> {
        &self.shards[shard_of(value)]
    }
}

/// Optional per-column value indexes.
///
/// The column map is only write-locked to create or drop an index; postings
/// are locked per value shard.
#[derive(Default)]
pub struct SecondaryIndexes {
    columns: RwLock<FxHashMap<usize, Arc<ColumnIndex>>>,
}

impl SecondaryIndexes {
    /// Creates an empty set of indexes.
    pub fn new() -> Self {
        Self::default()
    }

    fn column(&self, column: usize) -> Option<Arc<ColumnIndex>> {
        self.columns.read().get(&column).cloned()
    }

    /// Builds an index on `column` from `(value, rid)` pairs. Returns false
    /// when the column was already indexed.
    pub fn create(&self, column: usize, rows: impl IntoIterator<Item = (i64, Rid)>) -> bool {
        let mut columns = self.columns.write();
        if columns.contains_key(&column) {
            return false;
        }
        columns.insert(column, Arc::new(ColumnIndex::build(rows)));
        true
    }

    /// Drops the index on `column`. Returns false when there was none.
    pub fn drop_column(&self, column: usize) -> bool {
        self.columns.write().remove(&column).is_some()
    }

    /// True when `column` is indexed.
    pub fn is_indexed(&self, column: usize) -> bool {
        self.columns.read().contains_key(&column)
    }

    /// Indexed columns, ascending.
    pub fn columns(&self) -> Vec<usize> {
        let mut columns: Vec<usize> = self.columns.read().keys().copied().collect();
        columns.sort_unstable();
        columns
    }

    /// Adds `rid` under `value` if `column` is indexed.
    pub fn add(&self, column: usize, value: i64, rid: Rid) {
        if let Some(index) = self.column(column) {
            let mut shard = index.shard(value).write();
            let postings = shard.entry(value).or_default();
            if !postings.contains(&rid) {
                postings.push(rid);
            }
        }
    }

    /// Removes `rid` from under `value` if `column` is indexed.
    pub fn remove(&self, column: usize, value: i64, rid: Rid) {
        if let Some(index) = self.column(column) {
            let mut shard = index.shard(value).write();
            if let Some(postings) = shard.get_mut(&value) {
                postings.retain(|r| *r != rid);
                if postings.is_empty() {
                    shard.remove(&value);
                }
            }
        }
    }

    /// RIDs holding `value` in `column`; `None` when the column is not
    /// indexed.
    pub fn lookup(&self, column: usize, value: i64) -> Option<Vec<Rid>> {
        let index = self.column(column)?;
        let shard = index.shard(value).read();
        let mut rids: Vec<Rid> = shard
            .get(&value)
            .map(|postings| postings.to_vec())
            .unwrap_or_default();
        rids.sort_unstable();
        Some(rids)
    }

}

/// Why a key stopped pointing at a record.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum RetiredKind {
    /// The record was deleted.
    Deleted,
    /// The record moved to a different primary key.
    Rekeyed,
}

/// Former owner of a key, kept for snapshot reads.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RetiredKey {
    /// Record that held the key.
    pub rid: Rid,
    /// Commit time of the change; pending until the writer commits.
    pub ts: Timestamp,
    /// What happened to the record.
    pub kind: RetiredKind,
}

#[derive(Default)]
struct GraveState {
    keys: BTreeMap<i64, Vec<RetiredKey>>,
    floor: Timestamp,
}

/// Keys retired by deletes and key changes.
#[derive(Default)]
pub struct Graveyard {
    state: Mutex<GraveState>,
}

impl Graveyard {
    /// Creates an empty graveyard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a graveyard from catalog entries.
    pub fn restore(entries: Vec<(i64, RetiredKey)>, floor: Timestamp) -> Self {
        let mut keys: BTreeMap<i64, Vec<RetiredKey>> = BTreeMap::new();
        for (key, retired) in entries {
            keys.entry(key).or_default().push(retired);
        }
        Self {
            state: Mutex::new(GraveState { keys, floor }),
        }
    }

    /// Records that `rid` gave up `key`; the change is pending until stamped.
    pub fn retire(&self, key: i64, rid: Rid, kind: RetiredKind) {
        self.state
            .lock()
            .keys
            .entry(key)
            .or_default()
            .push(RetiredKey {
                rid,
                ts: PENDING_TS,
                kind,
            });
    }

    /// Stamps the commit time of a pending retirement.
    pub fn stamp(&self, key: i64, rid: Rid, ts: Timestamp) {
        if let Some(list) = self.state.lock().keys.get_mut(&key) {
            if let Some(entry) = list
                .iter_mut()
                .find(|entry| entry.rid == rid && entry.ts == PENDING_TS)
            {
                entry.ts = ts;
            }
        }
    }

    /// Drops a pending retirement undone by an abort.
    pub fn unretire(&self, key: i64, rid: Rid) {
        let mut state = self.state.lock();
        if let Some(list) = state.keys.get_mut(&key) {
            if let Some(pos) = list
                .iter()
                .rposition(|entry| entry.rid == rid && entry.ts == PENDING_TS)
            {
                list.remove(pos);
            }
            if list.is_empty() {
                state.keys.remove(&key);
            }
        }
    }

    fn check_floor(state: &GraveState, ts: Timestamp) -> Result<()> {
        if ts < state.floor {
            return Err(LStoreError::SnapshotTooOld {
                requested: ts,
                floor: state.floor,
            });
        }
        Ok(())
    }

    /// Fails when retirements a reader at `ts` would need were purged.
    pub fn ensure_readable(&self, ts: Timestamp) -> Result<()> {
        Self::check_floor(&self.state.lock(), ts)
    }

    /// Former owners of `key` a reader at `ts` may still see.
    pub fn candidates(&self, key: i64, ts: Timestamp) -> Result<Vec<Rid>> {
        let state = self.state.lock();
        Self::check_floor(&state, ts)?;
        Ok(state
            .keys
            .get(&key)
            .map(|list| {
                list.iter()
                    .filter(|entry| entry.ts > ts)
                    .map(|entry| entry.rid)
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Former owners of keys within `lo..=hi` a reader at `ts` may still see.
    pub fn candidates_in_range(&self, lo: i64, hi: i64, ts: Timestamp) -> Result<Vec<(i64, Rid)>> {
        let state = self.state.lock();
        Self::check_floor(&state, ts)?;
        if lo > hi {
            return Ok(Vec::new());
        }
        Ok(state
            .keys
            .range(lo..=hi)
            .flat_map(|(&key, list)| {
                list.iter()
                    .filter(move |entry| entry.ts > ts)
                    .map(move |entry| (key, entry.rid))
            })
            .collect())
    }

    /// Removes committed retirements no snapshot at or after `horizon` can
    /// need. Returns the purged entries.
    pub fn purge(&self, horizon: Timestamp) -> Vec<(i64, RetiredKey)> {
        let mut state = self.state.lock();
        let mut purged = Vec::new();
        let mut floor = state.floor;
        state.keys.retain(|&key, list| {
            list.retain(|entry| {
                if entry.ts <= horizon {
                    floor = floor.max(entry.ts);
                    purged.push((key, *entry));
                    false
                } else {
                    true
                }
            });
            !list.is_empty()
        });
        state.floor = floor;
        purged
    }

    /// Every retirement, for the catalog.
    pub fn entries(&self) -> (Vec<(i64, RetiredKey)>, Timestamp) {
        let state = self.state.lock();
        let entries = state
            .keys
            .iter()
            .flat_map(|(&key, list)| list.iter().map(move |entry| (key, *entry)))
            .collect();
        (entries, state.floor)
    }

    /// Number of retired keys.
    pub fn len(&self) -> usize {
        self.state.lock().keys.values().map(Vec::len).sum()
    }

    /// True when nothing is retired.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
