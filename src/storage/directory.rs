use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::types::{RangeId, Rid};

const SHARDS: usize = 16;

/// Physical home of a record: its page range and base slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RecordLocation {
    /// Page range holding the base row.
    pub range: RangeId,
    /// Base slot inside the range.
    pub slot: u32,
}

/// RID to base-slot mapping, sharded by RID.
///
/// Merges rewrite base pages but never move a record, so an entry stays
/// valid for the life of its RID.
pub struct PageDirectory {
    shards: Vec<RwLock<FxHashMap<Rid, RecordLocation>>>,
}

impl Default for PageDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl PageDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| RwLock::new(FxHashMap::default())).collect(),
        }
    }

    fn shard(&self, rid: Rid) -> &RwLock<FxHashMap<Rid, RecordLocation>> {
        &self.shards[rid.0 as usize % SHARDS]
    }

    /// Records the location of a new RID.
    pub fn insert(&self, rid: Rid, location: RecordLocation) {
        self.shard(rid).write().insert(rid, location);
    }

    /// Location of `rid`, if it is live.
    pub fn get(&self, rid: Rid) -> Option<RecordLocation> {
        self.shard(rid).read().get(&rid).copied()
    }

    /// Forgets `rid`.
    pub fn remove(&self, rid: Rid) -> Option<RecordLocation> {
        self.shard(rid).write().remove(&rid)
    }

    /// Number of mapped RIDs.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    /// True when no RID is mapped.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every mapping, ordered by RID.
    pub fn entries(&self) -> Vec<(Rid, RecordLocation)> {
        let mut entries: Vec<_> = self
            .shards
            .iter()
            .flat_map(|shard| {
                shard
                    .read()
                    .iter()
                    .map(|(&rid, &loc)| (rid, loc))
                    .collect::<Vec<_>>()
            })
            .collect();
        entries.sort_unstable_by_key(|(rid, _)| *rid);
        entries
    }
}
