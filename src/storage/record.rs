//! Record layout: metadata columns, tail pointers and schema checks.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{LStoreError, Result, Rid, Timestamp};

/// Physical column holding the record id.
pub const RID_COLUMN: u16 = 0;
/// Physical column holding the newest tail entry (base) or the previous
/// entry (tail).
pub const INDIRECTION_COLUMN: u16 = 1;
/// Physical column holding the schema-encoding bitmap and entry flags.
pub const SCHEMA_ENCODING_COLUMN: u16 = 2;
/// Physical column holding the version timestamp.
pub const TIMESTAMP_COLUMN: u16 = 3;
/// Number of engine-reserved columns preceding the user columns.
pub const META_COLUMNS: usize = 4;
/// Largest number of user columns the encoding bitmap can describe.
pub const MAX_USER_COLUMNS: usize = 62;

/// Flag bits stored above the per-column bits of the schema encoding.
pub mod flags {
    /// Entry preserves the record as it was before its first update.
    pub const SNAPSHOT: u64 = 1 << 62;
    /// Entry (or merged base row) marks the record deleted.
    pub const TOMBSTONE: u64 = 1 << 63;
    /// Bits describing user columns.
    pub const COLUMN_MASK: u64 = SNAPSHOT - 1;
}

/// Physical column index of user column `column`.
pub const fn user_column(column: usize) -> u16 {
    (META_COLUMNS + column) as u16
}

/// Location of one tail entry inside a page range.
///
/// Packs the tail page sequence number in the high half and the slot in
/// the low half, so pointers order by append order.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct TailPtr(u64);

impl TailPtr {
    /// Pointer to no entry.
    pub const NULL: TailPtr = TailPtr(u64::MAX);
    /// Position of the first entry ever appended to a range.
    pub const ORIGIN: TailPtr = TailPtr(0);

    /// Builds a pointer from a tail sequence number and slot.
    pub const fn new(seq: u32, slot: u32) -> Self {
        Self(((seq as u64) << 32) | slot as u64)
    }

    /// Tail page sequence number.
    pub const fn seq(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Slot inside the tail page.
    pub const fn slot(self) -> u32 {
        self.0 as u32
    }

    /// True for [`TailPtr::NULL`].
    pub const fn is_null(self) -> bool {
        self.0 == u64::MAX
    }

    /// Raw representation stored in an indirection slot.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Rebuilds a pointer from its stored representation.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for TailPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("TailPtr(null)")
        } else {
            write!(f, "TailPtr({}:{})", self.seq(), self.slot())
        }
    }
}

/// Fixed table schema.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    /// Number of user columns.
    pub num_columns: usize,
    /// User column holding the primary key.
    pub key_column: usize,
}

impl Schema {
    /// Validates and builds a schema.
    pub fn new(num_columns: usize, key_column: usize) -> Result<Self> {
        if num_columns == 0 || num_columns > MAX_USER_COLUMNS {
            return Err(LStoreError::SchemaViolation(format!(
                "tables hold 1..={MAX_USER_COLUMNS} columns, got {num_columns}"
            )));
        }
        if key_column >= num_columns {
            return Err(LStoreError::SchemaViolation(format!(
                "key column {key_column} outside {num_columns} columns"
            )));
        }
        Ok(Self {
            num_columns,
            key_column,
        })
    }

    /// Total physical columns including metadata.
    pub fn physical_columns(&self) -> usize {
        META_COLUMNS + self.num_columns
    }

    /// Projection selecting every user column.
    pub fn all_columns(&self) -> Vec<bool> {
        vec![true; self.num_columns]
    }

    /// Rejects a full row of the wrong arity.
    pub fn check_row(&self, values: &[i64]) -> Result<()> {
        self.check_len("row", values.len())
    }

    /// Rejects a partial row of the wrong arity.
    pub fn check_partial(&self, values: &[Option<i64>]) -> Result<()> {
        self.check_len("update", values.len())
    }

    /// Rejects a projection of the wrong arity.
    pub fn check_projection(&self, projection: &[bool]) -> Result<()> {
        self.check_len("projection", projection.len())
    }

    /// Rejects a user column index outside the schema.
    pub fn check_column(&self, column: usize) -> Result<()> {
        if column >= self.num_columns {
            return Err(LStoreError::SchemaViolation(format!(
                "column {column} outside {} columns",
                self.num_columns
            )));
        }
        Ok(())
    }

    fn check_len(&self, what: &str, len: usize) -> Result<()> {
        if len != self.num_columns {
            return Err(LStoreError::SchemaViolation(format!(
                "{what} has {len} columns, table has {}",
                self.num_columns
            )));
        }
        Ok(())
    }
}

/// Record returned by reads. Columns outside the projection are `None`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Record {
    /// Record id.
    pub rid: Rid,
    /// Primary key at the version read.
    pub key: i64,
    /// Projected user columns.
    pub columns: Vec<Option<i64>>,
}

impl Record {
    pub(crate) fn project(rid: Rid, key: i64, values: &[i64], projection: &[bool]) -> Self {
        let columns = values
            .iter()
            .zip(projection)
            .map(|(&value, &keep)| keep.then_some(value))
            .collect();
        Self { rid, key, columns }
    }

    /// Projected values, or `None` when any column was left out.
    pub fn values(&self) -> Option<Vec<i64>> {
        self.columns.iter().copied().collect()
    }
}

/// One version of a record as read from a base row or tail entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Version {
    pub encoding: u64,
    pub ts: Timestamp,
    pub values: Vec<i64>,
}

impl Version {
    pub fn is_tombstone(&self) -> bool {
        self.encoding & flags::TOMBSTONE != 0
    }
}

/// Tail entry as written to, and read back from, a tail page.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct TailEntry {
    pub rid: Rid,
    pub prev: TailPtr,
    pub encoding: u64,
    pub ts: Timestamp,
    pub values: Vec<i64>,
}

impl TailEntry {
    pub fn into_version(self) -> Version {
        Version {
            encoding: self.encoding,
            ts: self.ts,
            values: self.values,
        }
    }
}

/// Applies entries, newest first, onto a copy of `base`.
///
/// Each column takes its value from the newest entry whose bitmap marks it
/// changed; the newest entry decides the tombstone flag. Returns the merged
/// encoding, which accumulates every column ever changed.
pub(crate) fn apply_newest_first(base: &mut Version, newest_first: &[TailEntry]) {
    let Some(newest) = newest_first.first() else {
        return;
    };
    let mut settled = 0u64;
    for entry in newest_first {
        let pending = entry.encoding & flags::COLUMN_MASK & !settled;
        if pending != 0 {
            for (column, value) in base.values.iter_mut().enumerate() {
                if pending & (1 << column) != 0 {
                    *value = entry.values[column];
                }
            }
            settled |= pending;
        }
    }
    let columns = (base.encoding | settled) & flags::COLUMN_MASK;
    base.encoding = columns | (newest.encoding & flags::TOMBSTONE);
    base.ts = base.ts.max(newest.ts);
}
