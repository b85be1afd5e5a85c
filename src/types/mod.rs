#![forbid(unsafe_code)]

//! Identifiers, error kinds and shared constants.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Page checksum helpers.
pub mod checksum;

/// Stable logical record identifier, never reused while the record exists.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct Rid(pub u64);

/// Identifier of a table inside one database.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct TableId(pub u32);

/// Identifier of a page range inside one table.
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct RangeId(pub u32);

/// Block number inside a (column, page range) file.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct PageNo(pub u32);

/// Transaction identifier handed out by [`crate::db::Database::begin_transaction`].
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TxnId(pub u64);

/// Logical timestamp. Every write ticks the database clock once.
pub type Timestamp = u64;

/// Fully qualified address of one cached page.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct PageKey {
    /// Owning table.
    pub table: TableId,
    /// Physical column (metadata columns first).
    pub column: u16,
    /// Page range within the table.
    pub range: RangeId,
    /// Block number within the (column, range) file.
    pub page: PageNo,
}

impl PageKey {
    /// Builds a key from its parts.
    pub const fn new(table: TableId, column: u16, range: RangeId, page: PageNo) -> Self {
        Self {
            table,
            column,
            range,
            page,
        }
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "t{}/c{}/r{}/p{}",
            self.table.0, self.column, self.range.0, self.page.0
        )
    }
}

/// Errors surfaced by the storage engine.
#[derive(thiserror::Error, Debug)]
pub enum LStoreError {
    /// Disk persistence failed.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// The key or RID is absent or tombstoned.
    #[error("not found")]
    NotFound,
    /// A record lock could not be acquired within the configured wait.
    #[error("lock timeout on rid {rid}")]
    LockTimeout {
        /// Record the transaction was waiting on.
        rid: Rid,
    },
    /// An as-of read asked for a version older than the retained history.
    #[error("snapshot too old: requested {requested}, history retained from {floor}")]
    SnapshotTooOld {
        /// Timestamp the caller asked to read at.
        requested: Timestamp,
        /// Oldest timestamp still readable.
        floor: Timestamp,
    },
    /// Page, slot or page-range allocation failed.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(&'static str),
    /// Column count or column index does not match the table schema.
    #[error("schema violation: {0}")]
    SchemaViolation(String),
    /// The primary key is already present.
    #[error("duplicate primary key {0}")]
    DuplicateKey(i64),
    /// On-disk or in-memory state failed a consistency check.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an argument the engine cannot honour.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// The catalog snapshot could not be encoded or decoded.
    #[error("catalog: {0}")]
    Catalog(#[from] serde_json::Error),
    /// An options file could not be parsed.
    #[error("config: {0}")]
    Config(#[from] toml::de::Error),
}

impl LStoreError {
    /// Returns `true` for errors the caller may retry or report without
    /// treating the engine as broken.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LStoreError::NotFound
                | LStoreError::LockTimeout { .. }
                | LStoreError::DuplicateKey(_)
                | LStoreError::SnapshotTooOld { .. }
        )
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, LStoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_kinds() {
        assert!(LStoreError::NotFound.is_recoverable());
        assert!(LStoreError::LockTimeout { rid: Rid(4) }.is_recoverable());
        assert!(!LStoreError::Corruption("x").is_recoverable());
        assert!(!LStoreError::CapacityExceeded("range").is_recoverable());
    }

    #[test]
    fn page_key_display() {
        let key = PageKey::new(TableId(1), 5, RangeId(2), PageNo(9));
        assert_eq!(key.to_string(), "t1/c5/r2/p9");
    }
}
