//! Catalog snapshots written on orderly shutdown.
//!
//! Each table directory holds a `catalog.json` describing its schema,
//! ranges, directory and indexes; the database directory holds an
//! `lstore.json` listing the tables and the clock.

use std::fs;
use std::path::Path;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

use crate::types::{LStoreError, Result, Rid, TableId, Timestamp};

use super::directory::RecordLocation;
use super::index::RetiredKey;
use super::range::RangeMeta;
use super::record::Schema;

/// File name of a table catalog inside its directory.
pub const TABLE_CATALOG: &str = "catalog.json";
/// File name of the database catalog.
pub const DATABASE_CATALOG: &str = "lstore.json";

const FORMAT_VERSION: u32 = 1;

/// Persisted state of one table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TableCatalog {
    /// Format version of this snapshot.
    pub format: u32,
    /// Table id.
    pub id: TableId,
    /// Table name.
    pub name: String,
    /// Column layout.
    pub schema: Schema,
    /// Page size the column files were written with.
    pub page_size: usize,
    /// Base slots per range.
    pub records_per_range: usize,
    /// Next RID to hand out.
    pub next_rid: u64,
    /// Clock reading when the snapshot was taken.
    pub clock: Timestamp,
    /// Every page range.
    pub ranges: Vec<RangeMeta>,
    /// RID to base slot mapping.
    pub directory: Vec<(Rid, RecordLocation)>,
    /// Primary key to RID mapping.
    pub primary: Vec<(i64, Rid)>,
    /// Columns carrying a secondary index; rebuilt on load.
    pub secondary_columns: Vec<usize>,
    /// Retired keys kept for snapshot reads.
    pub graveyard: Vec<(i64, RetiredKey)>,
    /// Oldest timestamp the retired keys can answer for.
    pub graveyard_floor: Timestamp,
}

impl TableCatalog {
    /// Current format version.
    pub const FORMAT: u32 = FORMAT_VERSION;

    /// Writes the snapshot into `dir`, replacing the previous one.
    pub fn save(&self, dir: &Path) -> Result<()> {
        write_json(dir, TABLE_CATALOG, self)
    }

    /// Reads the snapshot stored in `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let catalog: Self = read_json(dir, TABLE_CATALOG)?;
        if catalog.format != FORMAT_VERSION {
            return Err(LStoreError::Corruption("unsupported table catalog version"));
        }
        Ok(catalog)
    }
}

/// One table known to the database.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TableEntry {
    /// Table name, also the name of its directory.
    pub name: String,
    /// Table id.
    pub id: TableId,
}

/// Persisted state of a database directory.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DatabaseCatalog {
    /// Format version of this snapshot.
    pub format: u32,
    /// Next table id to hand out.
    pub next_table: u32,
    /// Clock reading when the snapshot was taken.
    pub clock: Timestamp,
    /// Known tables.
    pub tables: Vec<TableEntry>,
}

impl DatabaseCatalog {
    /// Catalog of a new database.
    pub fn empty() -> Self {
        Self {
            format: FORMAT_VERSION,
            ..Self::default()
        }
    }

    /// Reads the catalog in `dir`, or an empty one when none was written.
    pub fn load_or_empty(dir: &Path) -> Result<Self> {
        if !dir.join(DATABASE_CATALOG).exists() {
            return Ok(Self::empty());
        }
        let catalog: Self = read_json(dir, DATABASE_CATALOG)?;
        if catalog.format != FORMAT_VERSION {
            return Err(LStoreError::Corruption("unsupported database catalog version"));
        }
        Ok(catalog)
    }

    /// Writes the catalog into `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        write_json(dir, DATABASE_CATALOG, self)
    }

    /// Entry of the table called `name`.
    pub fn table(&self, name: &str) -> Option<&TableEntry> {
        self.tables.iter().find(|entry| entry.name == name)
    }
}

fn write_json<T: Serialize>(dir: &Path, file: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = dir.join(format!("{file}.tmp"));
    fs::write(&tmp, &bytes)?;
    fs::rename(&tmp, dir.join(file))?;
    debug!(dir = %dir.display(), file, bytes = bytes.len(), "catalog.write");
    Ok(())
}

fn read_json<T: DeserializeOwned>(dir: &Path, file: &str) -> Result<T> {
    let bytes = fs::read(dir.join(file))?;
    Ok(serde_json::from_slice(&bytes)?)
}
