//! Database handle: table lifecycle, transactions and shutdown.

mod transaction;
mod worker;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::primitives::cache::{Cache, CacheStats};
use crate::primitives::disk::DiskStore;
use crate::primitives::io::{FileOpener, StdOpener};
use crate::storage::catalog::{DatabaseCatalog, TableCatalog, TableEntry, DATABASE_CATALOG};
use crate::storage::metrics::{default_metrics, StorageMetrics};
use crate::storage::mvcc::{Clock, ReaderRegistry, Snapshot};
use crate::storage::options::EngineOptions;
use crate::storage::record::Schema;
use crate::storage::table::{Table, TableCore, TableEnv};
use crate::storage::txn::TxnState;
use crate::types::{LStoreError, Result, TableId, Timestamp, TxnId};

pub use transaction::{Query, QueryResult, Transaction, TxnOutcome, TxnStatus};
pub use worker::TransactionWorker;

/// An open database directory.
///
/// Each table lives in a subdirectory named after it. Tables are opened
/// lazily by [`Database::get_table`] and stay open until the database is
/// closed or the table is dropped.
///
/// # Example
///
/// ```rust,no_run
/// use lstore::{Database, EngineOptions};
///
/// let db = Database::open("/tmp/school", EngineOptions::default())?;
/// let grades = db.create_table("grades", 5, 0)?;
/// grades.insert(&[906659671, 93, 0, 0, 0])?;
/// let rows = grades.select(906659671, 0, &[true; 5])?;
/// assert_eq!(rows[0].columns[1], Some(93));
/// db.close()?;
/// # Ok::<(), lstore::LStoreError>(())
/// ```
pub struct Database {
    dir: PathBuf,
    options: EngineOptions,
    disk: Arc<DiskStore>,
    cache: Arc<Cache>,
    clock: Arc<Clock>,
    readers: Arc<ReaderRegistry>,
    metrics: Arc<dyn StorageMetrics>,
    catalog: Mutex<DatabaseCatalog>,
    tables: RwLock<HashMap<String, Arc<Table>>>,
    next_txn: AtomicU64,
    closed: AtomicBool,
}

impl Database {
    /// Opens `dir`, creating it when missing.
    pub fn open(dir: impl AsRef<Path>, options: EngineOptions) -> Result<Self> {
        Self::open_with(dir, options, Arc::new(StdOpener))
    }

    /// Opens `dir` with page files created through `opener`.
    pub fn open_with(
        dir: impl AsRef<Path>,
        options: EngineOptions,
        opener: Arc<dyn FileOpener>,
    ) -> Result<Self> {
        options.validate()?;
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let catalog = DatabaseCatalog::load_or_empty(&dir)?;
        let disk = Arc::new(DiskStore::new(options.page_size, opener));
        let cache = Arc::new(Cache::new(
            options.cache_pages,
            disk.clone(),
            options.verify_checksums,
        ));
        let metrics = options.metrics.clone().unwrap_or_else(default_metrics);
        info!(
            dir = %dir.display(),
            tables = catalog.tables.len(),
            clock = catalog.clock,
            "db.open"
        );
        Ok(Self {
            clock: Arc::new(Clock::new(catalog.clock)),
            readers: Arc::new(ReaderRegistry::new()),
            catalog: Mutex::new(catalog),
            tables: RwLock::new(HashMap::new()),
            next_txn: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            dir,
            options,
            disk,
            cache,
            metrics,
        })
    }

    /// Directory the database lives in.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Options the database was opened with.
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    fn env(&self) -> TableEnv {
        TableEnv {
            cache: self.cache.clone(),
            clock: self.clock.clone(),
            readers: self.readers.clone(),
            options: self.options.clone(),
            metrics: self.metrics.clone(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LStoreError::Invalid("database is closed"));
        }
        Ok(())
    }

    /// Creates a table with `num_columns` user columns keyed on
    /// `key_column`. An existing table of the same name is dropped first.
    pub fn create_table(
        &self,
        name: &str,
        num_columns: usize,
        key_column: usize,
    ) -> Result<Arc<Table>> {
        self.ensure_open()?;
        validate_name(name)?;
        let schema = Schema::new(num_columns, key_column)?;
        if self.catalog.lock().table(name).is_some() {
            self.drop_table(name)?;
        }

        let id = {
            let mut catalog = self.catalog.lock();
            let id = TableId(catalog.next_table);
            catalog.next_table += 1;
            id
        };
        let dir = self.dir.join(name);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        self.disk.register_table(id, &dir)?;
        let core = Arc::new(TableCore::create(id, name, dir.clone(), schema, self.env()));
        core.catalog().save(&dir)?;
        let table = Arc::new(Table::open(core)?);

        {
            let mut catalog = self.catalog.lock();
            catalog.tables.push(TableEntry {
                name: name.to_owned(),
                id,
            });
            catalog.clock = self.clock.now();
            catalog.save(&self.dir)?;
        }
        self.tables.write().insert(name.to_owned(), table.clone());
        info!(table = name, id = id.0, num_columns, key_column, "db.create_table");
        Ok(table)
    }

    /// Handle to the table called `name`, loading it from its catalog
    /// snapshot when it is not open yet.
    pub fn get_table(&self, name: &str) -> Result<Arc<Table>> {
        self.ensure_open()?;
        if let Some(table) = self.tables.read().get(name) {
            return Ok(table.clone());
        }
        let mut tables = self.tables.write();
        if let Some(table) = tables.get(name) {
            return Ok(table.clone());
        }
        let entry = self
            .catalog
            .lock()
            .table(name)
            .cloned()
            .ok_or(LStoreError::NotFound)?;
        let dir = self.dir.join(&entry.name);
        let catalog = TableCatalog::load(&dir)?;
        if catalog.id != entry.id {
            return Err(LStoreError::Corruption("table catalog id mismatch"));
        }
        self.clock.advance_to(catalog.clock);
        self.disk.register_table(entry.id, &dir)?;
        let core = TableCore::restore(catalog, dir, self.env())?;
        let table = Arc::new(Table::open(Arc::new(core))?);
        tables.insert(name.to_owned(), table.clone());
        debug!(table = name, id = entry.id.0, records = table.len(), "db.load_table");
        Ok(table)
    }

    /// Deletes the table called `name` and its files.
    pub fn drop_table(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        let entry = self
            .catalog
            .lock()
            .table(name)
            .cloned()
            .ok_or(LStoreError::NotFound)?;
        if let Some(table) = self.tables.write().remove(name) {
            table.stop_merger();
        }
        let dir = self.dir.join(&entry.name);
        self.cache.discard_table(entry.id);
        self.disk.register_table(entry.id, &dir)?;
        self.disk.remove_table_files(entry.id)?;
        self.disk.unregister_table(entry.id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        let mut catalog = self.catalog.lock();
        catalog.tables.retain(|table| table.name != name);
        catalog.save(&self.dir)?;
        info!(table = name, id = entry.id.0, "db.drop_table");
        Ok(())
    }

    /// Names of every table, sorted.
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .catalog
            .lock()
            .tables
            .iter()
            .map(|entry| entry.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Starts a transaction.
    pub fn begin_transaction(&self) -> Transaction {
        let id = TxnId(self.next_txn.fetch_add(1, Ordering::Relaxed));
        Transaction::new(
            id,
            self.clock.clone(),
            self.metrics.clone(),
            TxnState::new(self.options.lock_timeout()),
        )
    }

    /// Registers a read view at the current time.
    pub fn snapshot(&self) -> Snapshot {
        self.readers.register(&self.clock)
    }

    /// Current time of the database clock.
    pub fn now(&self) -> Timestamp {
        self.clock.stable_now()
    }

    /// Page cache counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Closes every open table, flushes the cache and writes the catalog.
    ///
    /// Further calls are no-ops.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let tables: Vec<Arc<Table>> = self.tables.write().drain().map(|(_, t)| t).collect();
        let mut first_error: Option<LStoreError> = None;
        for table in &tables {
            if let Err(err) = table.close() {
                warn!(table = %table.name(), error = %err, "db.close_table_failed");
                first_error.get_or_insert(err);
            }
        }
        let flushed = self.cache.flush_all()?;
        self.disk.sync()?;
        {
            let mut catalog = self.catalog.lock();
            catalog.clock = self.clock.now();
            catalog.save(&self.dir)?;
        }
        info!(
            dir = %self.dir.display(),
            tables = tables.len(),
            flushed,
            "db.close"
        );
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(dir = %self.dir.display(), error = %err, "db.close_on_drop_failed");
        }
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.starts_with('.') {
        return Err(LStoreError::Invalid("table name must be non-empty"));
    }
    if name.contains(['/', '\\']) || name == DATABASE_CATALOG {
        return Err(LStoreError::Invalid("table name may not be a path"));
    }
    Ok(())
}
