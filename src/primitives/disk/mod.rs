#![forbid(unsafe_code)]

//! Byte-level page persistence.
//!
//! Every table owns a directory; inside it each (column, page range) pair is
//! one file made of `page_size` blocks addressed by [`PageNo`]. The store
//! knows nothing about records: it reads and writes whole blocks.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::primitives::io::{FileIo, FileOpener};
use crate::primitives::page::Page;
use crate::types::{LStoreError, PageKey, PageNo, RangeId, Result, TableId};

const PAGE_FILE_EXT: &str = "pages";

/// Name of the block file for one (column, range) pair.
pub fn page_file_name(column: u16, range: RangeId) -> String {
    format!("c{}_r{}.{}", column, range.0, PAGE_FILE_EXT)
}

type FileKey = (TableId, u16, RangeId);

/// Block store shared by every table of a database.
pub struct DiskStore {
    page_size: usize,
    opener: Arc<dyn FileOpener>,
    tables: RwLock<HashMap<TableId, PathBuf>>,
    files: Mutex<HashMap<FileKey, Arc<dyn FileIo>>>,
}

impl DiskStore {
    /// Creates a store writing `page_size` blocks through `opener`.
    pub fn new(page_size: usize, opener: Arc<dyn FileOpener>) -> Self {
        Self {
            page_size,
            opener,
            tables: RwLock::new(HashMap::new()),
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Block size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Associates a table id with its directory, creating the directory.
    pub fn register_table(&self, table: TableId, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        self.tables.write().insert(table, dir);
        Ok(())
    }

    /// Forgets a table and closes its open files.
    pub fn unregister_table(&self, table: TableId) {
        self.files.lock().retain(|(t, _, _), _| *t != table);
        self.tables.write().remove(&table);
    }

    /// Deletes every block file in the table directory.
    pub fn remove_table_files(&self, table: TableId) -> Result<()> {
        let dir = self.table_dir(table)?;
        self.files.lock().retain(|(t, _, _), _| *t != table);
        if !dir.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(PAGE_FILE_EXT) {
                fs::remove_file(&path)?;
            }
        }
        debug!(table = table.0, dir = %dir.display(), "disk.remove_table_files");
        Ok(())
    }

    fn table_dir(&self, table: TableId) -> Result<PathBuf> {
        self.tables
            .read()
            .get(&table)
            .cloned()
            .ok_or(LStoreError::Invalid("table not registered with disk store"))
    }

    fn file(&self, key: &PageKey) -> Result<Arc<dyn FileIo>> {
        let file_key = (key.table, key.column, key.range);
        if let Some(file) = self.files.lock().get(&file_key) {
            return Ok(file.clone());
        }
        let path = self
            .table_dir(key.table)?
            .join(page_file_name(key.column, key.range));
        let file = self.opener.open(&path)?;
        let mut files = self.files.lock();
        Ok(files.entry(file_key).or_insert(file).clone())
    }

    fn offset(&self, page: PageNo) -> u64 {
        page.0 as u64 * self.page_size as u64
    }

    /// Loads one block. Blocks past the end of the file read as blank pages.
    pub fn read_page(&self, key: &PageKey) -> Result<Page> {
        let file = self.file(key)?;
        let offset = self.offset(key.page);
        if offset + self.page_size as u64 > file.len()? {
            return Ok(Page::blank(self.page_size));
        }
        let mut buf = vec![0u8; self.page_size];
        match file.read_at(offset, &mut buf) {
            Ok(()) => Page::from_bytes(&buf),
            Err(LStoreError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                Ok(Page::blank(self.page_size))
            }
            Err(err) => Err(err),
        }
    }

    /// Overwrites one block, extending the file when the block is new.
    pub fn write_page(&self, key: &PageKey, page: &Page) -> Result<()> {
        if page.len() != self.page_size {
            return Err(LStoreError::Invalid("page size mismatch"));
        }
        let file = self.file(key)?;
        file.write_at(self.offset(key.page), page.as_bytes())
    }

    /// Syncs every open file to stable storage.
    pub fn sync(&self) -> Result<()> {
        let files: Vec<_> = self.files.lock().values().cloned().collect();
        for file in files {
            file.sync_all()?;
        }
        Ok(())
    }
}
