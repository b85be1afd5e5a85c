use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::primitives::page::{slots_per_page, DEFAULT_PAGE_SIZE};
use crate::types::{LStoreError, Result};

use super::metrics::StorageMetrics;

/// Configuration supplied when opening a [`crate::db::Database`].
///
/// Every field has a default, so a TOML file only needs the keys it wants
/// to override:
///
/// ```toml
/// cache_pages = 256
/// lock_timeout_ms = 100
///
/// [merge]
/// tail_threshold = 512
/// ```
#[derive(Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineOptions {
    /// Page block size in bytes.
    pub page_size: usize,
    /// Maximum number of pages resident in the cache.
    pub cache_pages: usize,
    /// Base record slots per page range.
    pub records_per_range: usize,
    /// Background merge configuration.
    pub merge: MergeCfg,
    /// Bounded wait for a record lock before the transaction aborts.
    pub lock_timeout_ms: u64,
    /// Whether page checksums are verified when pages are loaded.
    pub verify_checksums: bool,
    /// Whether closing a table flushes its dirty pages and catalog.
    pub flush_on_close: bool,
    /// Optional metrics sink.
    #[serde(skip)]
    pub metrics: Option<Arc<dyn StorageMetrics>>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_pages: 1024,
            records_per_range: 4096,
            merge: MergeCfg::default(),
            lock_timeout_ms: 50,
            verify_checksums: true,
            flush_on_close: true,
            metrics: None,
        }
    }
}

impl EngineOptions {
    /// Parses options from TOML text. Unknown keys are rejected.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let options: EngineOptions = toml::from_str(text)?;
        options.validate()?;
        Ok(options)
    }

    /// Reads options from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Checks that the options describe a usable engine.
    pub fn validate(&self) -> Result<()> {
        if slots_per_page(self.page_size) == 0 {
            return Err(LStoreError::Invalid("page size cannot hold a header and one slot"));
        }
        if self.page_size > u32::MAX as usize {
            return Err(LStoreError::Invalid("page size too large"));
        }
        if self.cache_pages == 0 {
            return Err(LStoreError::Invalid("cache must hold at least one page"));
        }
        if self.records_per_range == 0 || self.records_per_range > u32::MAX as usize {
            return Err(LStoreError::Invalid("records per range out of bounds"));
        }
        if self.merge.tail_threshold == 0 {
            return Err(LStoreError::Invalid("merge tail threshold must be positive"));
        }
        Ok(())
    }

    /// Lock wait as a [`Duration`].
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Sets the page size in bytes.
    pub fn page_size(mut self, bytes: usize) -> Self {
        self.page_size = bytes;
        self
    }

    /// Sets the cache capacity in pages.
    pub fn cache_pages(mut self, pages: usize) -> Self {
        self.cache_pages = pages;
        self
    }

    /// Sets the number of base slots per page range.
    pub fn records_per_range(mut self, records: usize) -> Self {
        self.records_per_range = records;
        self
    }

    /// Sets the background merge configuration.
    pub fn merge(mut self, cfg: MergeCfg) -> Self {
        self.merge = cfg;
        self
    }

    /// Sets the record lock wait in milliseconds.
    pub fn lock_timeout_ms(mut self, ms: u64) -> Self {
        self.lock_timeout_ms = ms;
        self
    }

    /// Enables or disables checksum verification on load.
    pub fn verify_checksums(mut self, enabled: bool) -> Self {
        self.verify_checksums = enabled;
        self
    }

    /// Enables or disables flushing on close.
    pub fn flush_on_close(mut self, enabled: bool) -> Self {
        self.flush_on_close = enabled;
        self
    }

    /// Sets the metrics collection implementation.
    pub fn metrics(mut self, metrics: Arc<dyn StorageMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Configuration for background merging of tail pages into base pages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MergeCfg {
    /// Whether the background merge worker runs.
    pub enabled: bool,
    /// Tail entries appended to one range since its last merge before a
    /// merge is triggered.
    pub tail_threshold: usize,
    /// Whether the pages written by a merge are flushed right after it.
    pub flush_after_merge: bool,
}

impl Default for MergeCfg {
    fn default() -> Self {
        Self {
            enabled: true,
            tail_threshold: 1024,
            flush_after_merge: false,
        }
    }
}
