use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Trait for tracking record operations and merge activity.
///
/// Implementations receive one call per event and must be cheap; they are
/// invoked on the hot path of every write.
pub trait StorageMetrics: Send + Sync {
    /// Records the insertion of a base record.
    fn record_inserted(&self);

    /// Records an update appended to a tail page.
    fn record_updated(&self);

    /// Records a tombstone appended for a delete.
    fn record_deleted(&self);

    /// Records a completed merge of one page range.
    ///
    /// # Parameters
    /// * `records` - Records whose base row was rewritten.
    /// * `pages_reclaimed` - Pages handed back to the allocator afterwards.
    fn merge_completed(&self, records: u64, pages_reclaimed: u64);

    /// Records a merge that failed and left its range untouched.
    fn merge_failed(&self);

    /// Records a committed transaction.
    fn txn_committed(&self);

    /// Records an aborted transaction.
    fn txn_aborted(&self);
}

/// A no-op implementation of [`StorageMetrics`] that discards all recorded metrics.
#[derive(Default)]
pub struct NoopMetrics;

impl StorageMetrics for NoopMetrics {
    fn record_inserted(&self) {}
    fn record_updated(&self) {}
    fn record_deleted(&self) {}
    fn merge_completed(&self, _records: u64, _pages_reclaimed: u64) {}
    fn merge_failed(&self) {}
    fn txn_committed(&self) {}
    fn txn_aborted(&self) {}
}

/// A thread-safe counter-based implementation of [`StorageMetrics`].
#[derive(Default)]
pub struct CounterMetrics {
    /// Number of base records inserted.
    pub inserts: AtomicU64,

    /// Number of update entries appended.
    pub updates: AtomicU64,

    /// Number of tombstones appended.
    pub deletes: AtomicU64,

    /// Number of completed merges.
    pub merges: AtomicU64,

    /// Number of merges that failed.
    pub merge_failures: AtomicU64,

    /// Records rewritten across all merges.
    pub records_merged: AtomicU64,

    /// Pages reclaimed after merges.
    pub pages_reclaimed: AtomicU64,

    /// Number of committed transactions.
    pub commits: AtomicU64,

    /// Number of aborted transactions.
    pub aborts: AtomicU64,
}

impl StorageMetrics for CounterMetrics {
    fn record_inserted(&self) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    fn record_updated(&self) {
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    fn record_deleted(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    fn merge_completed(&self, records: u64, pages_reclaimed: u64) {
        self.merges.fetch_add(1, Ordering::Relaxed);
        self.records_merged.fetch_add(records, Ordering::Relaxed);
        self.pages_reclaimed
            .fetch_add(pages_reclaimed, Ordering::Relaxed);
    }

    fn merge_failed(&self) {
        self.merge_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn txn_committed(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    fn txn_aborted(&self) {
        self.aborts.fetch_add(1, Ordering::Relaxed);
    }
}

/// Returns the default metrics implementation wrapped in an [`Arc`].
///
/// The default implementation is [`NoopMetrics`], which has zero overhead
/// as it discards all recorded metrics.
pub fn default_metrics() -> Arc<dyn StorageMetrics> {
    Arc::new(NoopMetrics)
}
