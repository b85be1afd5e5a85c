//! L-Store storage engine: page ranges, indexes, merges and tables.
//!
//! Records live in fixed-size page ranges. Base pages hold the merged
//! state of each record, tail pages accumulate updates, and a background
//! merge folds the tail back into fresh base pages.

/// Catalog snapshots written on shutdown.
pub mod catalog;

/// RID to base-slot mapping.
pub mod directory;

/// Primary and secondary key indexes.
pub mod index;

/// Tail-to-base consolidation and the merge thread.
pub mod merge;

/// Pluggable counters for engine events.
pub mod metrics;

/// Logical clock and snapshot registry.
pub mod mvcc;

/// Engine configuration.
pub mod options;

/// Page ranges: base slots, tail pages, layouts.
pub mod range;

/// Record layout and schema.
pub mod record;

/// Tables and their record operations.
pub mod table;

pub(crate) mod txn;

pub use catalog::{DatabaseCatalog, TableCatalog, TableEntry};
pub use directory::{PageDirectory, RecordLocation};
pub use index::{Graveyard, PrimaryIndex, RetiredKey, RetiredKind, SecondaryIndexes};
pub use merge::{merge_range, MergeMessage, MergeStats, MergeWorker};
pub use metrics::{default_metrics, CounterMetrics, NoopMetrics, StorageMetrics};
pub use mvcc::{Clock, ReaderRegistry, Snapshot, PENDING_TS};
pub use options::{EngineOptions, MergeCfg};
pub use range::{BaseLayout, PageRange, RangeMeta, RangeShape};
pub use record::{Record, Schema, TailPtr, MAX_USER_COLUMNS, META_COLUMNS};
pub use table::Table;
