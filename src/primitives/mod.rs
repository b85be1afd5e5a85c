//! Low-level primitives for building the storage engine.
//!
//! Includes positioned file I/O, the page format, the block store, the
//! page cache and the per-record lock table.

/// Page cache (buffer pool).
///
/// Bounded set of pinned/unpinned page frames with LRU eviction and dirty
/// write-back.
pub mod cache;

/// Concurrency primitives and synchronization.
///
/// Per-record reader/writer locks with bounded waits.
pub mod concurrency;

/// Block store mapping (table, column, range, page) to file offsets.
pub mod disk;

/// I/O abstractions and utilities.
///
/// Interfaces for reading/writing data and file operations.
pub mod io;

/// Fixed-width slot pages.
pub mod page;
