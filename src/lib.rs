//! LStore: a columnar, multi-version record store.
//!
//! Tables keep one base row per record and an append-only chain of tail
//! versions for its updates. A background merge folds committed tail
//! versions back into fresh base pages without blocking readers or
//! writers. Transactions take per-record locks and commit every write under
//! a single timestamp, so readers can ask for any table as of a past time.

#![warn(missing_docs)]

pub mod db;
pub mod primitives;
pub mod storage;
pub mod types;

pub use db::{Database, Query, QueryResult, Transaction, TransactionWorker, TxnOutcome, TxnStatus};
pub use primitives::cache::CacheStats;
pub use storage::{
    CounterMetrics, EngineOptions, MergeCfg, MergeStats, NoopMetrics, Record, Schema, Snapshot,
    StorageMetrics, Table,
};
pub use types::{LStoreError, Result, Rid, TableId, Timestamp, TxnId};
