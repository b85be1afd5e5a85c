use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::primitives::concurrency::LockMode;
use crate::storage::mvcc::Clock;
use crate::storage::txn::TxnState;
use crate::storage::{Record, StorageMetrics, Table};
use crate::types::{LStoreError, Result, Rid, TableId, Timestamp, TxnId};

/// The state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    /// Accepting operations.
    Active,
    /// Committed; its writes are visible.
    Committed,
    /// Rolled back; its writes were undone.
    Aborted,
}

/// One operation queued on a [`Transaction`] for [`Transaction::run`].
#[derive(Clone)]
pub enum Query {
    /// Insert a full row.
    Insert {
        /// Target table.
        table: Arc<Table>,
        /// Row values.
        values: Vec<i64>,
    },
    /// Read the records whose `column` equals `value`.
    Select {
        /// Target table.
        table: Arc<Table>,
        /// Value searched for.
        value: i64,
        /// Column searched.
        column: usize,
        /// Columns returned.
        projection: Vec<bool>,
    },
    /// Update the columns given as `Some`.
    Update {
        /// Target table.
        table: Arc<Table>,
        /// Primary key of the record.
        key: i64,
        /// New values.
        values: Vec<Option<i64>>,
    },
    /// Delete a record.
    Delete {
        /// Target table.
        table: Arc<Table>,
        /// Primary key of the record.
        key: i64,
    },
    /// Sum a column over an inclusive key range.
    Sum {
        /// Target table.
        table: Arc<Table>,
        /// One end of the key range.
        start: i64,
        /// Other end of the key range.
        end: i64,
        /// Column summed.
        column: usize,
    },
    /// Add one to a column.
    Increment {
        /// Target table.
        table: Arc<Table>,
        /// Primary key of the record.
        key: i64,
        /// Column incremented.
        column: usize,
    },
}

impl Query {
    /// Queues an insert.
    pub fn insert(table: &Arc<Table>, values: &[i64]) -> Self {
        Query::Insert {
            table: table.clone(),
            values: values.to_vec(),
        }
    }

    /// Queues a select.
    pub fn select(table: &Arc<Table>, value: i64, column: usize, projection: &[bool]) -> Self {
        Query::Select {
            table: table.clone(),
            value,
            column,
            projection: projection.to_vec(),
        }
    }

    /// Queues an update.
    pub fn update(table: &Arc<Table>, key: i64, values: &[Option<i64>]) -> Self {
        Query::Update {
            table: table.clone(),
            key,
            values: values.to_vec(),
        }
    }

    /// Queues a delete.
    pub fn delete(table: &Arc<Table>, key: i64) -> Self {
        Query::Delete {
            table: table.clone(),
            key,
        }
    }

    /// Queues a sum.
    pub fn sum(table: &Arc<Table>, start: i64, end: i64, column: usize) -> Self {
        Query::Sum {
            table: table.clone(),
            start,
            end,
            column,
        }
    }

    /// Queues an increment.
    pub fn increment(table: &Arc<Table>, key: i64, column: usize) -> Self {
        Query::Increment {
            table: table.clone(),
            key,
            column,
        }
    }

    fn table(&self) -> &Arc<Table> {
        match self {
            Query::Insert { table, .. }
            | Query::Select { table, .. }
            | Query::Update { table, .. }
            | Query::Delete { table, .. }
            | Query::Sum { table, .. }
            | Query::Increment { table, .. } => table,
        }
    }

    /// Records this query will touch, as far as the indexes tell now.
    fn lock_plan(&self) -> (LockMode, Vec<Rid>) {
        let core = self.table().core();
        match *self {
            Query::Insert { .. } => (LockMode::Exclusive, Vec::new()),
            Query::Select { value, column, .. } => {
                (LockMode::Shared, core.resolve_value(column, value))
            }
            Query::Update { key, .. } | Query::Delete { key, .. } | Query::Increment { key, .. } => {
                (LockMode::Exclusive, core.resolve_key(key).into_iter().collect())
            }
            Query::Sum { start, end, .. } => (LockMode::Shared, core.resolve_range(start, end)),
        }
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Query::Insert { .. } => "insert",
            Query::Select { .. } => "select",
            Query::Update { .. } => "update",
            Query::Delete { .. } => "delete",
            Query::Sum { .. } => "sum",
            Query::Increment { .. } => "increment",
        };
        f.debug_struct("Query")
            .field("kind", &kind)
            .field("table", &self.table().name())
            .finish()
    }
}

/// Result of one executed query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryResult {
    /// RID of the inserted record.
    Inserted(Rid),
    /// Matching records.
    Selected(Vec<Record>),
    /// The update was applied.
    Updated,
    /// The record was deleted.
    Deleted,
    /// The computed sum.
    Sum(i64),
    /// The increment was applied.
    Incremented,
}

/// How [`Transaction::run`] ended.
#[derive(Debug)]
pub enum TxnOutcome {
    /// Every query ran and the transaction committed.
    Committed(Vec<QueryResult>),
    /// A query failed or a lock could not be taken; every write was undone.
    Aborted(LStoreError),
}

impl TxnOutcome {
    /// True for [`TxnOutcome::Committed`].
    pub fn is_committed(&self) -> bool {
        matches!(self, TxnOutcome::Committed(_))
    }
}

/// A unit of work over one or more tables.
///
/// Operations can be issued one at a time, each taking the record locks it
/// needs, or queued with [`Transaction::add`] and executed by
/// [`Transaction::run`], which takes every lock it can foresee up front in
/// ascending RID order. Locks are held until commit or abort. A transaction
/// dropped while active is rolled back.
///
/// # Example
///
/// ```rust,no_run
/// use lstore::{Database, EngineOptions};
///
/// let db = Database::open("/tmp/grades", EngineOptions::default())?;
/// let grades = db.create_table("grades", 5, 0)?;
/// let mut txn = db.begin_transaction();
/// txn.insert(&grades, &[1, 90, 80, 70, 60])?;
/// txn.update(&grades, 1, &[None, Some(95), None, None, None])?;
/// txn.commit()?;
/// # Ok::<(), lstore::LStoreError>(())
/// ```
pub struct Transaction {
    id: TxnId,
    clock: Arc<Clock>,
    metrics: Arc<dyn StorageMetrics>,
    state: TxnState,
    queue: Vec<Query>,
    status: TxnStatus,
}

impl Transaction {
    pub(crate) fn new(
        id: TxnId,
        clock: Arc<Clock>,
        metrics: Arc<dyn StorageMetrics>,
        state: TxnState,
    ) -> Self {
        debug!(txn = id.0, "txn.begin");
        Self {
            id,
            clock,
            metrics,
            state,
            queue: Vec::new(),
            status: TxnStatus::Active,
        }
    }

    /// Transaction id.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Current status.
    pub fn status(&self) -> TxnStatus {
        self.status
    }

    /// Number of writes made so far.
    pub fn writes(&self) -> usize {
        self.state.writes()
    }

    /// Number of record locks held.
    pub fn locks_held(&self) -> usize {
        self.state.locks_held()
    }

    fn ensure_active(&self) -> Result<()> {
        if self.status != TxnStatus::Active {
            return Err(LStoreError::Invalid("transaction already finished"));
        }
        Ok(())
    }

    /// Inserts a full row into `table`.
    pub fn insert(&mut self, table: &Table, values: &[i64]) -> Result<Rid> {
        self.ensure_active()?;
        table.core().insert(&mut self.state, values)
    }

    /// Reads the records of `table` whose `column` equals `value`.
    pub fn select(
        &mut self,
        table: &Table,
        value: i64,
        column: usize,
        projection: &[bool],
    ) -> Result<Vec<Record>> {
        self.ensure_active()?;
        table.core().select(&mut self.state, value, column, projection)
    }

    /// Updates the columns given as `Some` on the record holding `key`.
    pub fn update(&mut self, table: &Table, key: i64, values: &[Option<i64>]) -> Result<()> {
        self.ensure_active()?;
        table.core().update(&mut self.state, key, values)
    }

    /// Deletes the record holding `key`.
    pub fn delete(&mut self, table: &Table, key: i64) -> Result<()> {
        self.ensure_active()?;
        table.core().delete(&mut self.state, key)
    }

    /// Sums `column` over keys between `start` and `end` inclusive.
    pub fn sum(&mut self, table: &Table, start: i64, end: i64, column: usize) -> Result<i64> {
        self.ensure_active()?;
        table.core().sum(&mut self.state, start, end, column)
    }

    /// Adds one to `column` of the record holding `key`.
    pub fn increment(&mut self, table: &Table, key: i64, column: usize) -> Result<()> {
        self.ensure_active()?;
        table.core().increment(&mut self.state, key, column)
    }

    /// Queues a query for [`Transaction::run`].
    pub fn add(&mut self, query: Query) {
        self.queue.push(query);
    }

    /// Number of queued queries.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Makes every write visible under one commit timestamp and releases
    /// the locks. Returns `None` when nothing was written.
    pub fn commit(mut self) -> Result<Option<Timestamp>> {
        self.finish_commit()
    }

    fn finish_commit(&mut self) -> Result<Option<Timestamp>> {
        self.ensure_active()?;
        match self.state.commit(&self.clock) {
            Ok(ts) => {
                self.status = TxnStatus::Committed;
                self.metrics.txn_committed();
                Ok(ts)
            }
            Err(err) => {
                debug!(txn = self.id.0, error = %err, "txn.commit_failed");
                self.status = TxnStatus::Aborted;
                self.metrics.txn_aborted();
                Err(err)
            }
        }
    }

    /// Undoes every write and releases the locks.
    pub fn abort(mut self) -> Result<()> {
        self.finish_abort()
    }

    fn finish_abort(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.status = TxnStatus::Aborted;
        self.metrics.txn_aborted();
        self.state.abort()
    }

    /// Runs the queued queries and commits, or aborts on the first failure.
    pub fn run(mut self) -> TxnOutcome {
        match self.run_queue() {
            Ok(results) => match self.finish_commit() {
                Ok(_) => TxnOutcome::Committed(results),
                Err(err) => TxnOutcome::Aborted(err),
            },
            Err(err) => {
                debug!(txn = self.id.0, error = %err, "txn.run_failed");
                if let Err(abort) = self.finish_abort() {
                    warn!(txn = self.id.0, error = %abort, "txn.abort_failed");
                }
                TxnOutcome::Aborted(err)
            }
        }
    }

    fn run_queue(&mut self) -> Result<Vec<QueryResult>> {
        self.ensure_active()?;
        let queries = std::mem::take(&mut self.queue);

        let mut plan: BTreeMap<(TableId, Rid), (Arc<Table>, LockMode)> = BTreeMap::new();
        for query in &queries {
            let (mode, rids) = query.lock_plan();
            for rid in rids {
                let entry = plan
                    .entry((query.table().id(), rid))
                    .or_insert_with(|| (query.table().clone(), mode));
                if mode == LockMode::Exclusive {
                    entry.1 = LockMode::Exclusive;
                }
            }
        }
        for ((_, rid), (table, mode)) in &plan {
            self.state.lock(table.core(), *rid, *mode)?;
        }

        queries.iter().map(|query| self.execute(query)).collect()
    }

    fn execute(&mut self, query: &Query) -> Result<QueryResult> {
        let state = &mut self.state;
        match query {
            Query::Insert { table, values } => table.core().insert(state, values).map(QueryResult::Inserted),
            Query::Select {
                table,
                value,
                column,
                projection,
            } => table
                .core()
                .select(state, *value, *column, projection)
                .map(QueryResult::Selected),
            Query::Update { table, key, values } => table
                .core()
                .update(state, *key, values)
                .map(|()| QueryResult::Updated),
            Query::Delete { table, key } => table
                .core()
                .delete(state, *key)
                .map(|()| QueryResult::Deleted),
            Query::Sum {
                table,
                start,
                end,
                column,
            } => table
                .core()
                .sum(state, *start, *end, *column)
                .map(QueryResult::Sum),
            Query::Increment { table, key, column } => table
                .core()
                .increment(state, *key, *column)
                .map(|()| QueryResult::Incremented),
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("writes", &self.state.writes())
            .field("queued", &self.queue.len())
            .finish()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.status == TxnStatus::Active && self.state.writes() > 0 {
            warn!(txn = self.id.0, "txn.dropped_active");
            if let Err(err) = self.finish_abort() {
                warn!(txn = self.id.0, error = %err, "txn.abort_failed");
            }
        }
    }
}
