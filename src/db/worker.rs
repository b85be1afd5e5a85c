use std::thread::{self, JoinHandle};

use tracing::{debug, info};

use crate::types::{LStoreError, Result};

use super::transaction::{Transaction, TxnOutcome};

/// Runs a batch of queued transactions on a dedicated thread.
///
/// Each transaction is run once; one that aborts is counted as failed and
/// not retried.
#[derive(Default)]
pub struct TransactionWorker {
    pending: Vec<Transaction>,
    handle: Option<JoinHandle<usize>>,
    committed: Option<usize>,
}

impl TransactionWorker {
    /// Creates an idle worker with no transactions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a transaction for the next [`TransactionWorker::run`].
    pub fn add_transaction(&mut self, txn: Transaction) {
        self.pending.push(txn);
    }

    /// Number of transactions waiting to run.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Starts running the queued transactions in the background.
    pub fn run(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Err(LStoreError::Invalid("worker is already running"));
        }
        let batch = std::mem::take(&mut self.pending);
        let handle = thread::Builder::new()
            .name("lstore-txn-worker".into())
            .spawn(move || run_batch(batch))?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Waits for the running batch and returns how many transactions
    /// committed.
    pub fn join(&mut self) -> Result<usize> {
        if let Some(handle) = self.handle.take() {
            let committed = handle
                .join()
                .map_err(|_| LStoreError::Invalid("transaction worker panicked"))?;
            self.committed = Some(committed);
        }
        self.committed
            .ok_or(LStoreError::Invalid("worker has not been run"))
    }

    /// Committed count of the last joined batch.
    pub fn result(&self) -> Option<usize> {
        self.committed
    }
}

fn run_batch(batch: Vec<Transaction>) -> usize {
    let total = batch.len();
    let mut committed = 0;
    for txn in batch {
        let id = txn.id();
        match txn.run() {
            TxnOutcome::Committed(_) => committed += 1,
            TxnOutcome::Aborted(err) => debug!(txn = id.0, error = %err, "worker.txn_aborted"),
        }
    }
    info!(total, committed, "worker.batch_done");
    committed
}
