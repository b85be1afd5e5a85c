//! Transaction atomicity and isolation under strict two-phase locking.

#![allow(missing_docs)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, Once};
use std::thread;

use lstore::primitives::io::{FileIo, FileOpener, StdFileIo};
use lstore::{
    CounterMetrics, Database, EngineOptions, LStoreError, MergeCfg, Query, QueryResult, Result,
    Table, TransactionWorker, TxnOutcome, TxnStatus,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::{tempdir, TempDir};
use tracing_subscriber::EnvFilter;

const ALL: [bool; 3] = [true; 3];

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lstore=warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn open() -> Result<(TempDir, Arc<Database>, Arc<Table>)> {
    init_tracing();
    let dir = tempdir()?;
    let options = EngineOptions::default()
        .records_per_range(256)
        .lock_timeout_ms(20)
        .merge(MergeCfg {
            enabled: true,
            tail_threshold: 128,
            flush_after_merge: false,
        });
    let db = Arc::new(Database::open(dir.path(), options)?);
    let table = db.create_table("accounts", 3, 0)?;
    Ok((dir, db, table))
}

fn value(table: &Table, key: i64, column: usize) -> Result<Option<i64>> {
    match table.select(key, 0, &ALL) {
        Ok(rows) => Ok(rows[0].columns[column]),
        Err(LStoreError::NotFound) => Ok(None),
        Err(err) => Err(err),
    }
}

#[test]
fn abort_restores_every_write() -> Result<()> {
    let (_dir, db, table) = open()?;
    table.create_index(1)?;
    for key in 0..4 {
        table.insert(&[key, 100, 0])?;
    }

    let mut txn = db.begin_transaction();
    txn.update(&table, 0, &[None, Some(1), None])?;
    txn.delete(&table, 1)?;
    txn.insert(&table, &[10, 5, 5])?;
    txn.update(&table, 2, &[Some(20), None, None])?;
    txn.increment(&table, 3, 2)?;
    assert_eq!(txn.writes(), 5);
    txn.abort()?;

    for key in 0..4 {
        assert_eq!(value(&table, key, 1)?, Some(100));
        assert_eq!(value(&table, key, 2)?, Some(0));
    }
    assert_eq!(value(&table, 10, 1)?, None);
    assert_eq!(value(&table, 20, 1)?, None);
    assert_eq!(table.select(100, 1, &ALL)?.len(), 4);
    assert!(matches!(table.select(1, 1, &ALL), Err(LStoreError::NotFound)));
    assert_eq!(table.len(), 4);

    table.insert(&[10, 1, 1])?;
    table.update(2, &[Some(20), None, None])?;
    assert_eq!(value(&table, 20, 1)?, Some(100));
    Ok(())
}

#[test]
fn dropped_transaction_rolls_back() -> Result<()> {
    let (_dir, db, table) = open()?;
    table.insert(&[1, 1, 1])?;
    {
        let mut txn = db.begin_transaction();
        txn.update(&table, 1, &[None, Some(9), None])?;
        assert_eq!(txn.status(), TxnStatus::Active);
    }
    assert_eq!(value(&table, 1, 1)?, Some(1));
    Ok(())
}

#[test]
fn uncommitted_write_blocks_readers() -> Result<()> {
    let (_dir, db, table) = open()?;
    table.insert(&[1, 1, 1])?;
    let before = db.now();

    let mut writer = db.begin_transaction();
    writer.update(&table, 1, &[None, Some(2), None])?;
    assert!(matches!(
        table.select(1, 0, &ALL),
        Err(LStoreError::LockTimeout { .. })
    ));
    assert_eq!(table.select_as_of(1, 0, &ALL, before)?[0].columns[1], Some(1));

    let ts = writer.commit()?.expect("commit timestamp");
    assert!(ts > before);
    assert_eq!(value(&table, 1, 1)?, Some(2));
    assert_eq!(table.select_as_of(1, 0, &ALL, ts - 1)?[0].columns[1], Some(1));
    assert_eq!(table.select_as_of(1, 0, &ALL, ts)?[0].columns[1], Some(2));
    Ok(())
}

#[test]
fn commit_is_atomic_across_tables() -> Result<()> {
    let (_dir, db, checking) = open()?;
    let savings = db.create_table("savings", 3, 0)?;
    checking.insert(&[7, 50, 0])?;
    savings.insert(&[7, 50, 0])?;
    let before = db.now();

    let mut txn = db.begin_transaction();
    txn.update(&checking, 7, &[None, Some(30), None])?;
    txn.update(&savings, 7, &[None, Some(70), None])?;
    let ts = txn.commit()?.expect("commit timestamp");

    assert_eq!(checking.sum_as_of(7, 7, 1, before)? + savings.sum_as_of(7, 7, 1, before)?, 100);
    assert_eq!(checking.sum_as_of(7, 7, 1, ts)?, 30);
    assert_eq!(savings.sum_as_of(7, 7, 1, ts)?, 70);
    Ok(())
}

#[test]
fn concurrent_increments_are_not_lost() -> Result<()> {
    let (_dir, db, table) = open()?;
    for key in 0..8 {
        table.insert(&[key, 0, 0])?;
    }
    let threads = 6;
    let per_thread = 200;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads as u64)
        .map(|seed| {
            let db = db.clone();
            let table = table.clone();
            let barrier = barrier.clone();
            thread::spawn(move || -> Result<usize> {
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                let mut retries = 0;
                barrier.wait();
                for _ in 0..per_thread {
                    let key = rng.gen_range(0..8);
                    loop {
                        let mut txn = db.begin_transaction();
                        match txn.increment(&table, key, 1) {
                            Ok(()) => {
                                txn.commit()?;
                                break;
                            }
                            Err(LStoreError::LockTimeout { .. }) => {
                                txn.abort()?;
                                retries += 1;
                            }
                            Err(err) => return Err(err),
                        }
                    }
                }
                Ok(retries)
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("increment thread")?;
    }
    assert_eq!(table.sum(0, 7, 1)?, (threads * per_thread) as i64);
    Ok(())
}

#[test]
fn queued_transaction_runs_and_reports() -> Result<()> {
    let (_dir, db, table) = open()?;
    table.insert(&[1, 10, 0])?;
    table.insert(&[2, 20, 0])?;

    let mut txn = db.begin_transaction();
    txn.add(Query::select(&table, 1, 0, &ALL));
    txn.add(Query::update(&table, 1, &[None, Some(11), None]));
    txn.add(Query::sum(&table, 2, 1, 1));
    txn.add(Query::insert(&table, &[3, 30, 0]));
    assert_eq!(txn.queued(), 4);

    let TxnOutcome::Committed(results) = txn.run() else {
        panic!("queued transaction aborted");
    };
    assert!(matches!(&results[0], QueryResult::Selected(rows) if rows[0].columns[1] == Some(10)));
    assert_eq!(results[1], QueryResult::Updated);
    assert_eq!(results[2], QueryResult::Sum(31));
    assert!(matches!(results[3], QueryResult::Inserted(_)));
    assert_eq!(table.sum(1, 3, 1)?, 61);
    Ok(())
}

#[test]
fn queued_transaction_aborts_on_held_lock() -> Result<()> {
    let (_dir, db, table) = open()?;
    table.insert(&[1, 1, 0])?;
    table.insert(&[2, 2, 0])?;

    let mut holder = db.begin_transaction();
    holder.update(&table, 2, &[None, Some(5), None])?;

    let mut txn = db.begin_transaction();
    txn.add(Query::update(&table, 1, &[None, Some(100), None]));
    txn.add(Query::increment(&table, 2, 1));
    let outcome = txn.run();
    assert!(matches!(outcome, TxnOutcome::Aborted(LStoreError::LockTimeout { .. })));

    holder.abort()?;
    assert_eq!(value(&table, 1, 1)?, Some(1));
    assert_eq!(value(&table, 2, 1)?, Some(2));
    Ok(())
}

#[test]
fn workers_commit_disjoint_batches() -> Result<()> {
    let (_dir, db, table) = open()?;
    for key in 0..40 {
        table.insert(&[key, 0, 0])?;
    }
    let mut workers: Vec<TransactionWorker> = (0..4).map(|_| TransactionWorker::new()).collect();
    for key in 0..40 {
        let mut txn = db.begin_transaction();
        txn.add(Query::increment(&table, key, 1));
        txn.add(Query::increment(&table, key, 2));
        workers[key as usize % 4].add_transaction(txn);
    }
    for worker in &mut workers {
        worker.run()?;
    }
    let mut committed = 0;
    for worker in &mut workers {
        committed += worker.join()?;
    }
    assert_eq!(committed, 40);
    assert_eq!(table.sum(0, 39, 1)?, 40);
    assert_eq!(table.sum(0, 39, 2)?, 40);
    Ok(())
}

#[test]
fn contended_workers_account_for_every_commit() -> Result<()> {
    let (_dir, db, table) = open()?;
    for key in 0..5 {
        table.insert(&[key, 0, 0])?;
    }
    let mut workers: Vec<TransactionWorker> = (0..4).map(|_| TransactionWorker::new()).collect();
    for i in 0..200i64 {
        let mut txn = db.begin_transaction();
        txn.add(Query::increment(&table, i % 5, 1));
        txn.add(Query::select(&table, (i + 1) % 5, 0, &ALL));
        workers[i as usize % 4].add_transaction(txn);
    }
    for worker in &mut workers {
        worker.run()?;
    }
    let mut committed = 0;
    for worker in &mut workers {
        committed += worker.join()?;
    }
    assert!(committed > 0);
    assert_eq!(table.sum(0, 4, 1)?, committed as i64);
    Ok(())
}

#[test]
fn blocked_upgrade_keeps_the_shared_lock() -> Result<()> {
    let (_dir, db, table) = open()?;
    table.insert(&[1, 100, 0])?;

    let mut first = db.begin_transaction();
    let mut second = db.begin_transaction();
    assert_eq!(first.select(&table, 1, 0, &ALL)?[0].columns[1], Some(100));
    assert_eq!(second.select(&table, 1, 0, &ALL)?[0].columns[1], Some(100));

    assert!(matches!(
        second.update(&table, 1, &[None, Some(101), None]),
        Err(LStoreError::LockTimeout { .. })
    ));
    assert_eq!(second.locks_held(), 1);
    first.abort()?;

    assert!(matches!(
        table.update(1, &[None, Some(0), None]),
        Err(LStoreError::LockTimeout { .. })
    ));
    second.update(&table, 1, &[None, Some(101), None])?;
    second.commit()?;
    assert_eq!(value(&table, 1, 1)?, Some(101));
    Ok(())
}

#[test]
fn read_then_write_transactions_lose_no_update() -> Result<()> {
    let (_dir, db, table) = open()?;
    table.insert(&[1, 100, 0])?;
    let threads = 3;
    let rounds = 25;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let db = db.clone();
            let table = table.clone();
            let barrier = barrier.clone();
            thread::spawn(move || -> Result<usize> {
                let mut conflicts = 0;
                barrier.wait();
                for _ in 0..rounds {
                    loop {
                        let mut txn = db.begin_transaction();
                        let attempt = txn.select(&table, 1, 0, &ALL).and_then(|rows| {
                            let seen = rows[0].columns[1].unwrap_or(0);
                            txn.update(&table, 1, &[None, Some(seen + 1), None])
                        });
                        match attempt {
                            Ok(()) => {
                                txn.commit()?;
                                break;
                            }
                            Err(LStoreError::LockTimeout { .. }) => {
                                txn.abort()?;
                                conflicts += 1;
                                assert!(conflicts < 100_000, "no transaction made progress");
                                thread::yield_now();
                            }
                            Err(err) => return Err(err),
                        }
                    }
                }
                Ok(conflicts)
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("read-modify-write thread")?;
    }
    assert_eq!(value(&table, 1, 1)?, Some(100 + (threads * rounds) as i64));
    Ok(())
}

#[test]
fn scans_wait_on_uncommitted_writes() -> Result<()> {
    let (_dir, db, table) = open()?;
    table.insert(&[1, 5, 0])?;
    table.insert(&[2, 7, 0])?;

    let mut writer = db.begin_transaction();
    writer.update(&table, 1, &[None, Some(6), None])?;
    assert!(matches!(
        table.select(5, 1, &ALL),
        Err(LStoreError::LockTimeout { .. })
    ));
    writer.abort()?;
    let rows = table.select(5, 1, &ALL)?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].key, 1);
    Ok(())
}

#[test]
fn range_reads_lock_in_rid_order() -> Result<()> {
    let (_dir, db, table) = open()?;
    table.insert(&[2, 20, 0])?;
    table.insert(&[1, 10, 0])?;

    let mut writer = db.begin_transaction();
    writer.update(&table, 1, &[None, Some(11), None])?;

    let mut reader = db.begin_transaction();
    assert!(matches!(
        reader.sum(&table, 1, 2, 1),
        Err(LStoreError::LockTimeout { .. })
    ));
    assert_eq!(reader.locks_held(), 1);
    reader.abort()?;

    let mut scanner = db.begin_transaction();
    assert!(matches!(
        scanner.select(&table, 0, 2, &ALL),
        Err(LStoreError::LockTimeout { .. })
    ));
    assert_eq!(scanner.locks_held(), 1);
    scanner.abort()?;
    writer.commit()?;
    assert_eq!(table.sum(1, 2, 1)?, 31);
    Ok(())
}

/// Fails the first read of a range 1 file after being armed.
struct FlakyOpener {
    armed: Arc<AtomicBool>,
}

struct FlakyFile {
    file: StdFileIo,
    armed: Option<Arc<AtomicBool>>,
}

impl FileOpener for FlakyOpener {
    fn open(&self, path: &Path) -> Result<Arc<dyn FileIo>> {
        let second_range = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.contains("_r1."));
        Ok(Arc::new(FlakyFile {
            file: StdFileIo::open(path)?,
            armed: second_range.then(|| self.armed.clone()),
        }))
    }
}

impl FileIo for FlakyFile {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        if let Some(armed) = &self.armed {
            if armed.swap(false, Ordering::AcqRel) {
                return Err(LStoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "injected read failure",
                )));
            }
        }
        self.file.read_at(off, dst)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        self.file.write_at(off, src)
    }

    fn sync_all(&self) -> Result<()> {
        self.file.sync_all()
    }

    fn len(&self) -> Result<u64> {
        self.file.len()
    }
}

#[test]
fn commit_that_fails_midway_aborts_every_write() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let armed = Arc::new(AtomicBool::new(false));
    let metrics = Arc::new(CounterMetrics::default());
    let options = EngineOptions::default()
        .page_size(128)
        .records_per_range(20)
        .cache_pages(24)
        .lock_timeout_ms(20)
        .metrics(metrics.clone())
        .merge(MergeCfg {
            enabled: false,
            ..MergeCfg::default()
        });
    let opener = FlakyOpener {
        armed: armed.clone(),
    };
    let db = Database::open_with(dir.path(), options, Arc::new(opener))?;
    let table = db.create_table("accounts", 3, 0)?;
    for key in 0..240 {
        table.insert(&[key, 50, 0])?;
    }

    let mut txn = db.begin_transaction();
    txn.update(&table, 1, &[None, Some(0), None])?;
    txn.update(&table, 30, &[None, Some(100), None])?;
    assert_eq!(txn.sum(&table, 40, 239, 1)?, 200 * 50);
    armed.store(true, Ordering::Release);
    assert!(matches!(txn.commit(), Err(LStoreError::Io(_))));
    assert!(!armed.load(Ordering::Acquire));

    assert_eq!(metrics.commits.load(Ordering::Relaxed), 0);
    assert_eq!(metrics.aborts.load(Ordering::Relaxed), 1);
    assert_eq!(value(&table, 1, 1)?, Some(50));
    assert_eq!(value(&table, 30, 1)?, Some(50));
    assert_eq!(table.sum(0, 239, 1)?, 240 * 50);

    table.update(30, &[None, Some(60), None])?;
    assert_eq!(value(&table, 30, 1)?, Some(60));
    Ok(())
}
