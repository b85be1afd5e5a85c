//! Background and forced merges must never change what readers see.

#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use lstore::{CounterMetrics, Database, EngineOptions, MergeCfg, Result, Table};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::{tempdir, TempDir};
use tracing_subscriber::EnvFilter;

const RECORDS: i64 = 10_000;
const ALL: [bool; 4] = [true; 4];

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

fn open(merge: MergeCfg) -> Result<(TempDir, Database, Arc<Table>, Arc<CounterMetrics>)> {
    init_tracing();
    let dir = tempdir()?;
    let metrics = Arc::new(CounterMetrics::default());
    let options = EngineOptions::default()
        .records_per_range(2048)
        .merge(merge)
        .metrics(metrics.clone());
    let db = Database::open(dir.path(), options)?;
    let table = db.create_table("ledger", 4, 0)?;
    Ok((dir, db, table, metrics))
}

fn read_all(table: &Table) -> Result<Vec<Vec<Option<i64>>>> {
    (0..RECORDS)
        .map(|key| {
            let mut rows = table.select(key, 0, &ALL)?;
            Ok(rows.remove(0).columns)
        })
        .collect()
}

fn wait_for_merges(table: &Table) -> Result<()> {
    for _ in 0..500 {
        table.merge_now()?;
        let mut merged = true;
        for key in 0..RECORDS {
            if table.chain_len(key)? != 0 {
                merged = false;
                break;
            }
        }
        if merged {
            return Ok(());
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("tail chains never drained");
}

#[test]
fn ten_thousand_records_survive_merge() -> Result<()> {
    let (_dir, _db, table, metrics) = open(MergeCfg {
        enabled: true,
        tail_threshold: 512,
        flush_after_merge: false,
    })?;
    for key in 0..RECORDS {
        table.insert(&[key, key * 3, -key, 7])?;
    }
    let mut rng = ChaCha8Rng::seed_from_u64(0x15_70_4e);
    for key in 0..RECORDS {
        let column = rng.gen_range(1..4);
        let mut values = [None; 4];
        values[column] = Some(rng.gen_range(-1_000..1_000));
        table.update(key, &values)?;
    }
    let before = read_all(&table)?;

    wait_for_merges(&table)?;
    assert!(metrics.merges.load(Ordering::Relaxed) > 0);

    assert_eq!(read_all(&table)?, before);
    let expected: i64 = before.iter().map(|row| row[1].unwrap_or(0)).sum();
    assert_eq!(table.sum(0, RECORDS - 1, 1)?, expected);
    Ok(())
}

#[test]
fn forced_merge_keeps_history_for_open_snapshots() -> Result<()> {
    let (_dir, _db, table, _metrics) = open(MergeCfg {
        enabled: false,
        ..MergeCfg::default()
    })?;
    for key in 0..500 {
        table.insert(&[key, 1, 2, 3])?;
    }
    let snapshot = table.snapshot();
    for round in 0..3 {
        for key in 0..500 {
            table.update(key, &[None, Some(round), None, None])?;
        }
    }
    assert_eq!(table.chain_len(10)?, 4);

    let stats = table.merge_now()?;
    assert!(!stats.is_empty());
    assert_eq!(table.chain_len(10)?, 0);

    for key in [0, 250, 499] {
        let now = table.select(key, 0, &ALL)?;
        assert_eq!(now[0].columns, vec![Some(key), Some(2), Some(2), Some(3)]);
        let then = table.select_as_of(key, 0, &ALL, snapshot.ts())?;
        assert_eq!(then[0].columns, vec![Some(key), Some(1), Some(2), Some(3)]);
    }
    assert_eq!(table.sum_as_of(0, 499, 1, snapshot.ts())?, 500);
    assert_eq!(table.sum(0, 499, 1)?, 1000);
    Ok(())
}

#[test]
fn writes_continue_during_background_merge() -> Result<()> {
    let (_dir, _db, table, _metrics) = open(MergeCfg {
        enabled: true,
        tail_threshold: 64,
        flush_after_merge: false,
    })?;
    for key in 0..RECORDS {
        table.insert(&[key, 0, 0, 0])?;
    }
    let writers: Vec<_> = (0..4)
        .map(|worker| {
            let table = table.clone();
            thread::spawn(move || -> Result<()> {
                let mut rng = ChaCha8Rng::seed_from_u64(worker);
                for _ in 0..2_000 {
                    let key = rng.gen_range(0..RECORDS / 4) * 4 + worker as i64;
                    table.increment(key, 1)?;
                }
                Ok(())
            })
        })
        .collect();
    for writer in writers {
        writer.join().expect("writer thread")?;
    }
    wait_for_merges(&table)?;
    assert_eq!(table.sum(0, RECORDS - 1, 1)?, 8_000);
    Ok(())
}

#[test]
fn background_merges_resume_after_forced_merges() -> Result<()> {
    let (_dir, _db, table, metrics) = open(MergeCfg {
        enabled: true,
        tail_threshold: 32,
        flush_after_merge: false,
    })?;
    for key in 0..1_000 {
        table.insert(&[key, 0, 0, 0])?;
    }
    let stop = Arc::new(AtomicBool::new(false));
    let forcer = {
        let table = table.clone();
        let stop = stop.clone();
        thread::spawn(move || -> Result<()> {
            while !stop.load(Ordering::Acquire) {
                table.merge_now()?;
            }
            Ok(())
        })
    };
    let mut rng = ChaCha8Rng::seed_from_u64(11);
    for _ in 0..4_000 {
        table.increment(rng.gen_range(0..1_000), 1)?;
    }
    stop.store(true, Ordering::Release);
    forcer.join().expect("merge thread")?;

    let before = metrics.merges.load(Ordering::Relaxed);
    for key in 0..256 {
        table.increment(key, 2)?;
    }
    let deadline = Instant::now() + Duration::from_secs(10);
    while metrics.merges.load(Ordering::Relaxed) == before {
        assert!(Instant::now() < deadline, "no background merge after forced merges");
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(table.sum(0, 999, 1)?, 4_000);
    assert_eq!(table.sum(0, 999, 2)?, 256);
    Ok(())
}
