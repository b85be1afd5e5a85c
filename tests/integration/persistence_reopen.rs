//! Closing and reopening a database directory.

#![allow(missing_docs)]

use std::fs;
use std::path::Path;
use std::sync::Once;

use lstore::{Database, EngineOptions, LStoreError, MergeCfg, Result};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;
use tracing_subscriber::EnvFilter;

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

fn options() -> EngineOptions {
    EngineOptions::default()
        .page_size(1024)
        .records_per_range(300)
        .cache_pages(64)
        .merge(MergeCfg {
            enabled: true,
            tail_threshold: 100,
            flush_after_merge: false,
        })
}

fn columns(db: &Database, table: &str, key: i64) -> Result<Vec<Option<i64>>> {
    let mut rows = db.get_table(table)?.select(key, 0, &ALL)?;
    Ok(rows.remove(0).columns)
}

#[test]
fn reopen_round_trip() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let mut expected: Vec<Option<[i64; 4]>> = Vec::new();
    {
        let db = Database::open(dir.path(), options())?;
        let grades = db.create_table("grades", 4, 0)?;
        for key in 0..1_000 {
            let row = [key, rng.gen_range(0..100), rng.gen_range(0..100), 0];
            grades.insert(&row)?;
            expected.push(Some(row));
        }
        for _ in 0..2_000 {
            let key = rng.gen_range(0..1_000i64);
            let Some(row) = expected[key as usize].as_mut() else {
                continue;
            };
            let column = rng.gen_range(1..4);
            let value = rng.gen_range(-500..500);
            let mut values = [None; 4];
            values[column] = Some(value);
            grades.update(key, &values)?;
            row[column] = value;
        }
        for key in (0..1_000).step_by(7) {
            grades.delete(key)?;
            expected[key as usize] = None;
        }
        grades.create_index(3)?;
        db.close()?;
    }

    let db = Database::open(dir.path(), options())?;
    assert_eq!(db.table_names(), vec!["grades".to_string()]);
    let grades = db.get_table("grades")?;
    assert_eq!(grades.len(), expected.iter().flatten().count());
    for (key, row) in expected.iter().enumerate() {
        let key = key as i64;
        match row {
            Some(row) => {
                let want: Vec<Option<i64>> = row.iter().copied().map(Some).collect();
                assert_eq!(columns(&db, "grades", key)?, want);
                assert_eq!(grades.chain_len(key)?, 0);
            }
            None => assert!(matches!(
                grades.select(key, 0, &ALL),
                Err(LStoreError::NotFound)
            )),
        }
    }
    let total: i64 = expected.iter().flatten().map(|row| row[2]).sum();
    assert_eq!(grades.sum(0, 999, 2)?, total);

    let zeros = expected.iter().flatten().filter(|row| row[3] == 0).count();
    if zeros > 0 {
        assert_eq!(grades.select(0, 3, &ALL)?.len(), zeros);
    }
    Ok(())
}

#[test]
fn reopened_table_accepts_new_writes() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    {
        let db = Database::open(dir.path(), options())?;
        let t = db.create_table("t", 4, 0)?;
        for key in 0..50 {
            t.insert(&[key, 1, 1, 1])?;
        }
        t.update(3, &[Some(300), None, None, None])?;
    }

    let last_ts;
    {
        let db = Database::open(dir.path(), options())?;
        let t = db.get_table("t")?;
        assert!(matches!(
            t.insert(&[300, 0, 0, 0]),
            Err(LStoreError::DuplicateKey(300))
        ));
        t.insert(&[3, 9, 9, 9])?;
        t.increment(300, 1)?;
        last_ts = db.now();
        db.close()?;
    }

    let db = Database::open(dir.path(), options())?;
    assert!(db.now() >= last_ts);
    assert_eq!(columns(&db, "t", 3)?, vec![Some(3), Some(9), Some(9), Some(9)]);
    assert_eq!(columns(&db, "t", 300)?, vec![Some(300), Some(2), Some(1), Some(1)]);
    assert_eq!(db.get_table("t")?.len(), 51);
    Ok(())
}

#[test]
fn dropped_table_stays_dropped() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    {
        let db = Database::open(dir.path(), options())?;
        db.create_table("keep", 4, 0)?.insert(&[1, 2, 3, 4])?;
        db.create_table("gone", 4, 0)?.insert(&[1, 2, 3, 4])?;
        db.close()?;
    }
    {
        let db = Database::open(dir.path(), options())?;
        db.drop_table("gone")?;
        assert!(matches!(db.drop_table("gone"), Err(LStoreError::NotFound)));
        db.close()?;
    }
    let db = Database::open(dir.path(), options())?;
    assert_eq!(db.table_names(), vec!["keep".to_string()]);
    assert!(!dir.path().join("gone").exists());
    assert_eq!(columns(&db, "keep", 1)?, vec![Some(1), Some(2), Some(3), Some(4)]);
    Ok(())
}

#[test]
fn page_size_must_match() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    {
        let db = Database::open(dir.path(), options())?;
        db.create_table("t", 4, 0)?.insert(&[1, 1, 1, 1])?;
        db.close()?;
    }
    let db = Database::open(dir.path(), options().page_size(2048))?;
    assert!(matches!(db.get_table("t"), Err(LStoreError::Invalid(_))));
    Ok(())
}

#[test]
fn options_load_from_toml() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = dir.path().join("lstore.toml");
    write_file(
        &path,
        "page_size = 1024\nlock_timeout_ms = 5\n\n[merge]\nenabled = false\ntail_threshold = 10\n",
    )?;
    let loaded = EngineOptions::load(&path)?;
    assert_eq!(loaded.page_size, 1024);
    assert_eq!(loaded.lock_timeout_ms, 5);
    assert!(!loaded.merge.enabled);
    assert_eq!(loaded.merge.tail_threshold, 10);

    write_file(&path, "page_sise = 1024\n")?;
    assert!(matches!(
        EngineOptions::load(&path),
        Err(LStoreError::Config(_))
    ));
    Ok(())
}

fn write_file(path: &Path, text: &str) -> Result<()> {
    fs::write(path, text)?;
    Ok(())
}
