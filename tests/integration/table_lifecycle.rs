//! Record lifecycle through the public table API: insert, select, update,
//! delete and sum, checked against a plain in-memory model.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::{Arc, Once};

use lstore::{Database, EngineOptions, LStoreError, MergeCfg, Result, Table};
use proptest::prelude::*;
use tempfile::{tempdir, TempDir};
use tracing_subscriber::EnvFilter;

const ALL: [bool; 3] = [true, true, true];

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

fn open(merge: bool) -> Result<(TempDir, Database, Arc<Table>)> {
    init_tracing();
    let dir = tempdir()?;
    let options = EngineOptions::default()
        .page_size(512)
        .records_per_range(128)
        .merge(MergeCfg {
            enabled: merge,
            tail_threshold: 16,
            flush_after_merge: false,
        });
    let db = Database::open(dir.path(), options)?;
    let table = db.create_table("grades", 3, 0)?;
    Ok((dir, db, table))
}

fn row(table: &Table, key: i64) -> Result<Vec<Option<i64>>> {
    let mut rows = table.select(key, 0, &ALL)?;
    assert_eq!(rows.len(), 1);
    Ok(rows.remove(0).columns)
}

#[test]
fn update_then_delete_key_five() -> Result<()> {
    let (_dir, _db, table) = open(false)?;
    table.insert(&[5, 10, 20])?;
    table.insert(&[6, 1, 1])?;
    table.update(5, &[None, None, Some(99)])?;
    assert_eq!(row(&table, 5)?, vec![Some(5), Some(10), Some(99)]);
    assert_eq!(table.sum(0, 10, 2)?, 100);

    table.delete(5)?;
    assert!(matches!(
        table.select(5, 0, &ALL),
        Err(LStoreError::NotFound)
    ));
    assert!(matches!(table.update(5, &[None, Some(1), None]), Err(LStoreError::NotFound)));
    assert!(matches!(table.delete(5), Err(LStoreError::NotFound)));
    assert_eq!(table.sum(0, 10, 2)?, 1);
    assert_eq!(table.len(), 1);
    Ok(())
}

#[test]
fn projection_hides_columns() -> Result<()> {
    let (_dir, _db, table) = open(false)?;
    table.insert(&[1, 2, 3])?;
    let rows = table.select(1, 0, &[false, true, false])?;
    assert_eq!(rows[0].columns, vec![None, Some(2), None]);
    assert_eq!(rows[0].key, 1);
    Ok(())
}

#[test]
fn sum_accepts_either_bound_order() -> Result<()> {
    let (_dir, _db, table) = open(false)?;
    for key in [1, 3, 5, 7] {
        table.insert(&[key, key * 2, 0])?;
    }
    assert_eq!(table.sum(2, 6, 1)?, 16);
    assert_eq!(table.sum(6, 2, 1)?, 16);
    assert_eq!(table.sum(8, 100, 1)?, 0);
    assert_eq!(table.sum(i64::MIN, i64::MAX, 1)?, 32);
    Ok(())
}

#[test]
fn primary_key_can_move() -> Result<()> {
    let (_dir, _db, table) = open(false)?;
    table.insert(&[1, 10, 100])?;
    table.insert(&[2, 20, 200])?;
    assert!(matches!(
        table.update(1, &[Some(2), None, None]),
        Err(LStoreError::DuplicateKey(2))
    ));
    assert_eq!(row(&table, 1)?, vec![Some(1), Some(10), Some(100)]);

    table.update(1, &[Some(3), None, None])?;
    assert!(matches!(table.select(1, 0, &ALL), Err(LStoreError::NotFound)));
    assert_eq!(row(&table, 3)?, vec![Some(3), Some(10), Some(100)]);

    table.insert(&[1, 11, 111])?;
    assert_eq!(row(&table, 1)?, vec![Some(1), Some(11), Some(111)]);
    Ok(())
}

#[test]
fn secondary_index_tracks_writes() -> Result<()> {
    let (_dir, _db, table) = open(false)?;
    for key in 0..10 {
        table.insert(&[key, key % 3, 0])?;
    }
    assert!(table.create_index(1)?);
    assert!(!table.create_index(1)?);

    let keys = |value: i64| -> Result<Vec<i64>> {
        let mut keys: Vec<i64> = table
            .select(value, 1, &ALL)?
            .into_iter()
            .map(|record| record.key)
            .collect();
        keys.sort_unstable();
        Ok(keys)
    };
    assert_eq!(keys(0)?, vec![0, 3, 6, 9]);

    table.update(3, &[None, Some(2), None])?;
    table.delete(6)?;
    assert_eq!(keys(0)?, vec![0, 9]);
    assert_eq!(keys(2)?, vec![2, 3, 5, 8]);

    assert!(table.drop_index(1)?);
    assert_eq!(keys(0)?, vec![0, 9]);
    assert!(matches!(table.select(42, 1, &ALL), Err(LStoreError::NotFound)));
    Ok(())
}

#[test]
fn deleted_record_visible_to_older_snapshot() -> Result<()> {
    let (_dir, _db, table) = open(false)?;
    table.insert(&[9, 1, 2])?;
    let before = table.snapshot();
    table.delete(9)?;
    let old = table.select_as_of(9, 0, &ALL, before.ts())?;
    assert_eq!(old[0].columns, vec![Some(9), Some(1), Some(2)]);
    assert_eq!(table.sum_as_of(0, 10, 1, before.ts())?, 1);
    assert_eq!(table.sum(0, 10, 1)?, 0);
    Ok(())
}

#[test]
fn schema_is_enforced() -> Result<()> {
    let (_dir, _db, table) = open(false)?;
    assert!(matches!(
        table.insert(&[1, 2]),
        Err(LStoreError::SchemaViolation(_))
    ));
    table.insert(&[1, 2, 3])?;
    assert!(matches!(
        table.update(1, &[None, None, None, Some(4)]),
        Err(LStoreError::SchemaViolation(_))
    ));
    assert!(matches!(
        table.sum(0, 1, 3),
        Err(LStoreError::SchemaViolation(_))
    ));
    assert!(matches!(
        table.increment(1, 7),
        Err(LStoreError::SchemaViolation(_))
    ));
    assert!(!table.is_empty());
    Ok(())
}

#[derive(Clone, Debug)]
enum Op {
    Insert(i64, i64, i64),
    Update(i64, usize, i64),
    Increment(i64, usize),
    Delete(i64),
    Merge,
}

fn arb_op() -> impl Strategy<Value = Op> {
    let key = 0i64..24;
    prop_oneof![
        4 => (key.clone(), -50i64..50, -50i64..50).prop_map(|(k, a, b)| Op::Insert(k, a, b)),
        4 => (key.clone(), 1usize..3, -50i64..50).prop_map(|(k, c, v)| Op::Update(k, c, v)),
        2 => (key.clone(), 1usize..3).prop_map(|(k, c)| Op::Increment(k, c)),
        2 => key.prop_map(Op::Delete),
        1 => Just(Op::Merge),
    ]
}

fn apply(table: &Table, model: &mut BTreeMap<i64, [i64; 3]>, op: &Op) -> Result<()> {
    match *op {
        Op::Insert(key, a, b) => match table.insert(&[key, a, b]) {
            Ok(_) => {
                assert!(model.insert(key, [key, a, b]).is_none());
            }
            Err(LStoreError::DuplicateKey(dup)) => {
                assert_eq!(dup, key);
                assert!(model.contains_key(&key));
            }
            Err(err) => return Err(err),
        },
        Op::Update(key, column, value) => {
            let mut values = [None; 3];
            values[column] = Some(value);
            match table.update(key, &values) {
                Ok(()) => model.get_mut(&key).expect("model row")[column] = value,
                Err(LStoreError::NotFound) => assert!(!model.contains_key(&key)),
                Err(err) => return Err(err),
            }
        }
        Op::Increment(key, column) => match table.increment(key, column) {
            Ok(()) => model.get_mut(&key).expect("model row")[column] += 1,
            Err(LStoreError::NotFound) => assert!(!model.contains_key(&key)),
            Err(err) => return Err(err),
        },
        Op::Delete(key) => match table.delete(key) {
            Ok(()) => {
                assert!(model.remove(&key).is_some());
            }
            Err(LStoreError::NotFound) => assert!(!model.contains_key(&key)),
            Err(err) => return Err(err),
        },
        Op::Merge => {
            table.merge_now()?;
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn table_matches_model(ops in prop::collection::vec(arb_op(), 1..120)) {
        let (_dir, _db, table) = open(true).unwrap();
        let mut model = BTreeMap::new();
        for op in &ops {
            apply(&table, &mut model, op).unwrap();
        }
        for key in 0..24 {
            match (table.select(key, 0, &ALL), model.get(&key)) {
                (Ok(rows), Some(expected)) => {
                    let expected: Vec<Option<i64>> = expected.iter().copied().map(Some).collect();
                    prop_assert_eq!(&rows[0].columns, &expected);
                }
                (Err(LStoreError::NotFound), None) => {}
                (other, expected) => prop_assert!(false, "key {}: {:?} vs {:?}", key, other, expected),
            }
        }
        let expected: i64 = model.values().map(|row| row[1]).sum();
        prop_assert_eq!(table.sum(0, 23, 1).unwrap(), expected);
        prop_assert_eq!(table.len(), model.len());
    }
}
