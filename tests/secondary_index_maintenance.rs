//! Index/heap coherence through the table layer: every DML path must
//! keep each secondary index in exact correspondence with the heap.

use std::collections::BTreeSet;
use std::sync::Arc;

use rmdb::{BufferPool, Catalog, ColType, DiskManager, Rid, Table, Value};
use tempfile::tempdir;

fn setup() -> (tempfile::TempDir, Catalog) {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("db");
    Catalog::create_database(&db_path).unwrap();
    let disk = Arc::new(DiskManager::new());
    let pool = Arc::new(BufferPool::new(Arc::clone(&disk), 512).unwrap());
    let catalog = Catalog::open(disk, pool, &db_path).unwrap();
    (dir, catalog)
}

fn row(id: i32, score: f32) -> Vec<Value> {
    vec![Value::Int(id), Value::Float(score)]
}

fn heap_rids(table: &Table) -> BTreeSet<Rid> {
    let mut scan = table.scan(None).unwrap();
    let mut rids = BTreeSet::new();
    while !scan.is_end() {
        rids.insert(scan.rid());
        scan.next().unwrap();
    }
    rids
}

/// For every heap row, the index maps its key to exactly that rid, and
/// the index holds nothing else.
fn assert_coherent(table: &Table) {
    let rids = heap_rids(table);
    table
        .with_index(&["id"], |index| {
            index.handle().validate()?;
            for &rid in &rids {
                let values = table.get_values(None, rid)?;
                let id = match values[0] {
                    Value::Int(id) => id,
                    _ => unreachable!("id column is Int"),
                };
                assert_eq!(
                    index.handle().get(&id.to_le_bytes())?,
                    Some(rid),
                    "index missing or misdirected for id {id}"
                );
            }
            let mut scan = index.handle().scan()?;
            let mut indexed = BTreeSet::new();
            while !scan.is_end() {
                indexed.insert(scan.rid()?);
                scan.next()?;
            }
            assert_eq!(indexed, rids, "index entries disagree with heap");
            Ok(())
        })
        .unwrap();
}

#[test]
fn dml_keeps_index_and_heap_in_step() {
    let (_dir, catalog) = setup();
    let table = catalog
        .create_table(
            "scores",
            &[("id", ColType::Int, 4), ("score", ColType::Float, 4)],
        )
        .unwrap();
    catalog.create_index("scores", &["id"]).unwrap();

    let mut rids = Vec::new();
    for i in 0..500 {
        rids.push(table.insert(None, &row(i, i as f32)).unwrap());
    }
    assert_coherent(&table);

    // Delete a third of the rows.
    for rid in rids.iter().step_by(3) {
        table.delete(None, *rid).unwrap();
    }
    assert_coherent(&table);

    // Update survivors to new ids (key changes move index entries).
    let survivors: Vec<Rid> = heap_rids(&table).into_iter().collect();
    for (n, rid) in survivors.iter().enumerate() {
        table
            .update(None, *rid, &row(10_000 + n as i32, 0.5))
            .unwrap();
    }
    assert_coherent(&table);
}

#[test]
fn backfilled_index_matches_preexisting_rows() {
    let (_dir, catalog) = setup();
    let table = catalog
        .create_table(
            "scores",
            &[("id", ColType::Int, 4), ("score", ColType::Float, 4)],
        )
        .unwrap();

    for i in 0..300 {
        table.insert(None, &row(i, 1.0)).unwrap();
    }
    // Index created after the fact must see every existing row.
    catalog.create_index("scores", &["id"]).unwrap();
    assert_coherent(&table);
}

#[test]
fn index_range_scan_returns_matching_rids() {
    let (_dir, catalog) = setup();
    let table = catalog
        .create_table(
            "scores",
            &[("id", ColType::Int, 4), ("score", ColType::Float, 4)],
        )
        .unwrap();
    catalog.create_index("scores", &["id"]).unwrap();

    for i in 0..200 {
        table.insert(None, &row(i, 0.0)).unwrap();
    }

    let (_handle, rids) = table
        .index_scan(
            None,
            &["id"],
            Some(&50i32.to_le_bytes()),
            Some(&60i32.to_le_bytes()),
        )
        .unwrap();
    let ids: Vec<i32> = rids
        .iter()
        .map(|&rid| match table.get_values(None, rid).unwrap()[0] {
            Value::Int(id) => id,
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(ids, (50..60).collect::<Vec<i32>>());
}
