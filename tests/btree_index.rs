//! B+ tree scenarios: a large ascending load, then heavy random
//! deletion, with structural validation after each phase.

use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rmdb::{BufferPool, ColType, DiskManager, IndexCol, IndexHandle, Rid};
use tempfile::tempdir;

const N: i32 = 10_000;

fn key(v: i32) -> [u8; 4] {
    v.to_le_bytes()
}

fn open_index() -> (tempfile::TempDir, IndexHandle) {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempdir().unwrap();
    let path = dir.path().join("keys.idx");
    let disk = Arc::new(DiskManager::new());
    let pool = Arc::new(BufferPool::new(Arc::clone(&disk), 512).unwrap());
    IndexHandle::create(
        &disk,
        &path,
        &[IndexCol {
            col_type: ColType::Int,
            len: 4,
        }],
    )
    .unwrap();
    let index = IndexHandle::open(disk, pool, &path).unwrap();
    (dir, index)
}

fn load_ascending(index: &IndexHandle) {
    for k in 1..=N {
        assert!(
            index.insert(&key(k), Rid::new(k, 0)).unwrap(),
            "insert {k} failed"
        );
        assert_eq!(
            index.get(&key(k)).unwrap(),
            Some(Rid::new(k, 0)),
            "key {k} unreadable right after insert"
        );
        // Spot-check that earlier keys survive the structural churn.
        if k % 1000 == 0 {
            for probe in (1..=k).step_by(97) {
                assert_eq!(
                    index.get(&key(probe)).unwrap(),
                    Some(Rid::new(probe, 0)),
                    "key {probe} lost after inserting {k}"
                );
            }
        }
    }
}

#[test]
fn ascending_insert_keeps_everything_reachable_and_ordered() {
    let (_dir, index) = open_index();
    load_ascending(&index);
    index.validate().unwrap();

    // Iterating from lower_bound(0) yields all N entries in order.
    let mut scan = index.range_scan(Some(&key(0)), None).unwrap();
    let mut expected = 1;
    while !scan.is_end() {
        assert_eq!(scan.key().unwrap(), key(expected));
        assert_eq!(scan.rid().unwrap(), Rid::new(expected, 0));
        scan.next().unwrap();
        expected += 1;
    }
    assert_eq!(expected, N + 1);
}

#[test]
fn random_delete_keeps_survivors_balanced_and_chained() {
    let (_dir, index) = open_index();
    load_ascending(&index);

    let mut keys: Vec<i32> = (1..=N).collect();
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
    keys.shuffle(&mut rng);
    let (deleted, survivors) = keys.split_at(N as usize / 2);

    for &k in deleted {
        assert!(index.delete(&key(k)).unwrap(), "delete {k} failed");
        assert_eq!(index.get(&key(k)).unwrap(), None);
    }

    index.validate().unwrap();

    for &k in survivors {
        assert_eq!(
            index.get(&key(k)).unwrap(),
            Some(Rid::new(k, 0)),
            "survivor {k} lost"
        );
    }

    // The leaf chain visits exactly the survivors, ascending.
    let mut in_order: Vec<i32> = survivors.to_vec();
    in_order.sort_unstable();
    let mut scan = index.scan().unwrap();
    let mut seen = Vec::new();
    while !scan.is_end() {
        seen.push(i32::from_le_bytes(scan.key().unwrap().try_into().unwrap()));
        scan.next().unwrap();
    }
    assert_eq!(seen, in_order);
}

#[test]
fn composite_string_keys_order_lexicographically() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempdir().unwrap();
    let path = dir.path().join("names.idx");
    let disk = Arc::new(DiskManager::new());
    let pool = Arc::new(BufferPool::new(Arc::clone(&disk), 256).unwrap());
    IndexHandle::create(
        &disk,
        &path,
        &[
            IndexCol {
                col_type: ColType::String,
                len: 8,
            },
            IndexCol {
                col_type: ColType::Int,
                len: 4,
            },
        ],
    )
    .unwrap();
    let index = IndexHandle::open(disk, pool, &path).unwrap();

    let composite = |name: &str, n: i32| -> Vec<u8> {
        let mut k = vec![0u8; 12];
        k[..name.len()].copy_from_slice(name.as_bytes());
        k[8..].copy_from_slice(&n.to_le_bytes());
        k
    };

    let mut expected = Vec::new();
    for name in ["delta", "alpha", "charlie", "bravo"] {
        for n in 0..50 {
            let k = composite(name, n);
            index.insert(&k, Rid::new(n, 0)).unwrap();
            expected.push(k);
        }
    }
    expected.sort();

    index.validate().unwrap();
    let mut scan = index.scan().unwrap();
    let mut seen = Vec::new();
    while !scan.is_end() {
        seen.push(scan.key().unwrap());
        scan.next().unwrap();
    }
    assert_eq!(seen, expected);
}
