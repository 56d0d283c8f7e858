//! Heap file churn: fill, punch holes, refill, and verify the free-page
//! list recycles space before the file grows.

use std::sync::Arc;

use rmdb::{BufferPool, DiskManager, HeapFile, Rid, NO_PAGE};
use tempfile::tempdir;

fn open_heap(record_size: usize) -> (tempfile::TempDir, HeapFile) {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempdir().unwrap();
    let path = dir.path().join("churn.tbl");
    let disk = Arc::new(DiskManager::new());
    let pool = Arc::new(BufferPool::new(Arc::clone(&disk), 128).unwrap());
    HeapFile::create(&disk, &path, record_size).unwrap();
    let heap = HeapFile::open(disk, pool, &path).unwrap();
    (dir, heap)
}

fn scan_rids(heap: &HeapFile) -> Vec<Rid> {
    let mut scan = heap.scan().unwrap();
    let mut rids = Vec::new();
    while !scan.is_end() {
        rids.push(scan.rid());
        scan.next().unwrap();
    }
    rids
}

#[test]
fn churn_recycles_freed_pages_before_growing() {
    let (_dir, heap) = open_heap(8);

    // Insert 1000 records whose payload is their ordinal.
    let mut rids = Vec::new();
    for ordinal in 0..1000u64 {
        rids.push(heap.insert(None, &ordinal.to_le_bytes()).unwrap());
    }
    assert!(
        heap.num_pages() > 2,
        "1000 records should span several pages"
    );

    // Scan sees all 1000, in rid order, with the right payloads.
    let scanned = scan_rids(&heap);
    assert_eq!(scanned, rids);
    for (ordinal, rid) in rids.iter().enumerate() {
        assert_eq!(
            heap.get(None, *rid).unwrap(),
            (ordinal as u64).to_le_bytes()
        );
    }

    // Delete every even ordinal.
    for rid in rids.iter().step_by(2) {
        heap.delete(None, *rid).unwrap();
    }
    let odd_rids: Vec<Rid> = rids.iter().skip(1).step_by(2).copied().collect();
    assert_eq!(scan_rids(&heap), odd_rids);
    assert_ne!(heap.first_free_page_no(), NO_PAGE);

    // Reinserting 500 records reuses freed slots; the file must not grow.
    let pages_before = heap.num_pages();
    for ordinal in 1000..1500u64 {
        let rid = heap.insert(None, &ordinal.to_le_bytes()).unwrap();
        assert!(
            rid.page_no < pages_before,
            "insert landed on fresh page {} instead of a freed one",
            rid.page_no
        );
    }
    assert_eq!(heap.num_pages(), pages_before);
    assert_eq!(scan_rids(&heap).len(), 1000);
}

#[test]
fn interleaved_delete_and_insert_keeps_scan_consistent() {
    let (_dir, heap) = open_heap(16);

    let mut live = std::collections::BTreeMap::new();
    for i in 0..400u64 {
        let mut buf = [0u8; 16];
        buf[..8].copy_from_slice(&i.to_le_bytes());
        let rid = heap.insert(None, &buf).unwrap();
        live.insert(rid, buf.to_vec());

        // Every third step, delete the oldest surviving record.
        if i % 3 == 2 {
            let (&victim, _) = live.iter().next().unwrap();
            heap.delete(None, victim).unwrap();
            live.remove(&victim);
        }
    }

    let scanned = scan_rids(&heap);
    let expected: Vec<Rid> = live.keys().copied().collect();
    assert_eq!(scanned, expected);
    for (rid, payload) in &live {
        assert_eq!(heap.get(None, *rid).unwrap(), *payload);
    }
}
