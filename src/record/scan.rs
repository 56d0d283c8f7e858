//! Forward-only cursor over the occupied slots of a heap file.
//!
//! The cursor holds a position, not a page pin: each `next` pins a page
//! just long enough to probe its bitmap, so a long-lived scan never
//! starves the buffer pool. Row-level locking is the reader's business
//! (`HeapFile::get` takes the shared lock); the scan itself only reports
//! positions.

use super::heap_file::{HeapFile, FIRST_RECORD_PAGE};
use crate::errors::Result;
use crate::types::Rid;

pub struct HeapScan<'a> {
    file: &'a HeapFile,
    rid: Rid,
}

impl<'a> HeapScan<'a> {
    /// Positions the cursor on the first occupied slot (or the end).
    pub(crate) fn new(file: &'a HeapFile) -> Result<Self> {
        let mut scan = Self {
            file,
            rid: Rid::new(FIRST_RECORD_PAGE, -1),
        };
        scan.next()?;
        Ok(scan)
    }

    /// Advances to the next occupied slot in `(page_no, slot_no)` order.
    pub fn next(&mut self) -> Result<()> {
        let mut page_no = self.rid.page_no;
        let mut slot_no = self.rid.slot_no;
        while page_no >= FIRST_RECORD_PAGE && page_no < self.file.num_pages() {
            if let Some(next) = self.file.next_occupied_slot(page_no, slot_no)? {
                self.rid = Rid::new(page_no, next);
                return Ok(());
            }
            page_no += 1;
            slot_no = -1;
        }
        self.rid = Rid::invalid();
        Ok(())
    }

    pub fn is_end(&self) -> bool {
        !self.rid.is_valid()
    }

    pub fn rid(&self) -> Rid {
        self.rid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BufferPool, DiskManager};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn open_heap(record_size: usize) -> (tempfile::TempDir, HeapFile) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.tbl");
        let disk = Arc::new(DiskManager::new());
        let pool = Arc::new(BufferPool::new(Arc::clone(&disk), 64).unwrap());
        HeapFile::create(&disk, &path, record_size).unwrap();
        let heap = HeapFile::open(disk, pool, &path).unwrap();
        (dir, heap)
    }

    fn collect(heap: &HeapFile) -> Vec<Rid> {
        let mut scan = heap.scan().unwrap();
        let mut rids = Vec::new();
        while !scan.is_end() {
            rids.push(scan.rid());
            scan.next().unwrap();
        }
        rids
    }

    #[test]
    fn empty_file_scans_nothing() {
        let (_dir, heap) = open_heap(8);
        assert!(collect(&heap).is_empty());
    }

    #[test]
    fn scan_visits_every_record_in_order() {
        let (_dir, heap) = open_heap(64);
        let mut inserted = Vec::new();
        // Enough records to spill over several pages.
        for i in 0..200u64 {
            let mut buf = [0u8; 64];
            buf[..8].copy_from_slice(&i.to_le_bytes());
            inserted.push(heap.insert(None, &buf).unwrap());
        }
        let scanned = collect(&heap);
        assert_eq!(scanned, inserted);
        assert!(scanned.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn scan_skips_deleted_slots() {
        let (_dir, heap) = open_heap(8);
        let mut rids = Vec::new();
        for i in 0..50u64 {
            rids.push(heap.insert(None, &i.to_le_bytes()).unwrap());
        }
        for rid in rids.iter().step_by(2) {
            heap.delete(None, *rid).unwrap();
        }
        let survivors: Vec<Rid> = rids.iter().skip(1).step_by(2).copied().collect();
        assert_eq!(collect(&heap), survivors);
    }
}
