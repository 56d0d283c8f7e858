//! # Heap File
//!
//! One heap file per table: fixed-size records in slotted pages behind a
//! free-page list. See the module docs for the on-disk layout.
//!
//! ## Free-Page Policy
//!
//! `insert` takes the head of the free list when one exists, otherwise it
//! allocates a new page and links it in. An insert that fills a page
//! unlinks the page (the header's `first_free_page_no` advances to the
//! page's `next_free_page_no`); a delete that frees a slot on a
//! previously full page prepends the page back onto the list. Partially
//! full pages stay linked across inserts.
//!
//! ## Header Ownership
//!
//! The in-memory copy of the mutable header fields (`first_free_page_no`,
//! `num_pages`) is authoritative while the file is open and is written
//! back to page 0 on `flush`/`close`.

use std::path::Path;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use zerocopy::little_endian::I32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::bitmap::Bitmap;
use super::scan::HeapScan;
use crate::errors::{DbError, Result};
use crate::storage::{
    parse_header, parse_header_mut, BufferPool, DiskManager, FileId, PageGuard, PAGE_SIZE,
};
use crate::txn::Context;
use crate::types::{Rid, NO_PAGE};

/// First data page; page 0 is the file header.
pub const FIRST_RECORD_PAGE: i32 = 1;

const HEAP_PAGE_HEADER_SIZE: usize = std::mem::size_of::<HeapPageHeader>();

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct HeapFileHeader {
    record_size: I32,
    records_per_page: I32,
    bitmap_size: I32,
    first_free_page_no: I32,
    num_pages: I32,
}

const _: () = assert!(std::mem::size_of::<HeapFileHeader>() == 20);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct HeapPageHeader {
    num_records: I32,
    next_free_page_no: I32,
}

const _: () = assert!(std::mem::size_of::<HeapPageHeader>() == 8);

impl HeapPageHeader {
    fn num_records(&self) -> i32 {
        self.num_records.get()
    }

    fn set_num_records(&mut self, n: i32) {
        self.num_records = I32::new(n);
    }

    fn next_free_page_no(&self) -> i32 {
        self.next_free_page_no.get()
    }

    fn set_next_free_page_no(&mut self, page_no: i32) {
        self.next_free_page_no = I32::new(page_no);
    }
}

/// Mutable portion of the file header, authoritative in memory.
struct HeapState {
    first_free_page_no: i32,
    num_pages: i32,
}

pub struct HeapFile {
    fd: FileId,
    name: String,
    record_size: usize,
    records_per_page: usize,
    bitmap_size: usize,
    disk: Arc<DiskManager>,
    pool: Arc<BufferPool>,
    state: Mutex<HeapState>,
}

impl HeapFile {
    /// Creates a new heap file for records of `record_size` bytes.
    pub fn create<P: AsRef<Path>>(disk: &DiskManager, path: P, record_size: usize) -> Result<()> {
        let (records_per_page, bitmap_size) = page_geometry(record_size)?;

        disk.create_file(&path)?;
        let fd = disk.open_file(&path)?;
        let hdr = HeapFileHeader {
            record_size: I32::new(record_size as i32),
            records_per_page: I32::new(records_per_page as i32),
            bitmap_size: I32::new(bitmap_size as i32),
            first_free_page_no: I32::new(NO_PAGE),
            num_pages: I32::new(1),
        };
        let mut page = [0u8; PAGE_SIZE];
        page[..std::mem::size_of::<HeapFileHeader>()].copy_from_slice(hdr.as_bytes());
        let header_page = disk.allocate_page_no(fd)?;
        disk.write_page(fd, header_page, &page)?;
        disk.close_file(fd)?;
        debug!(
            "created heap file '{}' (record_size={record_size}, records_per_page={records_per_page})",
            path.as_ref().display()
        );
        Ok(())
    }

    /// Opens an existing heap file.
    pub fn open<P: AsRef<Path>>(
        disk: Arc<DiskManager>,
        pool: Arc<BufferPool>,
        path: P,
    ) -> Result<HeapFile> {
        let fd = disk.open_file(&path)?;
        let mut page = [0u8; PAGE_SIZE];
        disk.read_page(fd, 0, &mut page)?;
        let hdr =
            HeapFileHeader::read_from_bytes(&page[..std::mem::size_of::<HeapFileHeader>()])
                .map_err(|e| DbError::internal(format!("bad heap file header: {e:?}")))?;
        if hdr.record_size.get() <= 0 || hdr.records_per_page.get() <= 0 {
            return Err(DbError::internal(format!(
                "'{}' is not a heap file",
                path.as_ref().display()
            )));
        }
        // The header's page count is authoritative; realign the allocator.
        disk.set_page_count(fd, hdr.num_pages.get())?;
        Ok(HeapFile {
            fd,
            name: path.as_ref().display().to_string(),
            record_size: hdr.record_size.get() as usize,
            records_per_page: hdr.records_per_page.get() as usize,
            bitmap_size: hdr.bitmap_size.get() as usize,
            disk,
            pool,
            state: Mutex::new(HeapState {
                first_free_page_no: hdr.first_free_page_no.get(),
                num_pages: hdr.num_pages.get(),
            }),
        })
    }

    /// Removes the file from disk. It must be closed.
    pub fn destroy<P: AsRef<Path>>(disk: &DiskManager, path: P) -> Result<()> {
        disk.destroy_file(path)
    }

    /// Writes the header and every dirty page back to disk.
    pub fn flush(&self) -> Result<()> {
        let state = self.state.lock();
        let hdr = HeapFileHeader {
            record_size: I32::new(self.record_size as i32),
            records_per_page: I32::new(self.records_per_page as i32),
            bitmap_size: I32::new(self.bitmap_size as i32),
            first_free_page_no: I32::new(state.first_free_page_no),
            num_pages: I32::new(state.num_pages),
        };
        let mut page = [0u8; PAGE_SIZE];
        page[..std::mem::size_of::<HeapFileHeader>()].copy_from_slice(hdr.as_bytes());
        self.disk.write_page(self.fd, 0, &page)?;
        self.pool.flush_file(self.fd)?;
        Ok(())
    }

    /// Flushes and closes the file. Further operations on this handle
    /// fail with an unknown-descriptor error.
    pub fn close(&self) -> Result<()> {
        self.flush()?;
        self.pool.evict_file_pages(self.fd)?;
        self.disk.close_file(self.fd)
    }

    pub fn fd(&self) -> FileId {
        self.fd
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    pub fn records_per_page(&self) -> usize {
        self.records_per_page
    }

    pub fn first_free_page_no(&self) -> i32 {
        self.state.lock().first_free_page_no
    }

    pub fn num_pages(&self) -> i32 {
        self.state.lock().num_pages
    }

    /// Inserts a record into the first free slot, extending the file when
    /// no page has room. Acquires an exclusive row lock on the chosen rid
    /// when a context is present.
    pub fn insert(&self, ctx: Option<&Context>, buf: &[u8]) -> Result<Rid> {
        if buf.len() != self.record_size {
            return Err(DbError::internal(format!(
                "record length {} does not match record size {} of '{}'",
                buf.len(),
                self.record_size,
                self.name
            )));
        }

        let mut state = self.state.lock();
        let (page_no, mut guard) = self.free_page_handle(&mut state)?;

        let slot_no = {
            let (_, bitmap, _) = self.page_parts(guard.data())?;
            Bitmap::first_bit(false, bitmap, self.records_per_page)
        };
        debug_assert!(slot_no < self.records_per_page);
        let rid = Rid::new(page_no, slot_no as i32);

        if let Some(ctx) = ctx {
            ctx.lock_exclusive_record(rid, self.fd)?;
        }

        let (page_hdr, bitmap, slots) = self.page_parts_mut(guard.data_mut())?;
        slots[slot_no * self.record_size..(slot_no + 1) * self.record_size].copy_from_slice(buf);
        Bitmap::set(bitmap, slot_no);
        let num_records = page_hdr.num_records() + 1;
        page_hdr.set_num_records(num_records);

        if num_records as usize == self.records_per_page {
            // The page just filled up: unlink it from the free list.
            state.first_free_page_no = page_hdr.next_free_page_no();
            page_hdr.set_next_free_page_no(NO_PAGE);
        }

        Ok(rid)
    }

    /// Re-inserts a record into a specific, currently empty slot. Used by
    /// undo replay of a delete; the caller guarantees the slot is free.
    pub fn insert_at(&self, rid: Rid, buf: &[u8]) -> Result<()> {
        if buf.len() != self.record_size {
            return Err(DbError::internal(format!(
                "record length {} does not match record size {} of '{}'",
                buf.len(),
                self.record_size,
                self.name
            )));
        }
        let state = self.state.lock();
        self.check_page_no(rid.page_no, state.num_pages)?;
        self.check_slot_no(rid)?;
        let mut guard = self.pool.fetch_page(self.fd, rid.page_no)?;
        let (page_hdr, bitmap, slots) = self.page_parts_mut(guard.data_mut())?;
        debug_assert!(!Bitmap::is_set(bitmap, rid.slot_no as usize));

        let slot_no = rid.slot_no as usize;
        slots[slot_no * self.record_size..(slot_no + 1) * self.record_size].copy_from_slice(buf);
        Bitmap::set(bitmap, slot_no);
        page_hdr.set_num_records(page_hdr.num_records() + 1);
        Ok(())
    }

    /// Returns a copy of the record at `rid`. Acquires a shared row lock
    /// when a context is present.
    pub fn get(&self, ctx: Option<&Context>, rid: Rid) -> Result<Vec<u8>> {
        if let Some(ctx) = ctx {
            ctx.lock_shared_record(rid, self.fd)?;
        }
        let guard = self.fetch_page_handle(rid.page_no)?;
        self.check_slot_no(rid)?;
        let (_, bitmap, slots) = self.page_parts(guard.data())?;
        if !Bitmap::is_set(bitmap, rid.slot_no as usize) {
            return Err(DbError::RecordNotFound {
                page_no: rid.page_no,
                slot_no: rid.slot_no,
            });
        }
        let slot_no = rid.slot_no as usize;
        Ok(slots[slot_no * self.record_size..(slot_no + 1) * self.record_size].to_vec())
    }

    /// Overwrites the record at `rid` in place. Acquires an exclusive row
    /// lock when a context is present.
    pub fn update(&self, ctx: Option<&Context>, rid: Rid, buf: &[u8]) -> Result<()> {
        if buf.len() != self.record_size {
            return Err(DbError::internal(format!(
                "record length {} does not match record size {} of '{}'",
                buf.len(),
                self.record_size,
                self.name
            )));
        }
        if let Some(ctx) = ctx {
            ctx.lock_exclusive_record(rid, self.fd)?;
        }
        let mut guard = self.fetch_page_handle(rid.page_no)?;
        self.check_slot_no(rid)?;
        {
            let (_, bitmap, _) = self.page_parts(guard.data())?;
            if !Bitmap::is_set(bitmap, rid.slot_no as usize) {
                return Err(DbError::RecordNotFound {
                    page_no: rid.page_no,
                    slot_no: rid.slot_no,
                });
            }
        }
        let (_, _, slots) = self.page_parts_mut(guard.data_mut())?;
        let slot_no = rid.slot_no as usize;
        slots[slot_no * self.record_size..(slot_no + 1) * self.record_size].copy_from_slice(buf);
        Ok(())
    }

    /// Deletes the record at `rid`, returning the page to the free list
    /// when it was full. Acquires an exclusive row lock when a context is
    /// present.
    pub fn delete(&self, ctx: Option<&Context>, rid: Rid) -> Result<()> {
        if let Some(ctx) = ctx {
            ctx.lock_exclusive_record(rid, self.fd)?;
        }
        let mut state = self.state.lock();
        self.check_page_no(rid.page_no, state.num_pages)?;
        self.check_slot_no(rid)?;
        let mut guard = self.pool.fetch_page(self.fd, rid.page_no)?;
        {
            let (_, bitmap, _) = self.page_parts(guard.data())?;
            if !Bitmap::is_set(bitmap, rid.slot_no as usize) {
                return Err(DbError::RecordNotFound {
                    page_no: rid.page_no,
                    slot_no: rid.slot_no,
                });
            }
        }
        let (page_hdr, bitmap, _) = self.page_parts_mut(guard.data_mut())?;
        let was_full = page_hdr.num_records() as usize == self.records_per_page;
        Bitmap::reset(bitmap, rid.slot_no as usize);
        page_hdr.set_num_records(page_hdr.num_records() - 1);

        if was_full {
            // Full -> non-full transition: prepend to the free list.
            page_hdr.set_next_free_page_no(state.first_free_page_no);
            state.first_free_page_no = rid.page_no;
        }
        Ok(())
    }

    /// Cursor over the rids of every occupied slot, ascending by
    /// `(page_no, slot_no)`.
    pub fn scan(&self) -> Result<HeapScan<'_>> {
        HeapScan::new(self)
    }

    /// Pins the page, validating the page number against the data-page
    /// range.
    pub(crate) fn fetch_page_handle(&self, page_no: i32) -> Result<PageGuard<'_>> {
        let num_pages = self.state.lock().num_pages;
        self.check_page_no(page_no, num_pages)?;
        self.pool.fetch_page(self.fd, page_no)
    }

    /// First occupied slot strictly after `after` on the page, if any.
    /// Pins the page only for the duration of the lookup.
    pub(crate) fn next_occupied_slot(&self, page_no: i32, after: i32) -> Result<Option<i32>> {
        let guard = self.pool.fetch_page(self.fd, page_no)?;
        let (_, bitmap, _) = self.page_parts(guard.data())?;
        let next = Bitmap::next_bit(true, bitmap, self.records_per_page, after);
        Ok((next < self.records_per_page).then_some(next as i32))
    }

    /// Head of the free list, or a freshly allocated page when the list
    /// is empty. Full pages encountered at the head (possible after undo
    /// replay refilled a listed page) are unlinked and skipped.
    fn free_page_handle(&self, state: &mut HeapState) -> Result<(i32, PageGuard<'_>)> {
        while state.first_free_page_no != NO_PAGE {
            let page_no = state.first_free_page_no;
            let mut guard = self.pool.fetch_page(self.fd, page_no)?;
            let (num_records, next_free) = {
                let (page_hdr, _, _) = self.page_parts(guard.data())?;
                (page_hdr.num_records(), page_hdr.next_free_page_no())
            };
            if (num_records as usize) < self.records_per_page {
                return Ok((page_no, guard));
            }
            let (page_hdr, _, _) = self.page_parts_mut(guard.data_mut())?;
            page_hdr.set_next_free_page_no(NO_PAGE);
            state.first_free_page_no = next_free;
        }

        let mut guard = self.pool.new_page(self.fd)?;
        let page_no = guard.page_no();
        {
            let (page_hdr, _, _) = self.page_parts_mut(guard.data_mut())?;
            page_hdr.set_num_records(0);
            page_hdr.set_next_free_page_no(state.first_free_page_no);
        }
        state.first_free_page_no = page_no;
        state.num_pages += 1;
        debug!("heap file '{}' grew to page {}", self.name, page_no);
        Ok((page_no, guard))
    }

    fn check_page_no(&self, page_no: i32, num_pages: i32) -> Result<()> {
        if page_no < FIRST_RECORD_PAGE || page_no >= num_pages {
            return Err(DbError::PageNotExist {
                file: self.name.clone(),
                page_no,
            });
        }
        Ok(())
    }

    fn check_slot_no(&self, rid: Rid) -> Result<()> {
        if rid.slot_no < 0 || rid.slot_no as usize >= self.records_per_page {
            return Err(DbError::RecordNotFound {
                page_no: rid.page_no,
                slot_no: rid.slot_no,
            });
        }
        Ok(())
    }

    fn page_parts<'b>(&self, data: &'b [u8]) -> Result<(&'b HeapPageHeader, &'b [u8], &'b [u8])> {
        let (hdr_bytes, rest) = data.split_at(HEAP_PAGE_HEADER_SIZE);
        let hdr = parse_header::<HeapPageHeader>(hdr_bytes, "HeapPageHeader")?;
        let (bitmap, slots) = rest.split_at(self.bitmap_size);
        Ok((hdr, bitmap, slots))
    }

    fn page_parts_mut<'b>(
        &self,
        data: &'b mut [u8],
    ) -> Result<(&'b mut HeapPageHeader, &'b mut [u8], &'b mut [u8])> {
        let (hdr_bytes, rest) = data.split_at_mut(HEAP_PAGE_HEADER_SIZE);
        let hdr = parse_header_mut::<HeapPageHeader>(hdr_bytes, "HeapPageHeader")?;
        let (bitmap, slots) = rest.split_at_mut(self.bitmap_size);
        Ok((hdr, bitmap, slots))
    }
}

/// Computes how many records of `record_size` bytes fit in a page next to
/// the header and the occupancy bitmap.
fn page_geometry(record_size: usize) -> Result<(usize, usize)> {
    let avail = PAGE_SIZE - HEAP_PAGE_HEADER_SIZE;
    if record_size == 0 || record_size > avail - 1 {
        return Err(DbError::internal(format!(
            "record size {record_size} does not fit a {PAGE_SIZE}-byte page"
        )));
    }
    let mut n = (avail * 8) / (record_size * 8 + 1);
    while n > 0 && n.div_ceil(8) + n * record_size > avail {
        n -= 1;
    }
    if n == 0 {
        return Err(DbError::internal(format!(
            "record size {record_size} does not fit a {PAGE_SIZE}-byte page"
        )));
    }
    Ok((n, n.div_ceil(8)))
}
