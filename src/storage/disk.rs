//! # Disk Manager
//!
//! Block device abstraction over named page files. Every open file is
//! addressed by a small integer [`FileId`]; pages are read and written
//! whole via positional I/O, so no seek state is shared between threads.
//!
//! ## Page Number Allocation
//!
//! Each open file carries a monotonically increasing page counter, seeded
//! from the physical file size on open. `allocate_page_no` hands out the
//! next number without touching the file: the allocator may run ahead of
//! physical writes, so `read_page` zero-fills anything past end-of-file.
//! Freed page numbers are never reissued here; recycling is the concern
//! of the structures above (the heap file's free list) or nobody's (the
//! index, which is allocate-only).
//!
//! ## Thread Safety
//!
//! The file table is behind an `RwLock`; per-file handles are `Arc`ed out
//! of it so concurrent reads and writes to different (or the same) files
//! proceed without holding the table lock during I/O.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use log::debug;
use parking_lot::RwLock;

use super::PAGE_SIZE;
use crate::errors::{DbError, Result};

/// Handle to an open page file.
pub type FileId = i32;

struct OpenFile {
    file: File,
    path: PathBuf,
    next_page_no: AtomicI32,
}

#[derive(Default)]
struct FileTable {
    files: HashMap<FileId, Arc<OpenFile>>,
    by_path: HashMap<PathBuf, FileId>,
    next_fd: FileId,
}

pub struct DiskManager {
    table: RwLock<FileTable>,
}

impl DiskManager {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(FileTable::default()),
        }
    }

    /// Creates an empty page file. Fails if the path already exists.
    pub fn create_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path.as_ref())?;
        debug!("created file '{}'", path.as_ref().display());
        Ok(())
    }

    /// Removes a page file. The file must not be open.
    pub fn destroy_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        {
            let table = self.table.read();
            if table.by_path.contains_key(path) {
                return Err(DbError::internal(format!(
                    "cannot destroy open file '{}'",
                    path.display()
                )));
            }
        }
        std::fs::remove_file(path)?;
        debug!("destroyed file '{}'", path.display());
        Ok(())
    }

    /// Opens an existing page file and returns its descriptor. Opening a
    /// file twice without closing it is an error.
    pub fn open_file<P: AsRef<Path>>(&self, path: P) -> Result<FileId> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let size = file.metadata()?.len();
        let pages = (size as usize).div_ceil(PAGE_SIZE) as i32;

        let mut table = self.table.write();
        if table.by_path.contains_key(&path) {
            return Err(DbError::internal(format!(
                "file '{}' is already open",
                path.display()
            )));
        }
        let fd = table.next_fd;
        table.next_fd += 1;
        table.files.insert(
            fd,
            Arc::new(OpenFile {
                file,
                path: path.clone(),
                next_page_no: AtomicI32::new(pages),
            }),
        );
        table.by_path.insert(path, fd);
        Ok(fd)
    }

    pub fn close_file(&self, fd: FileId) -> Result<()> {
        let mut table = self.table.write();
        let open = table
            .files
            .remove(&fd)
            .ok_or_else(|| DbError::internal(format!("close of unknown fd {fd}")))?;
        table.by_path.remove(&open.path);
        open.file.sync_all()?;
        Ok(())
    }

    pub fn is_open<P: AsRef<Path>>(&self, path: P) -> bool {
        self.table.read().by_path.contains_key(path.as_ref())
    }

    /// Name of the file behind `fd`, for error context.
    pub fn file_name(&self, fd: FileId) -> String {
        self.table
            .read()
            .files
            .get(&fd)
            .map(|f| f.path.display().to_string())
            .unwrap_or_else(|| format!("<fd {fd}>"))
    }

    fn handle(&self, fd: FileId) -> Result<Arc<OpenFile>> {
        self.table
            .read()
            .files
            .get(&fd)
            .cloned()
            .ok_or_else(|| DbError::internal(format!("unknown fd {fd}")))
    }

    /// Reads one page into `buf`. A read past the physical end of the
    /// file yields zeroes for the missing tail.
    pub fn read_page(&self, fd: FileId, page_no: i32, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);
        let open = self.handle(fd)?;
        let offset = page_no as u64 * PAGE_SIZE as u64;
        let mut read = 0;
        while read < buf.len() {
            match open.file.read_at(&mut buf[read..], offset + read as u64) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        buf[read..].fill(0);
        Ok(())
    }

    /// Writes one page.
    pub fn write_page(&self, fd: FileId, page_no: i32, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);
        let open = self.handle(fd)?;
        let offset = page_no as u64 * PAGE_SIZE as u64;
        open.file.write_all_at(buf, offset)?;
        Ok(())
    }

    /// Hands out the next unused page number of the file.
    pub fn allocate_page_no(&self, fd: FileId) -> Result<i32> {
        let open = self.handle(fd)?;
        Ok(open.next_page_no.fetch_add(1, Ordering::SeqCst))
    }

    /// Current page-number watermark (one past the highest allocated).
    pub fn page_count(&self, fd: FileId) -> Result<i32> {
        let open = self.handle(fd)?;
        Ok(open.next_page_no.load(Ordering::SeqCst))
    }

    /// Resets the page-number watermark; used when a file handle knows
    /// the authoritative count from its own header.
    pub fn set_page_count(&self, fd: FileId, pages: i32) -> Result<()> {
        let open = self.handle(fd)?;
        open.next_page_no.store(pages, Ordering::SeqCst);
        Ok(())
    }

    pub fn sync_file(&self, fd: FileId) -> Result<()> {
        let open = self.handle(fd)?;
        open.file.sync_all()?;
        Ok(())
    }
}

impl Default for DiskManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_open_close_destroy() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.dat");
        let dm = DiskManager::new();

        dm.create_file(&path).unwrap();
        assert!(dm.create_file(&path).is_err());

        let fd = dm.open_file(&path).unwrap();
        assert!(dm.is_open(&path));
        assert!(dm.destroy_file(&path).is_err());

        dm.close_file(fd).unwrap();
        dm.destroy_file(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn page_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.dat");
        let dm = DiskManager::new();
        dm.create_file(&path).unwrap();
        let fd = dm.open_file(&path).unwrap();

        let mut page = [0u8; PAGE_SIZE];
        page[0] = 0xAB;
        page[PAGE_SIZE - 1] = 0xCD;
        dm.write_page(fd, 3, &page).unwrap();

        let mut out = [0xFFu8; PAGE_SIZE];
        dm.read_page(fd, 3, &mut out).unwrap();
        assert_eq!(out[0], 0xAB);
        assert_eq!(out[PAGE_SIZE - 1], 0xCD);
    }

    #[test]
    fn read_past_eof_is_zero_filled() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.dat");
        let dm = DiskManager::new();
        dm.create_file(&path).unwrap();
        let fd = dm.open_file(&path).unwrap();

        let mut out = [0xFFu8; PAGE_SIZE];
        dm.read_page(fd, 10, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn page_numbers_are_monotonic_and_seeded_from_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.dat");
        let dm = DiskManager::new();
        dm.create_file(&path).unwrap();
        let fd = dm.open_file(&path).unwrap();

        assert_eq!(dm.allocate_page_no(fd).unwrap(), 0);
        assert_eq!(dm.allocate_page_no(fd).unwrap(), 1);
        dm.write_page(fd, 1, &[0u8; PAGE_SIZE]).unwrap();
        dm.close_file(fd).unwrap();

        let fd = dm.open_file(&path).unwrap();
        assert_eq!(dm.allocate_page_no(fd).unwrap(), 2);
        dm.close_file(fd).unwrap();
    }

    #[test]
    fn double_open_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.dat");
        let dm = DiskManager::new();
        dm.create_file(&path).unwrap();
        let fd = dm.open_file(&path).unwrap();
        assert!(dm.open_file(&path).is_err());
        dm.close_file(fd).unwrap();
    }
}
