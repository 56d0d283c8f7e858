//! # Storage Layer
//!
//! The foundation the record manager and the index build on: a block
//! device abstraction ([`DiskManager`]) that reads and writes fixed-size
//! pages of named files, and a pin-count page cache ([`BufferPool`]) that
//! owns the page buffers in memory.
//!
//! ## Ownership Model
//!
//! Pages are owned by the buffer pool. Callers obtain a [`PageGuard`],
//! which pins the page for its lifetime; the guard's `data` / `data_mut`
//! accessors expose the raw page bytes, and `data_mut` marks the page
//! dirty. Dropping the guard unpins. Nothing above this layer holds a
//! reference into a page buffer past the guard.
//!
//! ```text
//! HeapFile / IndexHandle
//!        │ fetch_page / new_page
//!        ▼
//!   BufferPool ── miss ──► DiskManager ──► OS file
//!        │                      ▲
//!        └── dirty eviction ────┘
//! ```
//!
//! ## Page Size
//!
//! All storage uses 4KB (4096 byte) pages. Page 0 of every file is a
//! file-type specific header; data pages start at 1.

mod cache;
mod disk;

pub use cache::{BufferPool, PageGuard};
pub use disk::{DiskManager, FileId};

use crate::errors::{DbError, Result};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Size of every page in every file.
pub const PAGE_SIZE: usize = 4096;

/// A page address: which open file, which page within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId {
    pub fd: FileId,
    pub page_no: i32,
}

impl PageId {
    pub fn new(fd: FileId, page_no: i32) -> Self {
        Self { fd, page_no }
    }
}

/// Parses a zerocopy struct from the front of a byte slice with size
/// validation.
#[inline]
pub(crate) fn parse_header<'a, T: FromBytes + KnownLayout + Immutable>(
    bytes: &'a [u8],
    type_name: &str,
) -> Result<&'a T> {
    let size = std::mem::size_of::<T>();
    if bytes.len() < size {
        return Err(DbError::internal(format!(
            "buffer too small for {}: {} < {}",
            type_name,
            bytes.len(),
            size
        )));
    }
    T::ref_from_bytes(&bytes[..size])
        .map_err(|e| DbError::internal(format!("failed to parse {type_name}: {e:?}")))
}

/// Parses a mutable zerocopy struct from the front of a byte slice with
/// size validation.
#[inline]
pub(crate) fn parse_header_mut<'a, T: FromBytes + KnownLayout + IntoBytes>(
    bytes: &'a mut [u8],
    type_name: &str,
) -> Result<&'a mut T> {
    let size = std::mem::size_of::<T>();
    if bytes.len() < size {
        return Err(DbError::internal(format!(
            "buffer too small for {}: {} < {}",
            type_name,
            bytes.len(),
            size
        )));
    }
    T::mut_from_bytes(&mut bytes[..size])
        .map_err(|e| DbError::internal(format!("failed to parse {type_name}: {e:?}")))
}
