//! # Record Manager
//!
//! Heap files of fixed-size records on slotted pages.
//!
//! ## File Layout
//!
//! ```text
//! Page 0            File header: record_size, records_per_page,
//!                   bitmap_size, first_free_page_no, num_pages
//! Page 1..N         Data pages:
//!                   +--------------------------+
//!                   | Page header (8B)         |  num_records,
//!                   |                          |  next_free_page_no
//!                   +--------------------------+
//!                   | Occupancy bitmap         |  1 bit per slot
//!                   +--------------------------+
//!                   | Slot 0 | Slot 1 | ...    |  record_size each
//!                   +--------------------------+
//! ```
//!
//! A slot holds a valid record iff its bitmap bit is set; `num_records`
//! always equals the bitmap's popcount. Pages with at least one free slot
//! are chained through `next_free_page_no` into a singly linked free list
//! headed by the file header's `first_free_page_no`.
//!
//! ## Locking
//!
//! Operations take an optional transaction context. When present, reads
//! acquire a shared row lock and mutations an exclusive row lock before
//! touching the page; the table-level intention lock is the caller's
//! obligation. A `None` context (recovery, undo replay) skips locking
//! entirely.

mod bitmap;
mod heap_file;
mod scan;

pub use heap_file::{HeapFile, FIRST_RECORD_PAGE};
pub use scan::HeapScan;
