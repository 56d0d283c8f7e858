//! # System Glue
//!
//! The executor-facing layer that ties the storage pieces together:
//! [`Table`] couples one heap file with its secondary indexes and column
//! layout, and [`Catalog`] is the registry of open tables plus the
//! database-directory lifecycle.
//!
//! This is where the locking and undo discipline of data-manipulation
//! operations lives: every mutation takes the table-level intention lock
//! before the row lock, appends its undo entry only after the heap
//! mutation succeeded, and keeps every index in step with the heap.

mod catalog;
mod table;

pub use catalog::Catalog;
pub use table::{Table, TableIndex};
