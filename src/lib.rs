//! # RMDB - Relational Storage Engine Core
//!
//! RMDB persists tables on disk as paged heap files, maintains secondary
//! B+ tree indexes over them, and coordinates concurrent transactions
//! through a multi-granularity lock manager with undo-based rollback.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │   Executor glue (Catalog / Table)        │
//! ├──────────────────┬──────────────────────┤
//! │   Transactions   │   Lock Manager        │
//! ├──────────────────┴──────────────────────┤
//! │   Record Manager     │   B+ Tree Index   │
//! ├──────────────────────┴──────────────────┤
//! │   Buffer Pool (pin/unpin page cache)     │
//! ├─────────────────────────────────────────┤
//! │   Disk Manager (paged files)             │
//! └─────────────────────────────────────────┘
//! ```
//!
//! The storage foundation hands out RAII page pins; the record manager
//! lays fixed-size records into slotted pages behind a free-page list;
//! the index keeps a leaf-linked B+ tree per indexed column set; the
//! transaction layer provides strict two-phase locking with no-wait
//! deadlock prevention and reverse undo replay on abort. SQL parsing,
//! planning, and the network surface live outside this crate.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use rmdb::{BufferPool, Catalog, ColType, DiskManager, Value};
//!
//! # fn main() -> rmdb::Result<()> {
//! let disk = Arc::new(DiskManager::new());
//! let pool = Arc::new(BufferPool::new(Arc::clone(&disk), 1024)?);
//!
//! Catalog::create_database("./demo_db")?;
//! let catalog = Catalog::open(disk, pool, "./demo_db")?;
//!
//! let users = catalog.create_table(
//!     "users",
//!     &[("id", ColType::Int, 4), ("name", ColType::String, 16)],
//! )?;
//! catalog.create_index("users", &["id"])?;
//!
//! let rid = users.insert(None, &[Value::Int(1), Value::Str("ada".into())])?;
//! assert_eq!(
//!     users.get_values(None, rid)?,
//!     vec![Value::Int(1), Value::Str("ada".into())]
//! );
//! # Ok(())
//! # }
//! ```

pub mod errors;
pub mod index;
pub mod record;
pub mod storage;
pub mod system;
pub mod txn;
pub mod types;

pub use errors::{AbortReason, DbError, Result};
pub use index::{Iid, IndexCol, IndexHandle, IndexScan, IndexSchema};
pub use record::{HeapFile, HeapScan};
pub use storage::{BufferPool, DiskManager, PageGuard, PAGE_SIZE};
pub use system::{Catalog, Table};
pub use txn::{
    Context, LockDataId, LockManager, LockMode, Transaction, TransactionManager, TxnState,
    WriteRecord,
};
pub use types::{ColMeta, ColType, Rid, Value, NO_PAGE};
