//! One open table: heap file, secondary indexes, and the column layout
//! used to build and pick apart record images.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::errors::{DbError, Result};
use crate::index::{IndexHandle, IndexScan};
use crate::record::{HeapFile, HeapScan};
use crate::txn::{Context, WriteRecord};
use crate::types::{ColMeta, Rid, Value};

/// A secondary index attached to a table: which columns it covers (by
/// position in the table's layout) and the open tree behind it.
pub struct TableIndex {
    pub(crate) name: String,
    pub(crate) path: PathBuf,
    pub(crate) col_idxs: Vec<usize>,
    pub(crate) handle: Arc<IndexHandle>,
}

impl TableIndex {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> &Arc<IndexHandle> {
        &self.handle
    }
}

pub struct Table {
    name: String,
    path: PathBuf,
    cols: Vec<ColMeta>,
    record_size: usize,
    heap: Arc<HeapFile>,
    indexes: RwLock<Vec<TableIndex>>,
}

impl Table {
    pub(crate) fn new(
        name: String,
        path: PathBuf,
        cols: Vec<ColMeta>,
        heap: Arc<HeapFile>,
    ) -> Self {
        let record_size = cols.iter().map(|c| c.len).sum();
        Self {
            name,
            path,
            cols,
            record_size,
            heap,
            indexes: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn cols(&self) -> &[ColMeta] {
        &self.cols
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    pub fn heap(&self) -> &Arc<HeapFile> {
        &self.heap
    }

    /// Position of a column by name.
    pub fn col_index(&self, name: &str) -> Result<usize> {
        self.cols
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| DbError::ColumnNotFound(name.to_string()))
    }

    pub(crate) fn indexes(&self) -> &RwLock<Vec<TableIndex>> {
        &self.indexes
    }

    /// Runs `f` over the index covering exactly `col_names`.
    pub fn with_index<R>(
        &self,
        col_names: &[&str],
        f: impl FnOnce(&TableIndex) -> Result<R>,
    ) -> Result<R> {
        let col_idxs = self.resolve_cols(col_names)?;
        let indexes = self.indexes.read();
        let index = indexes
            .iter()
            .find(|i| i.col_idxs == col_idxs)
            .ok_or_else(|| DbError::IndexNotFound(col_names.join(", ")))?;
        f(index)
    }

    pub(crate) fn resolve_cols(&self, col_names: &[&str]) -> Result<Vec<usize>> {
        col_names.iter().map(|n| self.col_index(n)).collect()
    }

    /// Encodes a row of values into a record image, checking arity and
    /// types against the column layout.
    pub fn build_record(&self, values: &[Value]) -> Result<Vec<u8>> {
        if values.len() != self.cols.len() {
            return Err(DbError::InvalidValueCount);
        }
        let mut record = vec![0u8; self.record_size];
        for (value, col) in values.iter().zip(&self.cols) {
            value.encode_into(col, &mut record[col.offset..col.offset + col.len])?;
        }
        Ok(record)
    }

    /// Decodes a record image back into owned values.
    pub fn decode_record(&self, record: &[u8]) -> Vec<Value> {
        self.cols
            .iter()
            .map(|col| Value::decode(col, &record[col.offset..col.offset + col.len]))
            .collect()
    }

    /// Concatenates the indexed columns of a record into an index key.
    pub(crate) fn extract_key(&self, record: &[u8], index: &TableIndex) -> Vec<u8> {
        let mut key = Vec::with_capacity(index.handle.schema().key_size());
        for &idx in &index.col_idxs {
            let col = &self.cols[idx];
            key.extend_from_slice(&record[col.offset..col.offset + col.len]);
        }
        key
    }

    /// Inserts a row: IX on the table, X on the new rid, undo entry,
    /// then an entry in every index.
    pub fn insert(&self, ctx: Option<&Context>, values: &[Value]) -> Result<Rid> {
        let record = self.build_record(values)?;
        if let Some(ctx) = ctx {
            ctx.lock_ix_table(self.heap.fd())?;
        }
        let rid = self.heap.insert(ctx, &record)?;
        if let Some(ctx) = ctx {
            ctx.append_write(WriteRecord::Insert {
                table: self.name.clone(),
                rid,
            });
        }
        for index in self.indexes.read().iter() {
            // Duplicate keys leave the index untouched; uniqueness is
            // the planner's concern, not the storage engine's.
            self.extract_and_insert(index, &record, rid)?;
        }
        Ok(rid)
    }

    /// Reads a row image: IS on the table, S on the row.
    pub fn get(&self, ctx: Option<&Context>, rid: Rid) -> Result<Vec<u8>> {
        if let Some(ctx) = ctx {
            ctx.lock_is_table(self.heap.fd())?;
        }
        self.heap.get(ctx, rid)
    }

    /// Reads a row as decoded values.
    pub fn get_values(&self, ctx: Option<&Context>, rid: Rid) -> Result<Vec<Value>> {
        Ok(self.decode_record(&self.get(ctx, rid)?))
    }

    /// Deletes a row: IX on the table, S-then-X on the row, index
    /// entries out first, undo entry after the heap delete.
    pub fn delete(&self, ctx: Option<&Context>, rid: Rid) -> Result<()> {
        if let Some(ctx) = ctx {
            ctx.lock_ix_table(self.heap.fd())?;
        }
        let record = self.heap.get(ctx, rid)?;
        for index in self.indexes.read().iter() {
            index.handle.delete(&self.extract_key(&record, index))?;
        }
        self.heap.delete(ctx, rid)?;
        if let Some(ctx) = ctx {
            ctx.append_write(WriteRecord::Delete {
                table: self.name.clone(),
                rid,
                record,
            });
        }
        Ok(())
    }

    /// Updates a row in place: IX on the table, X on the row, index
    /// entries moved for every changed key, undo entry carrying the
    /// pre-image.
    pub fn update(&self, ctx: Option<&Context>, rid: Rid, values: &[Value]) -> Result<()> {
        let new_record = self.build_record(values)?;
        if let Some(ctx) = ctx {
            ctx.lock_ix_table(self.heap.fd())?;
        }
        let old_record = self.heap.get(ctx, rid)?;
        self.heap.update(ctx, rid, &new_record)?;
        for index in self.indexes.read().iter() {
            let old_key = self.extract_key(&old_record, index);
            let new_key = self.extract_key(&new_record, index);
            if old_key != new_key {
                index.handle.delete(&old_key)?;
                self.extract_and_insert(index, &new_record, rid)?;
            }
        }
        if let Some(ctx) = ctx {
            ctx.append_write(WriteRecord::Update {
                table: self.name.clone(),
                rid,
                old_record,
            });
        }
        Ok(())
    }

    /// Cursor over every row position: IS on the table; per-row S locks
    /// come from the `get` calls the caller makes.
    pub fn scan(&self, ctx: Option<&Context>) -> Result<HeapScan<'_>> {
        if let Some(ctx) = ctx {
            ctx.lock_is_table(self.heap.fd())?;
        }
        self.heap.scan()
    }

    /// Ordered cursor over `[lower, upper)` of the index covering
    /// `col_names`.
    pub fn index_scan(
        &self,
        ctx: Option<&Context>,
        col_names: &[&str],
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
    ) -> Result<(Arc<IndexHandle>, Vec<Rid>)> {
        if let Some(ctx) = ctx {
            ctx.lock_is_table(self.heap.fd())?;
        }
        self.with_index(col_names, |index| {
            let handle = Arc::clone(&index.handle);
            let mut rids = Vec::new();
            let mut scan: IndexScan<'_> = handle.range_scan(lower, upper)?;
            while !scan.is_end() {
                rids.push(scan.rid()?);
                scan.next()?;
            }
            Ok((Arc::clone(&index.handle), rids))
        })
    }

    fn extract_and_insert(&self, index: &TableIndex, record: &[u8], rid: Rid) -> Result<()> {
        let key = self.extract_key(record, index);
        index.handle.insert(&key, rid)?;
        Ok(())
    }

    /// Flushes the heap and every index.
    pub fn flush(&self) -> Result<()> {
        self.heap.flush()?;
        for index in self.indexes.read().iter() {
            index.handle.flush()?;
        }
        Ok(())
    }

    /// Closes the heap and every index.
    pub fn close(&self) -> Result<()> {
        for index in self.indexes.read().iter() {
            index.handle.close()?;
        }
        self.heap.close()
    }
}
